//! On-demand cache-or-generate engine for byte-stream artifacts.
//!
//! See [`engine`] for an explanation of how concurrent requests for the same object share a
//! single generation.

#[macro_use]
pub mod metrics;

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod publisher;
pub mod utils;

pub use backend::{Backend, CacheDir, CopyDestination, CopyError, WriteDestination};
pub use engine::{CacheEngine, RemovalGuard};
pub use error::{GenerationError, ObtainError};
pub use publisher::{StreamPublisher, StreamReader, Terminal};
