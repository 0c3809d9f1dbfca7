//! Genstore.
//!
//! Genstore serves artifacts from a file-system cache, and generates missing artifacts on
//! demand by running a configured command. Concurrent requests for the same artifact share a
//! single generation, and receive its output while it is still being written.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod backend;
mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
