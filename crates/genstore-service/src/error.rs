use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::publisher::Terminal;

/// Why a generation did not produce a stable file.
///
/// A generation runs once for all concurrent requesters of an object, and every one of them
/// receives a clone of its error.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    /// The backend failed producing the artifact.
    #[error("worker failed generating")]
    Generate(#[source] Arc<io::Error>),
    /// The backend panicked while producing the artifact.
    #[error("worker panicked while generating")]
    Panicked,
    /// The temporary file could not be closed after generating.
    #[error("worker failed closing file")]
    Close(#[source] Arc<io::Error>),
    /// The temporary file could not be moved to stable storage.
    #[error("worker failed renaming file")]
    Persist(#[source] Arc<io::Error>),
    /// The worker stopped without a result, for instance because it could not be started.
    #[error("worker aborted")]
    Aborted,
}

/// Errors returned by [`CacheEngine::obtain_item`](crate::CacheEngine::obtain_item).
#[derive(Debug, Error)]
pub enum ObtainError {
    /// The stable file exists but could not be opened.
    #[error("failed opening cached file")]
    Open(#[source] io::Error),
    /// No temporary file could be allocated for a new generation.
    #[error("failed making temporary file")]
    TempFile(#[source] io::Error),
    /// Copying to the destination failed.
    #[error("failed copying object")]
    Copy(#[source] io::Error),
    /// The generation this request joined failed.
    #[error("generation failed")]
    Generation(#[from] GenerationError),
    /// A forced close interrupted the stream, but the stream had not finished successfully.
    #[error("stream in unexpected state after forced close: {}", display_terminal(.terminal))]
    UnexpectedState {
        terminal: Option<Terminal>,
        #[source]
        cause: Option<Arc<io::Error>>,
    },
    /// The stable file could not be resumed after a forced close.
    #[error("failed resuming from cached file")]
    Reopen(#[source] io::Error),
    /// Generation succeeded, but the stable file did not exist afterwards.
    #[error("cached file missing after successful generation")]
    MissingAfterGeneration,
}

fn display_terminal(terminal: &Option<Terminal>) -> String {
    match terminal {
        Some(terminal) => terminal.to_string(),
        None => "still open".into(),
    }
}

impl ObtainError {
    pub(crate) fn unexpected_state(terminal: Option<Terminal>) -> Self {
        let cause = match &terminal {
            Some(Terminal::Cancelled(err)) => Some(Arc::clone(err)),
            _ => None,
        };
        Self::UnexpectedState { terminal, cause }
    }

    /// Returns `true` for errors that indicate a broken internal invariant rather than an
    /// ordinary I/O or generation failure.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            ObtainError::UnexpectedState { .. } | ObtainError::MissingAfterGeneration
        )
    }
}
