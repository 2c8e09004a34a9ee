use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Outcome of a failed read from an item source.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("timed out waiting for the next item")]
    TimedOut,
    #[error("item source failed: {0}")]
    Fatal(#[source] BoxError),
}

impl SourceError {
    pub fn fatal(error: impl Into<BoxError>) -> Self {
        SourceError::Fatal(error.into())
    }
}

/// Asynchronous failures carried through the error funnel.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("failed to establish the item source: {0}")]
    Connect(#[source] BoxError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("batch handler failed on a batch of {size} items: {reason}")]
    Handler { size: usize, reason: String },
}

/// Enumeration of errors returned by the top-level service lifecycle.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("failed to install termination signal handler: {0}")]
    Signal(#[from] std::io::Error),
}
