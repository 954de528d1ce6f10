use lcms_infra::barriers::BarrierError;
use lcms_infra::jobs::{JobKind, QueueError};
use lcms_infra::outcomes::OutcomeStoreError;
use lcms_infra::{LockError, ResultStoreError};

/// Errors raised while running a bundle orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Results(#[from] ResultStoreError),
    #[error(transparent)]
    Outcomes(#[from] OutcomeStoreError),
    #[error(transparent)]
    Barrier(#[from] BarrierError),
    /// Render, storage or curriculum lookup failed.
    #[error(transparent)]
    External(#[from] anyhow::Error),
    #[error("bundle wait abandoned: {0}")]
    DeadlineExceeded(String),
    #[error("unexpected job kind for this bundle: {0}")]
    UnexpectedKind(JobKind),
}

impl BundleError {
    /// Human-readable messages, outermost first.
    ///
    /// External errors contribute their whole context chain.
    pub fn messages(&self) -> Vec<String> {
        match self {
            BundleError::External(err) => err.chain().map(|cause| cause.to_string()).collect(),
            other => {
                let mut messages = vec![other.to_string()];
                let mut source = std::error::Error::source(other);
                while let Some(cause) = source {
                    let message = cause.to_string();
                    if messages.last() != Some(&message) {
                        messages.push(message);
                    }
                    source = cause.source();
                }
                messages
            }
        }
    }
}

/// Errors raised by a child artifact job. All of them are retried by the
/// queue.
#[derive(Debug, thiserror::Error)]
pub enum ChildJobError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Results(#[from] ResultStoreError),
    #[error(transparent)]
    Outcomes(#[from] OutcomeStoreError),
    #[error(transparent)]
    Barrier(#[from] BarrierError),
    #[error(transparent)]
    External(#[from] anyhow::Error),
    #[error("{0} is not a child artifact job kind")]
    NotAChild(JobKind),
}

impl ChildJobError {
    /// Message with the full context chain of external failures.
    pub fn message(&self) -> String {
        match self {
            ChildJobError::External(err) => format!("{err:#}"),
            other => other.to_string(),
        }
    }
}
