use thiserror::Error;

/// Coarse error classification surfaced by the scheduler to the caller.
///
/// Finer detail stays in the `tracing` logs; this enum only distinguishes
/// the classes callers need to branch on (retryable vs fatal, skip vs
/// abort).
#[derive(Debug, Error)]
pub enum PushError {
    #[error("invalid store path: {0}")]
    InputInvalid(String),

    #[error("io error: {0}")]
    IoFailed(#[from] std::io::Error),

    #[error("transport error after retries exhausted: {0}")]
    TransportFailed(String),

    #[error("protocol error: {0}")]
    ProtocolUnexpected(String),

    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, PushError>;
