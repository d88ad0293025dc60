use talent_common::job::{JobKind, TransitionError};
use talent_common::types::Language;
use thiserror::Error;

/// Infrastructure faults inside the sandbox. These never leave
/// [`crate::engine`]; they are folded into a failed `ExecutionResult`.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("source code exceeds maximum size of {0} bytes")]
    SourceTooLarge(usize),

    #[error("failed to prepare source file: {0}")]
    SourceFile(#[from] std::io::Error),

    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("sandbox subsystem unreachable: {0}")]
    Unreachable(String),

    #[error("timed out pulling image {image} after {timeout_ms}ms")]
    PullTimeout { image: String, timeout_ms: u64 },
}

/// Run-level failure of the test-case runner. Per-test failures are data.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("sandbox subsystem unavailable: {0}")]
    SandboxUnavailable(String),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker refused connection: {0}")]
    ConnectionRefused(String),

    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command failed: {0}")]
    Command(String),

    #[error("job record is corrupt: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    /// Whether the broker itself is gone, as opposed to one command failing.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, BrokerError::ConnectionRefused(_) | BrokerError::Connection(_))
    }
}

impl From<redis::RedisError> for BrokerError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() {
            BrokerError::ConnectionRefused(e.to_string())
        } else if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
            BrokerError::Connection(e.to_string())
        } else {
            BrokerError::Command(e.to_string())
        }
    }
}

/// Failure of a job processor. Counted toward the job's retry budget.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("payload does not belong on queue {0}")]
    WrongQueue(JobKind),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Run(#[from] RunError),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("fallback processing failed on {queue}: {source}")]
    Fallback {
        queue: JobKind,
        #[source]
        source: ProcessError,
    },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("queue service is shut down")]
    ShutDown,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        CacheError::Backend(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("problem not found: {0}")]
    ProblemNotFound(String),

    #[error("language {language} is not allowed for problem {problem_id}")]
    LanguageNotAllowed { language: Language, problem_id: String },

    #[error("problem store error: {0}")]
    ProblemStore(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
