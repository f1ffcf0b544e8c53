use thiserror::Error;

pub type LockstepResult<T> = Result<T, LockstepError>;

#[derive(Debug, Error)]
pub enum LockstepError {
    #[error("registration is not open")]
    RegistrationClosed,

    #[error("not enough workers registered: {registered} of {required}")]
    InsufficientWorkers { registered: usize, required: u64 },

    #[error("no workers left in the pool")]
    NoWorkersLeft,

    #[error("worker {0} lost")]
    WorkerLost(String),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}
