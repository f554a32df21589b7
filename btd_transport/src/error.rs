use thiserror::Error;

/// Crate-wide error kind for the transport object graph, matching the
/// propagation policy: constructors fail atomically, release absorbs
/// `MediatorGone`, codec switch only reports `Io` on a verified
/// mismatch, thread/task cancel errors are logged rather than raised.
#[derive(Clone, Error, Debug)]
pub enum TransportError {
    #[error("operation not supported for this transport's profile/codec combination")]
    NotSupported,
    #[error("io error: {0}")]
    Io(TransportInternalError),
    #[error("no worker thread is running for this PCM endpoint")]
    NoThread,
    #[error("invalid argument: {0}")]
    InvalidArg(String),
    #[error("mediator is gone")]
    MediatorGone,
    #[error("internal error: {0}")]
    Internal(TransportInternalError),
}

#[derive(Clone, Error, Debug)]
pub enum TransportInternalError {
    #[error("io: {kind}; {message}")]
    Io {
        kind: std::io::ErrorKind,
        message: String,
    },
    #[error("core: {0}")]
    Core(btd_core::Error),
    #[error("worker task join failed: {0}")]
    JoinFailed(String),
    #[error("mediator rpc failed: {0}")]
    Mediator(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(TransportInternalError::Io {
            kind: err.kind(),
            message: err.to_string(),
        })
    }
}

impl From<btd_core::Error> for TransportError {
    fn from(err: btd_core::Error) -> Self {
        Self::Internal(TransportInternalError::Core(err))
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
