use thiserror::Error;

/// Errors produced by the bridge protocol and configuration layers.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("protected type: {0}")]
    Protected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("client already bound: {0}")]
    AlreadyBound(String),

    #[error("binding conflict: {0}")]
    Conflict(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type BridgeResult<T> = Result<T, BridgeError>;
