use thiserror::Error;

/// Errors that can occur in the driver
#[derive(Error, Debug)]
pub enum EipError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("hostname resolution failed: {0}")]
    Resolve(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("session handshake failed: {0}")]
    Handshake(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("CIP type error: {0}")]
    Type(String),

    #[error("no valid data for tag {0}")]
    NoData(String),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, EipError>;
