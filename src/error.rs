//! Crate-wide error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpsdError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("errno: {0}")]
    Errno(#[from] nix::Error),

    #[error("task join: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("framing: {0}")]
    Framing(String),

    #[error("checksum failed for {0} frame")]
    Checksum(&'static str),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("config: {0}")]
    Config(String),

    #[error("device: {0}")]
    Device(String),
}

pub type Result<T> = std::result::Result<T, GpsdError>;
