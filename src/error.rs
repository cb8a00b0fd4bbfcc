use thiserror::Error;

use crate::archive::ArchiveError;

#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job {0} is not complete")]
    JobNotTerminal(String),

    #[error("invalid bundle: {0}")]
    InvalidBundle(String),

    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("queue is closed")]
    QueueClosed,

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ForgeError>;
