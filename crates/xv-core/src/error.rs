use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("password cannot be empty")]
    EmptyPassword,

    #[error("password must be at least eight characters long")]
    InvalidPassword,

    #[error("invalid master key")]
    InvalidKey,

    #[error("invalid file content")]
    InvalidSignature,

    #[error("unsupported cipher key length: {0} bytes")]
    KeyLength(usize),

    #[error("invalid encrypted bytes")]
    InvalidCiphertext,

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("the operation is in progress")]
    OperationInProgress,

    #[error("cannot push through a closed tap")]
    ClosedTap,

    #[error("the specified path is not a directory: {0}")]
    InvalidDirectory(PathBuf),

    #[error("filesystem watcher error: {0}")]
    Polling(#[from] notify::Error),
}
