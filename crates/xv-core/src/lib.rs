pub mod config;
pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{FileMeta, FileRef, Mode, Progress, Status};
