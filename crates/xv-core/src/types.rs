use std::fmt;
use std::path::PathBuf;

use crate::error::Error;

/// The transform a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Encryption: plaintext in, envelope out.
    Encode,
    /// Decryption: envelope in, plaintext out.
    Decode,
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Queued,
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

impl Status {
    /// Completed, Cancelled and Failed are terminal; a task never leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Cancelled | Status::Failed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Queued => "queued",
            Status::InProgress => "in progress",
            Status::Completed => "completed",
            Status::Cancelled => "cancelled",
            Status::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A file name together with its full path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub name: String,
    pub path: PathBuf,
}

/// Per-work-unit file metadata attached by a producer at dispatch time.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub input: FileRef,
    pub output: FileRef,
}

/// A progress record emitted by a producer for one work unit.
#[derive(Debug)]
pub struct Progress {
    pub status: Status,
    /// Terminal error of a failed task, if any.
    pub error: Option<Error>,
    pub input: FileRef,
    pub output: FileRef,
}
