//! A single encrypt-or-decrypt request and its lifecycle guards.

use tokio::io::AsyncWriteExt;

use xv_core::{Error, Mode, Result, Status};
use xv_crypto::{ByteSink, ByteSource};

/// One unit of cipher work: a mode, an input source and an ordered list of
/// output sinks.
///
/// While a worker owns the task (`in_progress`), the mutating operations
/// return [`Error::OperationInProgress`]. Once the task reaches a terminal
/// status it can be mutated again, which is how completion callbacks close
/// the file handles.
pub struct Task {
    mode: Mode,
    input: Option<ByteSource>,
    outputs: Vec<ByteSink>,
    status: Status,
    in_progress: bool,
}

impl Task {
    pub fn new(mode: Mode, input: ByteSource, output: ByteSink) -> Self {
        Self {
            mode,
            input: Some(input),
            outputs: vec![output],
            status: Status::Queued,
            in_progress: false,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn status(&self) -> Status {
        self.status
    }

    /// True while a worker owns the task.
    pub fn is_running(&self) -> bool {
        self.in_progress
    }

    /// Appends another output sink; bytes fan out to every sink in order.
    pub fn add_output(&mut self, output: ByteSink) -> Result<()> {
        if self.in_progress {
            return Err(Error::OperationInProgress);
        }
        self.outputs.push(output);
        Ok(())
    }

    /// Drops the input source, closing the underlying handle.
    pub fn close_input(&mut self) -> Result<()> {
        if self.in_progress {
            return Err(Error::OperationInProgress);
        }
        self.input = None;
        Ok(())
    }

    /// Shuts down and drops every output sink, stopping at the first error.
    pub async fn close_outputs(&mut self) -> Result<()> {
        if self.in_progress {
            return Err(Error::OperationInProgress);
        }
        for sink in &mut self.outputs {
            sink.shutdown().await?;
        }
        self.outputs.clear();
        Ok(())
    }

    pub(crate) fn mark_in_progress(&mut self) {
        self.status = Status::InProgress;
        self.in_progress = true;
    }

    pub(crate) fn mark_complete(&mut self, status: Status) {
        self.status = status;
        self.in_progress = false;
    }

    pub(crate) fn io_mut(&mut self) -> (Option<&mut ByteSource>, &mut [ByteSink]) {
        (self.input.as_mut(), &mut self.outputs)
    }
}
