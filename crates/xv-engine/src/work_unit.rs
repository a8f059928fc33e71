//! A task bundled with its key, completion callback and metadata.

use std::sync::Arc;

use futures::future::BoxFuture;

use xv_core::{Error, FileMeta};
use xv_crypto::MasterKey;

use crate::task::Task;

/// Completion callback, invoked exactly once after the task reaches a
/// terminal status and before the worker dequeues its next unit. The unit is
/// moved into the callback, so it may freely close the task's handles.
pub type Callback = Box<dyn FnOnce(WorkUnit) -> BoxFuture<'static, ()> + Send>;

/// One queued encrypt-or-decrypt request.
pub struct WorkUnit {
    pub task: Task,
    pub(crate) master: Arc<MasterKey>,
    pub(crate) callback: Option<Callback>,
    /// Producer-attached file metadata, if any.
    pub meta: Option<FileMeta>,
    /// The error surfaced by the worker for a failed task.
    pub error: Option<Error>,
}

impl WorkUnit {
    pub fn new(task: Task, master: Arc<MasterKey>, callback: Option<Callback>) -> Self {
        Self {
            task,
            master,
            callback,
            meta: None,
            error: None,
        }
    }

    pub fn with_meta(mut self, meta: FileMeta) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn master(&self) -> &MasterKey {
        &self.master
    }
}
