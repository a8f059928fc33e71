//! The producer-side contract of the pipeline.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::work_unit::WorkUnit;

/// A producer of [`WorkUnit`]s feeding an [`Engine`](crate::Engine).
///
/// The engine opens the tap when it starts and closes it when it stops;
/// callers normally never invoke these methods directly.
#[async_trait]
pub trait Tap: Send {
    /// Starts producing. Must not block; idempotent.
    fn open(&mut self);

    /// Stops producing and releases the tap's resources. Blocks until the
    /// tap's internal producers have drained, then closes the queue — queue
    /// closure is the engine's shutdown signal. Idempotent.
    async fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Hands over the read end of the tap's bounded queue. Returns `None`
    /// after the first call; the engine's forwarder is the only consumer.
    fn take_pipe(&mut self) -> Option<mpsc::Receiver<WorkUnit>>;
}
