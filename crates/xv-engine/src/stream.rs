//! Bridges a tap's queue to the worker pool.
//!
//! A single forwarder task moves work units from the tap's pipe into an
//! internal bounded FIFO whose capacity equals the configured parallelism.
//! Shutdown closes the tap first, stops the forwarder, then closes the FIFO
//! so the workers observe end-of-stream.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::tap::Tap;
use crate::work_unit::WorkUnit;

pub(crate) struct Stream {
    tap: Box<dyn Tap>,
    tap_rx: Option<mpsc::Receiver<WorkUnit>>,
    fifo_tx: Option<mpsc::Sender<WorkUnit>>,
    fifo_rx: Option<mpsc::Receiver<WorkUnit>>,
    done: CancellationToken,
    forwarder: Option<JoinHandle<()>>,
    opened: bool,
    shut_down: bool,
}

impl Stream {
    pub(crate) fn new(capacity: usize, mut tap: Box<dyn Tap>) -> Self {
        let (fifo_tx, fifo_rx) = mpsc::channel(capacity.max(1));
        let tap_rx = tap.take_pipe();
        Self {
            tap,
            tap_rx,
            fifo_tx: Some(fifo_tx),
            fifo_rx: Some(fifo_rx),
            done: CancellationToken::new(),
            forwarder: None,
            opened: false,
            shut_down: false,
        }
    }

    /// The FIFO read end shared by the workers. Yields once.
    pub(crate) fn receiver(&mut self) -> Option<mpsc::Receiver<WorkUnit>> {
        self.fifo_rx.take()
    }

    /// Spawns the forwarder and opens the tap. Idempotent.
    pub(crate) fn open(&mut self) {
        if self.opened {
            return;
        }
        self.opened = true;

        if let (Some(mut tap_rx), Some(fifo_tx)) = (self.tap_rx.take(), self.fifo_tx.clone()) {
            let done = self.done.clone();
            self.forwarder = Some(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = done.cancelled() => break,
                        unit = tap_rx.recv() => match unit {
                            Some(unit) => {
                                if fifo_tx.send(unit).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        },
                    }
                }
                debug!("stream forwarder exited");
            }));
        }

        if !self.tap.is_open() {
            self.tap.open();
        }
    }

    /// Closes the tap, stops the forwarder and closes the FIFO. Idempotent.
    pub(crate) async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if self.tap.is_open() {
            self.tap.close().await;
        }
        // Stop forwarding even if the tap keeps sending after close.
        self.done.cancel();
        if let Some(forwarder) = self.forwarder.take() {
            let _ = forwarder.await;
        }
        // Dropping the last sender signals the workers that no more units
        // will arrive.
        self.fifo_tx = None;
    }
}
