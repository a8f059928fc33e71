//! The fixed-size worker pool.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use xv_core::{Error, Mode, Status};
use xv_crypto::{Decoder, Encoder};

use crate::stream::Stream;
use crate::tap::Tap;
use crate::work_unit::WorkUnit;

/// A pool of exactly N workers consuming work units from a tap.
///
/// `start` is one-shot: restarting a stopped engine is a no-op. All
/// lifecycle methods take `&mut self`, which serialises start/stop the same
/// way the per-engine mutex would.
pub struct Engine {
    stream: Stream,
    parallelism: usize,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    is_running: bool,
    started: bool,
    stopped: bool,
}

impl Engine {
    /// `parallelism` is both the worker count and the FIFO capacity.
    pub fn new(parallelism: usize, tap: Box<dyn Tap>) -> Self {
        let parallelism = parallelism.max(1);
        Self {
            stream: Stream::new(parallelism, tap),
            parallelism,
            cancel: CancellationToken::new(),
            workers: Vec::new(),
            is_running: false,
            started: false,
            stopped: false,
        }
    }

    /// Spawns the workers and opens the tap. Safe to call repeatedly; only
    /// the first call has an effect.
    pub fn start(&mut self) {
        if self.is_running || self.started {
            return;
        }
        self.started = true;

        let Some(fifo_rx) = self.stream.receiver() else {
            return;
        };
        let fifo_rx = Arc::new(Mutex::new(fifo_rx));
        for worker in 0..self.parallelism {
            let fifo_rx = fifo_rx.clone();
            let cancel = self.cancel.clone();
            self.workers
                .push(tokio::spawn(run_worker(worker, fifo_rx, cancel)));
        }
        self.stream.open();
        self.is_running = true;
        debug!(workers = self.parallelism, "engine started");
    }

    /// Closes the tap, cancels in-flight cipher runs and waits for every
    /// worker to exit. All accepted callbacks have run when this returns.
    /// Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if !self.is_running || self.stopped {
            return;
        }
        self.stopped = true;
        self.is_running = false;

        self.stream.shutdown().await;
        self.cancel.cancel();
        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }
        debug!("engine stopped");
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }
}

async fn run_worker(
    worker: usize,
    fifo_rx: Arc<Mutex<mpsc::Receiver<WorkUnit>>>,
    cancel: CancellationToken,
) {
    loop {
        let next = {
            let mut rx = fifo_rx.lock().await;
            // Drain-first: units already accepted into the FIFO get their
            // callbacks even during shutdown; cancellation is only taken
            // when the queue has nothing to hand out.
            tokio::select! {
                biased;
                unit = rx.recv() => unit,
                _ = cancel.cancelled() => None,
            }
        };
        let Some(mut unit) = next else {
            break;
        };

        debug!(worker, mode = ?unit.task.mode(), "processing work unit");
        process_unit(&mut unit, &cancel).await;
        debug!(worker, status = %unit.task.status(), "work unit finished");

        if let Some(callback) = unit.callback.take() {
            callback(unit).await;
        }
    }
    debug!(worker, "worker exited");
}

async fn process_unit(unit: &mut WorkUnit, cancel: &CancellationToken) {
    unit.task.mark_in_progress();
    let master = unit.master.clone();
    let mode = unit.task.mode();

    let result = {
        let (input, outputs) = unit.task.io_mut();
        match input {
            None => Err(Error::Io(std::io::Error::other("task input is closed"))),
            Some(input) => match mode {
                Mode::Encode => {
                    Encoder::new(0, &master, input, outputs)
                        .encode_with(cancel)
                        .await
                }
                Mode::Decode => {
                    Decoder::new(0, &master, input, outputs)
                        .decode_with(cancel)
                        .await
                }
            },
        }
    };

    let (status, error) = match result {
        Ok(status) => (status, None),
        Err(error) => (Status::Failed, Some(error)),
    };
    unit.task.mark_complete(status);
    unit.error = error;
}
