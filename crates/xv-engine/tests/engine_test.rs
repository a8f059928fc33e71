//! End-to-end tests for the worker-pool engine with a mock tap.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

use xv_core::{Error, Mode, Status};
use xv_crypto::{ByteSource, MasterKey};
use xv_engine::{Callback, Engine, Tap, Task, WorkUnit};

/// Tap backed by a plain channel the test pushes into.
struct MockTap {
    tx: Option<mpsc::Sender<WorkUnit>>,
    rx: Option<mpsc::Receiver<WorkUnit>>,
    open: Arc<AtomicBool>,
}

impl MockTap {
    fn new() -> Self {
        let (tx, rx) = mpsc::channel(8);
        Self {
            tx: Some(tx),
            rx: Some(rx),
            open: Arc::new(AtomicBool::new(false)),
        }
    }

    fn sender(&self) -> mpsc::Sender<WorkUnit> {
        self.tx.clone().expect("tap not closed")
    }

    fn open_flag(&self) -> Arc<AtomicBool> {
        self.open.clone()
    }
}

#[async_trait]
impl Tap for MockTap {
    fn open(&mut self) {
        self.open.store(true, Ordering::SeqCst);
    }

    async fn close(&mut self) {
        self.open.store(false, Ordering::SeqCst);
        self.tx = None;
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn take_pipe(&mut self) -> Option<mpsc::Receiver<WorkUnit>> {
        self.rx.take()
    }
}

/// Inspectable sink shared between the task and the test.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl AsyncWrite for SharedBuf {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Sink that fails every write.
struct ErrorSink;

impl AsyncWrite for ErrorSink {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Poll::Ready(Err(std::io::Error::other("sink failure")))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn source(data: &[u8]) -> ByteSource {
    Box::new(std::io::Cursor::new(data.to_vec()))
}

fn master() -> Arc<MasterKey> {
    Arc::new(MasterKey::from_password("password").unwrap())
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

fn counting_callback(
    count: Arc<AtomicUsize>,
    on_done: impl Fn(&WorkUnit) + Send + Sync + 'static,
) -> Callback {
    Box::new(move |unit| {
        Box::pin(async move {
            on_done(&unit);
            count.fetch_add(1, Ordering::SeqCst);
        })
    })
}

#[tokio::test]
async fn start_and_stop_drive_the_tap() {
    let tap = MockTap::new();
    let open = tap.open_flag();

    let mut engine = Engine::new(1, Box::new(tap));
    assert!(!engine.is_running());

    engine.start();
    assert!(engine.is_running());
    assert!(open.load(Ordering::SeqCst), "starting must open the tap");

    // start is idempotent
    engine.start();
    assert!(engine.is_running());

    engine.stop().await;
    assert!(!engine.is_running());
    assert!(!open.load(Ordering::SeqCst), "stopping must close the tap");

    // stop is idempotent, restart is a no-op
    engine.stop().await;
    engine.start();
    assert!(!engine.is_running());
}

#[tokio::test]
async fn encode_then_decode_through_the_pool() {
    let tap = MockTap::new();
    let push = tap.sender();
    let mut engine = Engine::new(2, Box::new(tap));
    engine.start();

    let master = master();
    let count = Arc::new(AtomicUsize::new(0));

    for input in [&b"input"[..], b"", b"    "] {
        // encode
        let encoded = SharedBuf::default();
        let task = Task::new(Mode::Encode, source(input), Box::new(encoded.clone()));
        let cb = counting_callback(count.clone(), |unit| {
            assert_eq!(unit.task.status(), Status::Completed);
            assert!(unit.error.is_none());
        });
        push.send(WorkUnit::new(task, master.clone(), Some(cb)))
            .await
            .unwrap();

        let seen = count.load(Ordering::SeqCst);
        wait_until(|| count.load(Ordering::SeqCst) > seen).await;
        let envelope = encoded.contents();
        assert_eq!(envelope.len(), 44 + input.len());

        // decode what was just produced
        let decoded = SharedBuf::default();
        let task = Task::new(Mode::Decode, source(&envelope), Box::new(decoded.clone()));
        let cb = counting_callback(count.clone(), |unit| {
            assert_eq!(unit.task.status(), Status::Completed);
        });
        push.send(WorkUnit::new(task, master.clone(), Some(cb)))
            .await
            .unwrap();

        let seen = count.load(Ordering::SeqCst);
        wait_until(|| count.load(Ordering::SeqCst) > seen).await;
        assert_eq!(decoded.contents(), input);
    }

    engine.stop().await;
    assert_eq!(count.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn failing_sink_fails_the_task() {
    let tap = MockTap::new();
    let push = tap.sender();
    let mut engine = Engine::new(1, Box::new(tap));
    engine.start();

    let count = Arc::new(AtomicUsize::new(0));
    let good = SharedBuf::default();

    let mut task = Task::new(Mode::Encode, source(b"payload"), Box::new(good.clone()));
    task.add_output(Box::new(ErrorSink)).unwrap();
    let cb = counting_callback(count.clone(), |unit| {
        assert_eq!(unit.task.status(), Status::Failed);
        assert!(matches!(unit.error, Some(Error::Io(_))));
    });
    push.send(WorkUnit::new(task, master(), Some(cb)))
        .await
        .unwrap();

    wait_until(|| count.load(Ordering::SeqCst) == 1).await;
    engine.stop().await;
}

#[tokio::test]
async fn garbage_input_fails_decode_with_invalid_signature() {
    let tap = MockTap::new();
    let push = tap.sender();
    let mut engine = Engine::new(1, Box::new(tap));
    engine.start();

    let count = Arc::new(AtomicUsize::new(0));
    let out = SharedBuf::default();
    let task = Task::new(Mode::Decode, source(b"not an envelope"), Box::new(out.clone()));
    let cb = counting_callback(count.clone(), |unit| {
        assert_eq!(unit.task.status(), Status::Failed);
        assert!(matches!(unit.error, Some(Error::InvalidSignature)));
    });
    push.send(WorkUnit::new(task, master(), Some(cb)))
        .await
        .unwrap();

    wait_until(|| count.load(Ordering::SeqCst) == 1).await;
    assert!(out.contents().is_empty());
    engine.stop().await;
}

#[tokio::test]
async fn every_accepted_callback_runs_before_stop_returns() {
    let tap = MockTap::new();
    let push = tap.sender();
    let mut engine = Engine::new(4, Box::new(tap));
    engine.start();

    let master = master();
    let count = Arc::new(AtomicUsize::new(0));
    const UNITS: usize = 32;

    for i in 0..UNITS {
        let payload = vec![i as u8; 256];
        let task = Task::new(
            Mode::Encode,
            source(&payload),
            Box::new(SharedBuf::default()),
        );
        let cb = counting_callback(count.clone(), |unit| {
            assert!(unit.task.status().is_terminal());
        });
        push.send(WorkUnit::new(task, master.clone(), Some(cb)))
            .await
            .unwrap();
    }

    // Stop only after the tap queue has been fully accepted; dropping our
    // sender first lets the forwarder drain everything into the FIFO.
    drop(push);
    wait_until(|| count.load(Ordering::SeqCst) == UNITS).await;
    engine.stop().await;
    assert_eq!(count.load(Ordering::SeqCst), UNITS);
}
