//! Integration tests for the directory watcher tap driving a real engine
//! over temp directories.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;

use xv_core::{Progress, Status};
use xv_crypto::{ByteSink, ByteSource, Decoder, MasterKey};
use xv_engine::Engine;
use xv_watch::{DirWatcherTap, WatchOptions};

fn master() -> Arc<MasterKey> {
    Arc::new(MasterKey::from_password("integration-pass").unwrap())
}

fn options(source: &Path, target: &Path, delete_completed: bool) -> WatchOptions {
    WatchOptions {
        source: source.to_path_buf(),
        target: target.to_path_buf(),
        poll_interval: Duration::from_millis(50),
        notify_errors: true,
        report_progress: true,
        delete_completed,
    }
}

/// Collects progress records in the background for later inspection.
fn collect_progress(mut rx: mpsc::Receiver<Progress>) -> Arc<Mutex<Vec<Progress>>> {
    let sink = Arc::new(Mutex::new(Vec::new()));
    let out = sink.clone();
    tokio::spawn(async move {
        while let Some(record) = rx.recv().await {
            out.lock().unwrap().push(record);
        }
    });
    sink
}

fn drain_errors(mut rx: mpsc::Receiver<xv_core::Error>) -> Arc<Mutex<Vec<String>>> {
    let sink = Arc::new(Mutex::new(Vec::new()));
    let out = sink.clone();
    tokio::spawn(async move {
        while let Some(err) = rx.recv().await {
            out.lock().unwrap().push(err.to_string());
        }
    });
    sink
}

async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    cond()
}

fn completed_count(records: &Arc<Mutex<Vec<Progress>>>, name: &str) -> usize {
    records
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.status == Status::Completed && r.input.name == name)
        .count()
}

async fn decrypt_file(master: &MasterKey, path: &PathBuf) -> Vec<u8> {
    let envelope = std::fs::read(path).unwrap();
    let out = Arc::new(Mutex::new(Vec::new()));

    struct Sink(Arc<Mutex<Vec<u8>>>);
    impl tokio::io::AsyncWrite for Sink {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }
        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    let mut input: ByteSource = Box::new(std::io::Cursor::new(envelope));
    let mut sinks: Vec<ByteSink> = vec![Box::new(Sink(out.clone()))];
    let status = Decoder::new(0, master, &mut input, &mut sinks)
        .decode()
        .await
        .unwrap();
    assert_eq!(status, Status::Completed);
    let bytes = out.lock().unwrap().clone();
    bytes
}

#[tokio::test]
async fn encrypts_existing_tree_into_mirrored_target() {
    let source = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();

    std::fs::create_dir_all(source.path().join("a/b")).unwrap();
    std::fs::write(source.path().join("top.txt"), b"top level").unwrap();
    std::fs::write(source.path().join("a/b/leaf.txt"), b"nested content").unwrap();

    let master = master();
    let mut tap =
        DirWatcherTap::new(options(source.path(), target.path(), false), master.clone()).unwrap();
    let progress = collect_progress(tap.progress().unwrap());
    let errors = drain_errors(tap.errors().unwrap());

    let mut engine = Engine::new(2, Box::new(tap));
    engine.start();

    assert!(
        wait_until(Duration::from_secs(10), || {
            completed_count(&progress, "top.txt") == 1
                && completed_count(&progress, "leaf.txt") == 1
        })
        .await,
        "both files must be encrypted: {:?}",
        progress.lock().unwrap()
    );

    let top = target.path().join("top.txt.xv");
    let leaf = target.path().join("a/b/leaf.txt.xv");
    assert!(top.is_file(), "target must mirror the source layout");
    assert!(leaf.is_file());
    assert_eq!(std::fs::metadata(&top).unwrap().len(), 44 + 9);
    assert_eq!(decrypt_file(&master, &leaf).await, b"nested content");

    // sources remain when delete_completed is off
    assert!(source.path().join("top.txt").is_file());

    engine.stop().await;
    assert!(errors.lock().unwrap().is_empty(), "no errors expected");
}

#[tokio::test]
async fn dispatches_new_files_once_after_debounce() {
    let source = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();

    let master = master();
    let mut tap =
        DirWatcherTap::new(options(source.path(), target.path(), false), master.clone()).unwrap();
    let progress = collect_progress(tap.progress().unwrap());
    let _errors = drain_errors(tap.errors().unwrap());

    let mut engine = Engine::new(1, Box::new(tap));
    engine.start();

    // Let the watcher settle, then drop a new file in.
    tokio::time::sleep(Duration::from_millis(200)).await;
    std::fs::write(source.path().join("fresh.txt"), b"fresh bytes").unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || {
            completed_count(&progress, "fresh.txt") == 1
        })
        .await,
        "new file must be dispatched after the debounce window"
    );

    let output = target.path().join("fresh.txt.xv");
    assert!(output.is_file());
    assert_eq!(decrypt_file(&master, &output).await, b"fresh bytes");

    // Give the debounce loop time to (incorrectly) dispatch again, then
    // confirm it did not.
    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(completed_count(&progress, "fresh.txt"), 1);

    engine.stop().await;
}

#[tokio::test]
async fn delete_completed_removes_sources_and_prunes_empty_dirs() {
    let source = TempDir::new().unwrap();
    let target = TempDir::new().unwrap();

    std::fs::create_dir_all(source.path().join("a/b")).unwrap();
    std::fs::write(source.path().join("a/b/x.txt"), b"to be consumed").unwrap();

    let master = master();
    let mut tap =
        DirWatcherTap::new(options(source.path(), target.path(), true), master.clone()).unwrap();
    let progress = collect_progress(tap.progress().unwrap());
    let _errors = drain_errors(tap.errors().unwrap());

    let mut engine = Engine::new(1, Box::new(tap));
    engine.start();

    assert!(
        wait_until(Duration::from_secs(10), || {
            completed_count(&progress, "x.txt") == 1
        })
        .await
    );
    assert!(
        wait_until(Duration::from_secs(5), || {
            !source.path().join("a/b/x.txt").exists()
        })
        .await,
        "source file must be removed after successful encryption"
    );

    // The cleaner runs on a 5-second tick once nothing is in flight.
    assert!(
        wait_until(Duration::from_secs(15), || {
            !source.path().join("a").exists()
        })
        .await,
        "emptied directories must be pruned"
    );
    assert!(source.path().is_dir(), "the source root itself is preserved");

    let output = target.path().join("a/b/x.txt.xv");
    assert!(output.is_file());
    assert_eq!(decrypt_file(&master, &output).await, b"to be consumed");

    engine.stop().await;
}
