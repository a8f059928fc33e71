//! Directory watcher tap
//!
//! Three producers run concurrently once the tap is open:
//!   - an initial scan that walks the pre-existing source tree and
//!     dispatches every regular file,
//!   - an event loop that debounces filesystem create/modify events so a
//!     file is only dispatched once it has been quiescent for
//!     `3 × poll_interval` (editors burst events while a file is being
//!     populated; dispatching early would encrypt a truncated file),
//!   - a cleaner that prunes source directories left empty after their
//!     files were encrypted and deleted.
//!
//! All three share one bounded work-unit queue; back-pressure from the
//! engine is the flow control.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use xv_core::{Error, FileMeta, FileRef, Mode, Progress, Result, Status};
use xv_crypto::MasterKey;
use xv_engine::{Callback, Tap, Task, WorkUnit};

/// Suffix appended to the full original file name, existing extension
/// included: `report.pdf` becomes `report.pdf.xv`.
pub const ENCODED_FILE_EXTENSION: &str = ".xv";

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const REPORT_CHANNEL_CAPACITY: usize = 16;
const CLEANER_TICK: Duration = Duration::from_secs(5);

/// Construction parameters for [`DirWatcherTap`].
#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Directory observed for files to encrypt. Created if absent.
    pub source: PathBuf,
    /// Directory the encrypted tree is mirrored into. Created if absent.
    pub target: PathBuf,
    /// Event-loop tick; the dispatch debounce is three times this value.
    pub poll_interval: Duration,
    /// Forward errors on the errors channel. The channel must be drained
    /// when enabled, otherwise the tap back-pressures.
    pub notify_errors: bool,
    /// Emit a progress record when a unit is queued and when it finishes.
    pub report_progress: bool,
    /// Remove source files after successful encryption and prune emptied
    /// directories.
    pub delete_completed: bool,
}

enum WatchSignal {
    Event(notify::Event),
    Error(notify::Error),
}

/// Producer tap that encrypts a watched directory tree.
pub struct DirWatcherTap {
    shared: Arc<Shared>,
    watcher: Option<RecommendedWatcher>,
    signals_rx: Option<mpsc::Receiver<WatchSignal>>,
    pipe_rx: Option<mpsc::Receiver<WorkUnit>>,
    errors_rx: Option<mpsc::Receiver<Error>>,
    progress_rx: Option<mpsc::Receiver<Progress>>,
    tasks: Vec<JoinHandle<()>>,
    opened: bool,
    closed: bool,
}

struct Shared {
    source: PathBuf,
    target: PathBuf,
    poll_interval: Duration,
    master: Arc<MasterKey>,
    notify_errors: bool,
    report_progress: bool,
    delete_completed: bool,
    is_open: AtomicBool,
    /// Units dispatched but not yet confirmed deleted; gates the cleaner.
    in_flight: AtomicUsize,
    /// Directories seen under source, pruned after the tree drains.
    known_dirs: Mutex<HashSet<PathBuf>>,
    done: CancellationToken,
    pipe_tx: Mutex<Option<mpsc::Sender<WorkUnit>>>,
    errors_tx: Mutex<Option<mpsc::Sender<Error>>>,
    progress_tx: Mutex<Option<mpsc::Sender<Progress>>>,
}

impl DirWatcherTap {
    /// Builds the tap, normalising both directories to absolute paths and
    /// creating them when missing. Fails if either path exists but is not a
    /// directory, or if the platform watcher cannot be constructed.
    pub fn new(options: WatchOptions, master: Arc<MasterKey>) -> Result<Self> {
        let source = ensure_dir(&options.source)?;
        let target = ensure_dir(&options.target)?;

        let (pipe_tx, pipe_rx) = mpsc::channel(1);
        let (errors_tx, errors_rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);
        let (progress_tx, progress_rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);

        // Bridge the watcher's callback thread into the async event loop.
        // The channel is buffered so event bursts are not dropped.
        let (signals_tx, signals_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let signal = match res {
                Ok(event) => match event.kind {
                    EventKind::Create(_) | EventKind::Modify(_) => WatchSignal::Event(event),
                    _ => return,
                },
                Err(err) => WatchSignal::Error(err),
            };
            let _ = signals_tx.blocking_send(signal);
        })?;

        Ok(Self {
            shared: Arc::new(Shared {
                source,
                target,
                poll_interval: options.poll_interval,
                master,
                notify_errors: options.notify_errors,
                report_progress: options.report_progress,
                delete_completed: options.delete_completed,
                is_open: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                known_dirs: Mutex::new(HashSet::new()),
                done: CancellationToken::new(),
                pipe_tx: Mutex::new(Some(pipe_tx)),
                errors_tx: Mutex::new(Some(errors_tx)),
                progress_tx: Mutex::new(Some(progress_tx)),
            }),
            watcher: Some(watcher),
            signals_rx: Some(signals_rx),
            pipe_rx: Some(pipe_rx),
            errors_rx: Some(errors_rx),
            progress_rx: Some(progress_rx),
            tasks: Vec::new(),
            opened: false,
            closed: false,
        })
    }

    /// The read end of the errors channel. Yields once.
    ///
    /// Must be drained while error notification is enabled.
    pub fn errors(&mut self) -> Option<mpsc::Receiver<Error>> {
        self.errors_rx.take()
    }

    /// The read end of the progress channel. Yields once.
    pub fn progress(&mut self) -> Option<mpsc::Receiver<Progress>> {
        self.progress_rx.take()
    }

    pub fn source(&self) -> &Path {
        &self.shared.source
    }

    pub fn target(&self) -> &Path {
        &self.shared.target
    }

    fn open_inner(&mut self) {
        if self.opened || self.closed {
            return;
        }
        self.opened = true;
        self.shared.is_open.store(true, Ordering::SeqCst);

        if let Some(watcher) = self.watcher.as_mut() {
            if let Err(err) = watcher.watch(&self.shared.source, RecursiveMode::Recursive) {
                let shared = self.shared.clone();
                tokio::spawn(async move { shared.report_error(Error::Polling(err)).await });
            }
        }

        if self.shared.delete_completed {
            let shared = self.shared.clone();
            self.tasks.push(tokio::spawn(cleaner_loop(shared)));
        }

        if let Some(signals_rx) = self.signals_rx.take() {
            let shared = self.shared.clone();
            self.tasks.push(tokio::spawn(watch_loop(shared, signals_rx)));
        }

        let shared = self.shared.clone();
        self.tasks.push(tokio::spawn(scan_existing(shared)));

        info!(
            source = %self.shared.source.display(),
            target = %self.shared.target.display(),
            "directory watcher opened"
        );
    }

    async fn close_inner(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(mut watcher) = self.watcher.take() {
            let _ = watcher.unwatch(&self.shared.source);
        }
        self.shared.done.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        *self.shared.pipe_tx.lock().unwrap() = None;
        *self.shared.errors_tx.lock().unwrap() = None;
        *self.shared.progress_tx.lock().unwrap() = None;
        self.shared.is_open.store(false, Ordering::SeqCst);

        info!(source = %self.shared.source.display(), "directory watcher closed");
    }
}

#[async_trait]
impl Tap for DirWatcherTap {
    fn open(&mut self) {
        self.open_inner();
    }

    async fn close(&mut self) {
        self.close_inner().await;
    }

    fn is_open(&self) -> bool {
        self.shared.is_open.load(Ordering::SeqCst)
    }

    fn take_pipe(&mut self) -> Option<mpsc::Receiver<WorkUnit>> {
        self.pipe_rx.take()
    }
}

impl Shared {
    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }

    fn remember_dir(&self, path: &Path) {
        if path != self.source {
            self.known_dirs.lock().unwrap().insert(path.to_path_buf());
        }
    }

    async fn report_error(&self, err: Error) {
        warn!(error = %err, "tap error");
        if !self.is_open() || !self.notify_errors {
            return;
        }
        let tx = { self.errors_tx.lock().unwrap().clone() };
        if let Some(tx) = tx {
            let _ = tx.send(err).await;
        }
    }

    async fn report(&self, progress: Progress) {
        let tx = { self.progress_tx.lock().unwrap().clone() };
        if let Some(tx) = tx {
            let _ = tx.send(progress).await;
        }
    }

    /// Opens the input, creates the mirrored output file and queues the
    /// work unit. Failures are reported, never fatal.
    async fn dispatch(self: Arc<Self>, path: PathBuf) {
        if !self.is_open() || path == self.source {
            return;
        }
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            return;
        };

        let input = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) => {
                debug!(path = %path.display(), "failed to open input");
                self.report_error(Error::Io(err)).await;
                return;
            }
        };

        let rel_dir = path
            .parent()
            .and_then(|dir| dir.strip_prefix(&self.source).ok())
            .unwrap_or_else(|| Path::new(""));
        let target_dir = self.target.join(rel_dir);
        if let Err(err) = tokio::fs::create_dir_all(&target_dir).await {
            self.report_error(Error::Io(err)).await;
            return;
        }

        let output_name = format!("{name}{ENCODED_FILE_EXTENSION}");
        let output_path = target_dir.join(&output_name);
        let output = match tokio::fs::File::create(&output_path).await {
            Ok(file) => file,
            Err(err) => {
                debug!(path = %output_path.display(), "failed to create output");
                self.report_error(Error::Io(err)).await;
                return;
            }
        };

        let meta = FileMeta {
            input: FileRef {
                name,
                path: path.clone(),
            },
            output: FileRef {
                name: output_name,
                path: output_path,
            },
        };

        let task = Task::new(Mode::Encode, Box::new(input), Box::new(output));
        let callback: Callback = {
            let shared = self.clone();
            Box::new(move |unit| Box::pin(async move { shared.on_done(unit).await }))
        };
        let unit = WorkUnit::new(task, self.master.clone(), Some(callback)).with_meta(meta.clone());

        if self.report_progress {
            self.report(Progress {
                status: Status::Queued,
                error: None,
                input: meta.input.clone(),
                output: meta.output.clone(),
            })
            .await;
        }

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let tx = { self.pipe_tx.lock().unwrap().clone() };
        match tx {
            Some(tx) => {
                debug!(path = %meta.input.path.display(), "queued for encryption");
                if tx.send(unit).await.is_err() {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    self.report_error(Error::ClosedTap).await;
                }
            }
            None => {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                self.report_error(Error::ClosedTap).await;
            }
        }
    }

    /// Completion callback: closes the task's handles, deletes the source
    /// on success when configured, and emits the terminal progress record.
    async fn on_done(self: Arc<Self>, mut unit: WorkUnit) {
        let Some(meta) = unit.meta.take() else {
            return;
        };

        if let Err(err) = unit.task.close_input() {
            warn!(file = %meta.input.name, error = %err, "failed to close input");
            self.report_error(err).await;
        }
        if let Err(err) = unit.task.close_outputs().await {
            warn!(file = %meta.output.name, error = %err, "failed to close outputs");
            self.report_error(err).await;
        }

        let status = unit.task.status();
        if self.delete_completed && status == Status::Completed {
            if let Err(err) = tokio::fs::remove_file(&meta.input.path).await {
                warn!(file = %meta.input.name, error = %err, "failed to remove source");
                self.report_error(Error::Io(err)).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }

        if self.report_progress && self.is_open() {
            self.report(Progress {
                status,
                error: unit.error.take(),
                input: meta.input,
                output: meta.output,
            })
            .await;
        }
    }

    /// Walks up from `dir` toward source, removing every empty directory.
    async fn prune_upwards(&self, dir: &Path) {
        let mut current = dir.to_path_buf();
        while current != self.source && current.starts_with(&self.source) {
            if is_dir_empty(&current) {
                match std::fs::remove_dir(&current) {
                    Ok(()) => debug!(dir = %current.display(), "removed empty directory"),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => self.report_error(Error::Io(err)).await,
                }
            }
            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => break,
            }
        }
    }
}

/// Walks the pre-existing source tree and dispatches every regular file.
async fn scan_existing(shared: Arc<Shared>) {
    let root = shared.source.clone();
    match tokio::task::spawn_blocking(move || collect_tree(&root)).await {
        Ok(Ok(scan)) => {
            shared
                .known_dirs
                .lock()
                .unwrap()
                .extend(scan.dirs.into_iter());
            for err in scan.errors {
                shared.report_error(Error::Io(err)).await;
            }
            for file in scan.files {
                if shared.done.is_cancelled() || !shared.is_open() {
                    break;
                }
                shared.clone().dispatch(file).await;
            }
            debug!("initial scan finished");
        }
        Ok(Err(err)) => shared.report_error(Error::Io(err)).await,
        Err(err) => warn!(error = %err, "initial scan panicked"),
    }
}

#[derive(Default)]
struct TreeScan {
    dirs: Vec<PathBuf>,
    files: Vec<PathBuf>,
    errors: Vec<std::io::Error>,
}

fn collect_tree(root: &Path) -> std::io::Result<TreeScan> {
    let mut scan = TreeScan::default();
    collect_tree_inner(root, &mut scan)?;
    scan.files.sort();
    Ok(scan)
}

fn collect_tree_inner(dir: &Path, scan: &mut TreeScan) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        // A file vanishing between listing and stat is not fatal.
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                scan.errors.push(err);
                continue;
            }
        };
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                scan.errors.push(err);
                continue;
            }
        };
        let path = entry.path();
        if meta.is_dir() {
            scan.dirs.push(path.clone());
            if let Err(err) = collect_tree_inner(&path, scan) {
                scan.errors.push(err);
            }
        } else if meta.is_file() {
            scan.files.push(path);
        }
    }
    Ok(())
}

/// Event loop: records create/modify events and dispatches entries that
/// have been quiescent for the debounce window.
async fn watch_loop(shared: Arc<Shared>, mut signals: mpsc::Receiver<WatchSignal>) {
    let debounce = shared.poll_interval * 3;
    let mut ticker = tokio::time::interval(shared.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut pending: HashMap<PathBuf, Instant> = HashMap::new();
    let mut last_event: Option<Instant> = None;

    loop {
        tokio::select! {
            _ = shared.done.cancelled() => return,

            signal = signals.recv() => match signal {
                None => return,
                Some(WatchSignal::Error(err)) => {
                    shared.report_error(Error::Polling(err)).await;
                }
                Some(WatchSignal::Event(event)) => {
                    let now = Instant::now();
                    for path in event.paths {
                        match tokio::fs::metadata(&path).await {
                            Ok(meta) if meta.is_dir() => shared.remember_dir(&path),
                            Ok(_) => {
                                last_event = Some(now);
                                pending.insert(path, now);
                            }
                            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                            Err(err) => shared.report_error(Error::Io(err)).await,
                        }
                    }
                }
            },

            _ = ticker.tick() => {
                if pending.is_empty() {
                    continue;
                }
                let now = Instant::now();
                // Hold everything back while events are still arriving
                // anywhere in the tree.
                if let Some(last) = last_event {
                    if now.duration_since(last) < debounce {
                        continue;
                    }
                }
                let ready: Vec<PathBuf> = pending
                    .iter()
                    .filter(|(_, seen)| now.duration_since(**seen) >= debounce)
                    .map(|(path, _)| path.clone())
                    .collect();
                for path in ready {
                    pending.remove(&path);
                    match tokio::fs::metadata(&path).await {
                        Ok(meta) if meta.is_dir() => {}
                        Ok(_) => shared.clone().dispatch(path).await,
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                        Err(err) => shared.report_error(Error::Io(err)).await,
                    }
                }
            }
        }
    }
}

/// Prunes emptied source directories once nothing is in flight.
async fn cleaner_loop(shared: Arc<Shared>) {
    // First tick after a full period: the initial scan must get a chance to
    // record directories and put units in flight before any pruning.
    let start = tokio::time::Instant::now() + CLEANER_TICK;
    let mut ticker = tokio::time::interval_at(start, CLEANER_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shared.done.cancelled() => return,
            _ = ticker.tick() => {
                if shared.in_flight.load(Ordering::SeqCst) != 0 {
                    continue;
                }
                let dirs: Vec<PathBuf> = {
                    let mut known = shared.known_dirs.lock().unwrap();
                    if known.is_empty() {
                        continue;
                    }
                    known.drain().collect()
                };
                for dir in dirs {
                    shared.prune_upwards(&dir).await;
                }
            }
        }
    }
}

fn ensure_dir(dir: &Path) -> Result<PathBuf> {
    let abs = std::path::absolute(dir)?;
    match std::fs::metadata(&abs) {
        Ok(meta) if meta.is_dir() => Ok(abs),
        Ok(_) => Err(Error::InvalidDirectory(abs)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            std::fs::create_dir_all(&abs)?;
            Ok(abs)
        }
        Err(err) => Err(Error::Io(err)),
    }
}

fn is_dir_empty(dir: &Path) -> bool {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ensure_dir_creates_missing_directories() {
        let tmp = TempDir::new().unwrap();
        let nested = tmp.path().join("a/b/c");
        let abs = ensure_dir(&nested).unwrap();
        assert!(abs.is_absolute());
        assert!(abs.is_dir());
    }

    #[test]
    fn ensure_dir_rejects_files() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("plain.txt");
        std::fs::write(&file, b"x").unwrap();
        assert!(matches!(
            ensure_dir(&file),
            Err(Error::InvalidDirectory(_))
        ));
    }

    #[test]
    fn collect_tree_lists_files_and_dirs() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        std::fs::write(tmp.path().join("top.txt"), b"1").unwrap();
        std::fs::write(tmp.path().join("a/mid.txt"), b"2").unwrap();
        std::fs::write(tmp.path().join("a/b/leaf.txt"), b"3").unwrap();

        let scan = collect_tree(tmp.path()).unwrap();
        assert_eq!(scan.files.len(), 3);
        assert_eq!(scan.dirs.len(), 2);
        assert!(scan.errors.is_empty());
    }

    #[test]
    fn empty_dir_detection() {
        let tmp = TempDir::new().unwrap();
        assert!(is_dir_empty(tmp.path()));
        std::fs::write(tmp.path().join("f"), b"x").unwrap();
        assert!(!is_dir_empty(tmp.path()));
        assert!(!is_dir_empty(&tmp.path().join("missing")));
    }
}
