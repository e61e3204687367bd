//! Front door bound to a single backend.
//!
//! Callers register observers once and then drive operations; notifications
//! from the backend are relayed to every observer, followed by
//! [`ArchiveProgress::Finished`] when an operation completes. One operation
//! runs at a time per facade.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

use tracing::debug;

use crate::backend::{ArchiveBackend, BackendKind, CreateOptions, ExtractOptions};
use crate::batch::{self, BatchOptions, BatchReport};
use crate::config::Settings;
use crate::entry::{self, ArchiveEntryInfo};
use crate::error::Result;
use crate::progress::{ArchiveProgress, ProgressCallback};
use crate::transfer::{ExtractStats, Outcome};

pub type FinishedCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Observers {
    progress: Vec<ProgressCallback>,
    finished: Vec<FinishedCallback>,
}

/// Results that may represent a completed operation.
trait Completion {
    fn is_complete(&self) -> bool;
}

impl<T> Completion for Outcome<T> {
    fn is_complete(&self) -> bool {
        !self.is_cancelled()
    }
}

impl Completion for BatchReport {
    fn is_complete(&self) -> bool {
        !self.cancelled
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Thread currently inside an operation, plus a signal for when it leaves.
#[derive(Default)]
struct RunState {
    thread: Mutex<Option<ThreadId>>,
    left: Condvar,
}

struct Running<'f> {
    state: &'f RunState,
}

impl<'f> Running<'f> {
    fn enter(state: &'f RunState) -> Self {
        *lock(&state.thread) = Some(thread::current().id());
        Self { state }
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        *lock(&self.state.thread) = None;
        self.state.left.notify_all();
    }
}

pub struct ArchiveFacade {
    backend: Box<dyn ArchiveBackend>,
    settings: Settings,
    observers: Mutex<Observers>,
    op_lock: Mutex<()>,
    run_state: RunState,
    closed: AtomicBool,
}

impl ArchiveFacade {
    pub fn new(kind: BackendKind, settings: Settings) -> Self {
        Self::with_backend(kind.create(&settings), settings)
    }

    pub fn with_backend(backend: Box<dyn ArchiveBackend>, settings: Settings) -> Self {
        debug!("Archive facade bound to {} backend", backend.kind());
        Self {
            backend,
            settings,
            observers: Mutex::new(Observers::default()),
            op_lock: Mutex::new(()),
            run_state: RunState::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn on_progress(&self, callback: impl Fn(&ArchiveProgress) + Send + Sync + 'static) {
        lock(&self.observers).progress.push(Arc::new(callback));
    }

    pub fn on_finished(&self, callback: impl Fn() + Send + Sync + 'static) {
        lock(&self.observers).finished.push(Arc::new(callback));
    }

    pub fn probe(&self, archive: &Path) -> bool {
        self.backend.probe(archive)
    }

    pub fn list(&self, archive: &Path, password: Option<&str>) -> Result<Vec<ArchiveEntryInfo>> {
        self.backend.list(archive, password)
    }

    /// Paths of all entries, directories included.
    pub fn entry_paths(&self, archive: &Path, password: Option<&str>) -> Result<Vec<String>> {
        Ok(entry::entry_paths(&self.list(archive, password)?))
    }

    pub fn extract_all(
        &self,
        archive: &Path,
        output_dir: &Path,
        options: &ExtractOptions,
    ) -> Result<Outcome<ExtractStats>> {
        self.run(|relay| self.backend.extract_all(archive, output_dir, options, Some(relay)))
    }

    pub fn extract_subset(
        &self,
        archive: &Path,
        output_dir: &Path,
        options: &ExtractOptions,
        entries: &[String],
    ) -> Result<Outcome<ExtractStats>> {
        self.run(|relay| {
            self.backend
                .extract_subset(archive, output_dir, options, entries, Some(relay))
        })
    }

    pub fn create_from_directory(
        &self,
        input_dir: &Path,
        archive: &Path,
        options: &CreateOptions,
    ) -> Result<Outcome<Vec<ArchiveEntryInfo>>> {
        self.run(|relay| {
            self.backend
                .create_from_directory(input_dir, archive, options, Some(relay))
        })
    }

    pub fn create_from_files(
        &self,
        files: &[PathBuf],
        common_root: &Path,
        archive: &Path,
        options: &CreateOptions,
    ) -> Result<Outcome<Vec<ArchiveEntryInfo>>> {
        self.run(|relay| {
            self.backend
                .create_from_files(files, common_root, archive, options, Some(relay))
        })
    }

    pub fn extract_all_archives_in_folder(
        &self,
        folder: &Path,
        output_dir: &Path,
        options: &BatchOptions,
    ) -> Result<BatchReport> {
        self.run(|relay| {
            batch::extract_all_archives_in_folder(self.backend.as_ref(), folder, output_dir, options, Some(relay))
        })
    }

    /// Request cancellation, then wait up to `abort_wait_ms` for the running
    /// operation to return. Returns immediately when nothing is running or when
    /// called from the operation's own thread (e.g. from a progress observer).
    pub fn abort(&self) {
        self.backend.abort();

        let wait = Duration::from_millis(self.settings.abort_wait_ms);
        let me = thread::current().id();
        let guard = lock(&self.run_state.thread);
        if *guard == Some(me) {
            return;
        }
        let (_guard, timeout) = self
            .run_state
            .left
            .wait_timeout_while(guard, wait, |running| running.is_some())
            .unwrap_or_else(PoisonError::into_inner);
        if timeout.timed_out() {
            debug!("Operation still running {}ms after abort", wait.as_millis());
        }
    }

    /// Abort anything in flight and drop all observers. Safe to call repeatedly.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.abort();
        let mut observers = lock(&self.observers);
        observers.progress.clear();
        observers.finished.clear();
        debug!("Archive facade closed");
    }

    fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Completion,
        F: FnOnce(&ProgressCallback) -> Result<T>,
    {
        let _serial = lock(&self.op_lock);
        let (listeners, finished) = {
            let observers = lock(&self.observers);
            (observers.progress.clone(), observers.finished.clone())
        };

        let relay_listeners = listeners.clone();
        let relay: ProgressCallback = Arc::new(move |event: &ArchiveProgress| {
            for listener in &relay_listeners {
                listener(event);
            }
        });

        let result = {
            let _running = Running::enter(&self.run_state);
            op(&relay)
        };

        if matches!(&result, Ok(value) if value.is_complete()) {
            for listener in &listeners {
                listener(&ArchiveProgress::Finished);
            }
            for callback in &finished {
                callback();
            }
        }
        result
    }
}

impl Drop for ArchiveFacade {
    fn drop(&mut self) {
        self.close();
    }
}
