//! Progress notifications.
//!
//! Percent-done is derived on every chunk from cumulative bytes over the total
//! for the current operation. Observers are only called when the integer
//! percentage goes up, so the sequence they see is strictly increasing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A progress notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveProgress {
    /// Percent-done increased
    Changed {
        /// 0-100
        percent: u8,
        /// Item being processed, if the backend knows it
        item: Option<PathBuf>,
    },
    /// Operation finished (reported as 100%)
    Finished,
}

impl ArchiveProgress {
    pub fn percent(&self) -> u8 {
        match self {
            Self::Changed { percent, .. } => *percent,
            Self::Finished => 100,
        }
    }
}

/// Callback receiving progress notifications on the thread driving the copy loop.
pub type ProgressCallback = Arc<dyn Fn(&ArchiveProgress) + Send + Sync>;

/// Send a notification to an optional callback.
pub(crate) fn emit(progress: Option<&ProgressCallback>, event: ArchiveProgress) {
    if let Some(cb) = progress {
        cb(&event);
    }
}

/// Byte accounting for one operation.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    total: u64,
    done: u64,
    last_percent: u8,
}

impl ProgressTracker {
    /// A zero total is treated as 1 so percent computation never divides by zero.
    pub fn new(total: u64) -> Self {
        Self {
            total: total.max(1),
            done: 0,
            last_percent: 0,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn bytes_done(&self) -> u64 {
        self.done
    }

    pub fn percent(&self) -> u8 {
        let pct = (self.done as u128 * 100 / self.total as u128).min(100);
        pct as u8
    }

    /// Account for `bytes` more bytes. Returns the new percentage if it increased.
    pub fn advance(&mut self, bytes: u64) -> Option<u8> {
        self.done = self.done.saturating_add(bytes);
        let pct = self.percent();
        if pct > self.last_percent {
            self.last_percent = pct;
            Some(pct)
        } else {
            None
        }
    }

    /// Account for bytes and notify the callback when percent-done increased.
    pub(crate) fn report(
        &mut self,
        bytes: u64,
        item: &Path,
        progress: Option<&ProgressCallback>,
    ) {
        if let Some(percent) = self.advance(bytes) {
            emit(
                progress,
                ArchiveProgress::Changed {
                    percent,
                    item: Some(item.to_path_buf()),
                },
            );
        }
    }

    /// Mark the operation done, emitting 100 if it was not reached through bytes
    /// (e.g. an archive of empty files).
    pub(crate) fn complete(&mut self, progress: Option<&ProgressCallback>) {
        if self.last_percent < 100 {
            self.done = self.done.max(self.total);
            self.last_percent = 100;
            emit(
                progress,
                ArchiveProgress::Changed {
                    percent: 100,
                    item: None,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_zero_total_does_not_divide_by_zero() {
        let mut tracker = ProgressTracker::new(0);
        assert_eq!(tracker.total(), 1);
        assert_eq!(tracker.advance(0), None);
        assert_eq!(tracker.advance(1), Some(100));
    }

    #[test]
    fn test_only_increases_are_reported() {
        let mut tracker = ProgressTracker::new(1000);
        assert_eq!(tracker.advance(5), None);
        assert_eq!(tracker.advance(5), Some(1));
        assert_eq!(tracker.advance(1), None);
        assert_eq!(tracker.advance(489), Some(50));
        assert_eq!(tracker.advance(10_000), Some(100));
        assert_eq!(tracker.advance(10), None);
        assert_eq!(tracker.percent(), 100);
    }

    #[test]
    fn test_report_calls_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: ProgressCallback = Arc::new(move |p: &ArchiveProgress| {
            sink.lock().unwrap().push(p.percent());
        });

        let mut tracker = ProgressTracker::new(4);
        for _ in 0..4 {
            tracker.report(1, Path::new("f"), Some(&cb));
        }
        assert_eq!(*seen.lock().unwrap(), vec![25, 50, 75, 100]);
    }

    #[test]
    fn test_complete_reports_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: ProgressCallback = Arc::new(move |p: &ArchiveProgress| {
            sink.lock().unwrap().push(p.percent());
        });

        let mut tracker = ProgressTracker::new(0);
        tracker.complete(Some(&cb));
        tracker.complete(Some(&cb));
        assert_eq!(*seen.lock().unwrap(), vec![100]);
    }

    #[test]
    fn test_finished_is_full() {
        assert_eq!(ArchiveProgress::Finished.percent(), 100);
    }
}
