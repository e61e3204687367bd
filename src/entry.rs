//! Archive entry metadata.

use std::fmt;

use chrono::NaiveDateTime;

/// Information about one entry of an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntryInfo {
    /// Path within the archive (forward slashes, case-preserved)
    pub path: String,
    /// Uncompressed size in bytes (always 0 for directories)
    pub size: u64,
    /// Last write time in local time, `None` when the archive does not record one
    pub last_write_time: Option<NaiveDateTime>,
    /// Whether this is a directory
    pub is_directory: bool,
}

impl ArchiveEntryInfo {
    pub fn file(path: impl Into<String>, size: u64, last_write_time: Option<NaiveDateTime>) -> Self {
        Self {
            path: path.into(),
            size,
            last_write_time,
            is_directory: false,
        }
    }

    /// Directory entries never report a size, even if the source carries a stale one.
    pub fn directory(path: impl Into<String>, last_write_time: Option<NaiveDateTime>) -> Self {
        Self {
            path: path.into(),
            size: 0,
            last_write_time,
            is_directory: true,
        }
    }

    /// Build an entry from raw listing data, normalizing separators and directory sizes.
    pub fn from_listing(
        path: &str,
        size: u64,
        last_write_time: Option<NaiveDateTime>,
        is_directory: bool,
    ) -> Self {
        let path = path.replace('\\', "/");
        if is_directory {
            Self::directory(path, last_write_time)
        } else {
            Self::file(path, size, last_write_time)
        }
    }
}

impl fmt::Display for ArchiveEntryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_directory {
            write!(f, "{} (DIR)", self.path)
        } else {
            write!(f, "{} (FILE, size: {} K)", self.path, self.size / 1024)
        }
    }
}

/// Archive-relative paths of a listing, in listing order.
pub fn entry_paths(entries: &[ArchiveEntryInfo]) -> Vec<String> {
    entries.iter().map(|e| e.path.clone()).collect()
}
