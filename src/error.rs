//! Error kinds shared by every backend.
//!
//! Cancellation is not an error: a cancelled operation returns
//! [`Outcome::Cancelled`](crate::transfer::Outcome) instead of an error.

use std::io;
use std::path::{Path, PathBuf};

/// Errors raised by archive operations.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("cannot read archive {}: {reason}", path.display())]
    ArchiveRead { path: PathBuf, reason: String },

    #[error("cannot write {}: {reason}", path.display())]
    ArchiveWrite { path: PathBuf, reason: String },

    #[error(
        "entry '{entry}' in {} declares {declared} bytes but {actual} were available",
        archive.display()
    )]
    EntryIntegrity {
        archive: PathBuf,
        entry: String,
        declared: u64,
        actual: u64,
    },

    #[error("error in archive {}: {source}", archive.display())]
    Transfer {
        archive: PathBuf,
        #[source]
        source: Box<ArchiveError>,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Classification of an [`ArchiveError`], looking through context wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    ArchiveRead,
    ArchiveWrite,
    EntryIntegrity,
    Io,
}

impl ArchiveError {
    pub fn read(path: &Path, reason: impl ToString) -> Self {
        Self::ArchiveRead {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub fn write(path: &Path, reason: impl ToString) -> Self {
        Self::ArchiveWrite {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        }
    }

    pub fn not_found(path: &Path) -> Self {
        Self::NotFound {
            path: path.to_path_buf(),
        }
    }

    /// Wrap an error with the archive it occurred in.
    ///
    /// Errors that already carry the same archive context are returned as-is.
    pub fn in_archive(self, archive: &Path) -> Self {
        if let Self::Transfer { archive: existing, .. } = &self {
            if existing == archive {
                return self;
            }
        }
        Self::Transfer {
            archive: archive.to_path_buf(),
            source: Box::new(self),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::ArchiveRead { .. } => ErrorKind::ArchiveRead,
            Self::ArchiveWrite { .. } => ErrorKind::ArchiveWrite,
            Self::EntryIntegrity { .. } => ErrorKind::EntryIntegrity,
            Self::Transfer { source, .. } => source.kind(),
            Self::Io(e) if e.kind() == io::ErrorKind::NotFound => ErrorKind::NotFound,
            Self::Io(_) => ErrorKind::Io,
        }
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;
