//! zipaccess - cancellable, progress-reporting ZIP extraction and creation
//!
//! Three interchangeable engines sit behind one [`ArchiveBackend`] contract:
//! a sequential stream reader, a central-directory reader and the external
//! 7-Zip binary. [`ArchiveFacade`] binds one of them and relays progress.

pub mod backend;
pub mod batch;
pub mod cancel;
pub mod config;
pub mod entry;
pub mod error;
pub mod facade;
pub mod file_list;
pub mod progress;
pub mod sanitize;
pub mod transfer;

pub use backend::{ArchiveBackend, BackendKind, CreateOptions, ExtractOptions};
pub use batch::{BatchOptions, BatchReport};
pub use cancel::CancellationToken;
pub use config::Settings;
pub use entry::ArchiveEntryInfo;
pub use error::{ArchiveError, ErrorKind, Result};
pub use facade::ArchiveFacade;
pub use progress::{ArchiveProgress, ProgressCallback};
pub use transfer::{ExtractStats, Outcome};
