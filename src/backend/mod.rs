//! Interchangeable archive engines behind one contract.
//!
//! Every backend implements probing, listing and two workers (`unpack` and
//! `pack`). The top-level operations are provided on the trait: they clear
//! the cancellation token, build the job and delegate, so every backend gets
//! identical reset and error-context behaviour.
//!
//! Backends:
//! - [`StreamBackend`]: sequential local-header reader, true two-pass extraction
//! - [`CentralDirectoryBackend`]: random-access reader over the central directory
//! - [`SevenZipBackend`]: drives an external 7-Zip binary

mod central;
pub mod sevenzip;
mod stream;
mod zipfmt;

pub use central::CentralDirectoryBackend;
pub use sevenzip::SevenZipBackend;
pub use stream::StreamBackend;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::config::Settings;
use crate::entry::ArchiveEntryInfo;
use crate::error::{ArchiveError, Result};
use crate::progress::ProgressCallback;
use crate::sanitize::EntryFilter;
use crate::transfer::{ExtractStats, Outcome, PackPlan};

/// Which engine a backend uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BackendKind {
    /// Sequential stream reader (pure Rust)
    #[default]
    #[serde(rename = "stream")]
    Stream,
    /// Central-directory reader (pure Rust)
    #[serde(rename = "central")]
    CentralDirectory,
    /// External 7-Zip binary
    #[serde(rename = "7z")]
    SevenZip,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [Self::Stream, Self::CentralDirectory, Self::SevenZip];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::CentralDirectory => "central",
            Self::SevenZip => "7z",
        }
    }

    /// Construct the backend this kind names.
    pub fn create(&self, settings: &Settings) -> Box<dyn ArchiveBackend> {
        match self {
            Self::Stream => Box::new(StreamBackend::new(settings)),
            Self::CentralDirectory => Box::new(CentralDirectoryBackend::new(settings)),
            Self::SevenZip => Box::new(SevenZipBackend::new(settings)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stream" | "a" => Ok(Self::Stream),
            "central" | "central-directory" | "b" => Ok(Self::CentralDirectory),
            "7z" | "7zip" | "sevenzip" | "c" => Ok(Self::SevenZip),
            other => Err(format!("unknown backend '{}' (expected stream, central or 7z)", other)),
        }
    }
}

/// Options for extraction.
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    password: Option<String>,
    delete_source: bool,
}

impl ExtractOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Password for encrypted entries. An empty string means none.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        let password = password.into();
        self.password = (!password.is_empty()).then_some(password);
        self
    }

    /// Delete the archive after a complete (not cancelled) extraction.
    pub fn with_delete_source(mut self, delete: bool) -> Self {
        self.delete_source = delete;
        self
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn delete_source(&self) -> bool {
        self.delete_source
    }
}

/// Options for archive creation.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    password: Option<String>,
    include_root_dir: bool,
}

impl CreateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encrypt entries with AES-256. An empty string means none.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        let password = password.into();
        self.password = (!password.is_empty()).then_some(password);
        self
    }

    /// Keep the input directory itself as the top-level folder in the archive.
    pub fn with_root_dir(mut self, include: bool) -> Self {
        self.include_root_dir = include;
        self
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn include_root_dir(&self) -> bool {
        self.include_root_dir
    }
}

/// One extraction request as seen by a backend worker.
#[derive(Debug, Clone)]
pub struct ExtractJob<'a> {
    pub archive: &'a Path,
    /// Empty means the archive's own directory
    pub output_dir: &'a Path,
    pub password: Option<&'a str>,
    pub delete_source: bool,
    pub filter: EntryFilter,
}

impl<'a> ExtractJob<'a> {
    pub fn new(archive: &'a Path, output_dir: &'a Path, options: &'a ExtractOptions, filter: EntryFilter) -> Self {
        Self {
            archive,
            output_dir,
            password: options.password(),
            delete_source: options.delete_source(),
            filter,
        }
    }

    /// Fail with `NotFound` unless the archive is an existing file.
    pub fn require_source(&self) -> Result<()> {
        if self.archive.is_file() {
            Ok(())
        } else {
            Err(ArchiveError::not_found(self.archive))
        }
    }
}

/// A compression engine.
///
/// Implementations hold their own [`CancellationToken`]. Workers poll it but
/// never reset it, so a batch driving `unpack` repeatedly still sees an abort
/// requested between archives.
pub trait ArchiveBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn cancellation(&self) -> &CancellationToken;

    /// Whether `archive` opens and yields at least one entry header. Never fails.
    fn probe(&self, archive: &Path) -> bool;

    /// All entries in archive order.
    fn list(&self, archive: &Path, password: Option<&str>) -> Result<Vec<ArchiveEntryInfo>>;

    /// Extraction worker.
    fn unpack(&self, job: &ExtractJob<'_>, progress: Option<&ProgressCallback>) -> Result<Outcome<ExtractStats>>;

    /// Creation worker. The destination has already been cleared.
    fn pack(
        &self,
        plan: &PackPlan,
        password: Option<&str>,
        progress: Option<&ProgressCallback>,
    ) -> Result<Outcome<Vec<ArchiveEntryInfo>>>;

    fn extract_all(
        &self,
        archive: &Path,
        output_dir: &Path,
        options: &ExtractOptions,
        progress: Option<&ProgressCallback>,
    ) -> Result<Outcome<ExtractStats>> {
        self.cancellation().reset();
        let job = ExtractJob::new(archive, output_dir, options, EntryFilter::all());
        self.unpack(&job, progress).map_err(|e| e.in_archive(archive))
    }

    /// Like [`extract_all`](Self::extract_all), restricted to entries whose names
    /// match `entries` case-insensitively. Directory names in `entries` are
    /// ignored; an empty list extracts everything.
    fn extract_subset(
        &self,
        archive: &Path,
        output_dir: &Path,
        options: &ExtractOptions,
        entries: &[String],
        progress: Option<&ProgressCallback>,
    ) -> Result<Outcome<ExtractStats>> {
        self.cancellation().reset();
        let job = ExtractJob::new(archive, output_dir, options, EntryFilter::new(entries));
        self.unpack(&job, progress).map_err(|e| e.in_archive(archive))
    }

    fn create_from_directory(
        &self,
        input_dir: &Path,
        archive: &Path,
        options: &CreateOptions,
        progress: Option<&ProgressCallback>,
    ) -> Result<Outcome<Vec<ArchiveEntryInfo>>> {
        self.cancellation().reset();
        let plan = PackPlan::for_directory(input_dir, archive, options.include_root_dir())
            .map_err(|e| e.in_archive(pack_context(archive, input_dir)))?;
        run_pack(self, &plan, options, progress)
    }

    /// Pack `files` (files or directories) that all live under `common_root`.
    fn create_from_files(
        &self,
        files: &[PathBuf],
        common_root: &Path,
        archive: &Path,
        options: &CreateOptions,
        progress: Option<&ProgressCallback>,
    ) -> Result<Outcome<Vec<ArchiveEntryInfo>>> {
        self.cancellation().reset();
        let plan = PackPlan::new(files, common_root, archive, options.include_root_dir())
            .map_err(|e| e.in_archive(pack_context(archive, common_root)))?;
        run_pack(self, &plan, options, progress)
    }

    /// Request cancellation; observed at the next chunk or entry boundary.
    fn abort(&self) {
        self.cancellation().cancel();
    }
}

/// Path named in pack errors raised before the archive location is resolved.
fn pack_context<'p>(archive: &'p Path, input: &'p Path) -> &'p Path {
    if archive.as_os_str().is_empty() {
        input
    } else {
        archive
    }
}

fn run_pack<B: ArchiveBackend + ?Sized>(
    backend: &B,
    plan: &PackPlan,
    options: &CreateOptions,
    progress: Option<&ProgressCallback>,
) -> Result<Outcome<Vec<ArchiveEntryInfo>>> {
    plan.clear_destination()?;
    tracing::info!(
        "Creating {} from {} entries ({} bytes) with {} backend",
        plan.archive.display(),
        plan.items.len(),
        plan.total_bytes,
        backend.kind()
    );
    backend
        .pack(plan, options.password(), progress)
        .map_err(|e| e.in_archive(&plan.archive))
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Fixture builders shared by backend tests.

    use std::fs::File;
    use std::io::Write;
    use std::path::Path;

    use zip::write::SimpleFileOptions;

    /// `a.txt` ("hello"), `sub/b.txt` (empty), `sub/empty/`.
    pub fn write_sample_zip(path: &Path) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();

        zip.start_file("a.txt", options).unwrap();
        zip.write_all(b"hello").unwrap();
        zip.start_file("sub/b.txt", options).unwrap();
        zip.add_directory("sub/empty/", options).unwrap();
        zip.finish().unwrap();
    }

    /// Archive with one well-behaved entry and one that escapes the output root.
    pub fn write_traversal_zip(path: &Path) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();

        zip.start_file("ok.txt", options).unwrap();
        zip.write_all(b"fine").unwrap();
        zip.start_file("../../evil.txt", options).unwrap();
        zip.write_all(b"evil").unwrap();
        zip.finish().unwrap();
    }

    /// `count` files of `size` bytes each, named `f{i}.bin`.
    pub fn write_bulk_zip(path: &Path, count: usize, size: usize) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();

        for i in 0..count {
            zip.start_file(format!("f{}.bin", i), options).unwrap();
            zip.write_all(&data).unwrap();
        }
        zip.finish().unwrap();
    }

    /// Same entries as [`write_sample_zip`] minus the directory, written the
    /// way non-seeking tools write: sizes follow each entry in a data
    /// descriptor.
    pub fn write_streamed_zip(path: &Path) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new_stream(file);
        let options = SimpleFileOptions::default();

        zip.start_file("a.txt", options).unwrap();
        zip.write_all(b"hello").unwrap();
        zip.start_file("sub/c.bin", options).unwrap();
        zip.write_all(&[7u8; 3000]).unwrap();
        zip.finish().unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("stream".parse::<BackendKind>().unwrap(), BackendKind::Stream);
        assert_eq!("Central".parse::<BackendKind>().unwrap(), BackendKind::CentralDirectory);
        assert_eq!("7z".parse::<BackendKind>().unwrap(), BackendKind::SevenZip);
        assert!("rar".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_backend_kind_round_trips_as_str() {
        for kind in BackendKind::ALL {
            assert_eq!(kind.as_str().parse::<BackendKind>().unwrap(), kind);
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_create_matches_kind() {
        let settings = Settings::default();
        for kind in BackendKind::ALL {
            assert_eq!(kind.create(&settings).kind(), kind);
        }
    }

    #[test]
    fn test_pack_missing_input_names_context() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing");
        let settings = Settings::default();

        for kind in [BackendKind::Stream, BackendKind::CentralDirectory] {
            let backend = kind.create(&settings);
            let err = backend
                .create_from_directory(&missing, Path::new(""), &CreateOptions::new(), None)
                .unwrap_err();
            assert!(matches!(&err, ArchiveError::Transfer { archive, .. } if archive == &missing));
            assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);

            let target = dir.path().join("out.zip");
            let err = backend
                .create_from_files(&[missing.join("a.txt")], &missing, &target, &CreateOptions::new(), None)
                .unwrap_err();
            assert!(matches!(&err, ArchiveError::Transfer { archive, .. } if archive == &target));
        }
    }

    #[test]
    fn test_empty_password_is_none() {
        let options = ExtractOptions::new().with_password("");
        assert_eq!(options.password(), None);
        let options = CreateOptions::new().with_password("secret").with_root_dir(true);
        assert_eq!(options.password(), Some("secret"));
        assert!(options.include_root_dir());
    }
}
