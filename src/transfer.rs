//! Chunked transfer engine shared by every backend.
//!
//! Backends differ in how they open entry streams; everything after that is
//! common: the chunk loop with its size clamp, progress accounting,
//! cancellation polling, partial-output cleanup and timestamp restoration.
//!
//! Cancellation is reported through [`Outcome::Cancelled`], never as an error.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use tracing::{debug, info, warn};

use crate::backend::ExtractJob;
use crate::cancel::CancellationToken;
use crate::entry::ArchiveEntryInfo;
use crate::error::{ArchiveError, Result};
use crate::file_list::FileList;
use crate::progress::{ProgressCallback, ProgressTracker};
use crate::sanitize::{entry_destination, lexical_normalize, resolve_output_dir};

/// Result of a long-running operation that may be cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Outcome<T> {
    Completed(T),
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            Self::Cancelled => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Completed(value) => Outcome::Completed(f(value)),
            Self::Cancelled => Outcome::Cancelled,
        }
    }
}

/// Counters for one extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    pub files: usize,
    pub directories: usize,
    /// Entries refused because they would land outside the output directory
    pub skipped: usize,
    pub bytes: u64,
}

/// Failure inside the chunk loop, before context is attached.
#[derive(Debug)]
pub(crate) enum CopyError {
    Read(io::Error),
    Write(io::Error),
    /// Stream ended before the declared size
    Short { actual: u64 },
    /// Stream carried more than the declared size
    Long { actual: u64 },
}

impl CopyError {
    /// Context for copying out of an archive into `dest`.
    pub(crate) fn extracting(self, archive: &Path, entry: &str, declared: u64, dest: &Path) -> ArchiveError {
        match self {
            Self::Read(e) => ArchiveError::read(archive, format!("entry '{}': {}", entry, e)),
            Self::Write(e) => ArchiveError::write(dest, e),
            Self::Short { actual } | Self::Long { actual } => ArchiveError::EntryIntegrity {
                archive: archive.to_path_buf(),
                entry: entry.to_string(),
                declared,
                actual,
            },
        }
    }

    /// Context for copying a source file into `archive`.
    pub(crate) fn packing(self, archive: &Path, entry: &str, declared: u64) -> ArchiveError {
        match self {
            Self::Read(e) => ArchiveError::Io(e),
            Self::Write(e) => ArchiveError::write(archive, e),
            Self::Short { actual } | Self::Long { actual } => ArchiveError::EntryIntegrity {
                archive: archive.to_path_buf(),
                entry: entry.to_string(),
                declared,
                actual,
            },
        }
    }
}

/// Fixed-size buffer copy loop with progress and cancellation.
pub(crate) struct ChunkCopier<'a> {
    buffer: Vec<u8>,
    cancel: &'a CancellationToken,
    tracker: ProgressTracker,
    progress: Option<&'a ProgressCallback>,
}

impl<'a> ChunkCopier<'a> {
    pub(crate) fn new(
        chunk_size: usize,
        total_bytes: u64,
        cancel: &'a CancellationToken,
        progress: Option<&'a ProgressCallback>,
    ) -> Self {
        Self {
            buffer: vec![0u8; chunk_size.max(1)],
            cancel,
            tracker: ProgressTracker::new(total_bytes),
            progress,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Copy exactly `declared` bytes from `reader` to `writer`.
    ///
    /// Each read asks for at most the bytes still owed, so no more than
    /// `declared` bytes ever reach the writer. After the last chunk one more
    /// read checks the stream is really exhausted; checksumming readers also
    /// verify their CRC on that read.
    pub(crate) fn copy<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        declared: u64,
        item: &Path,
    ) -> std::result::Result<Outcome<u64>, CopyError>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        let mut written = 0u64;
        while written < declared {
            if self.cancel.is_cancelled() {
                return Ok(Outcome::Cancelled);
            }

            let want = (declared - written).min(self.buffer.len() as u64) as usize;
            let n = read_some(reader, &mut self.buffer[..want]).map_err(CopyError::Read)?;
            if n == 0 {
                return Err(CopyError::Short { actual: written });
            }

            writer.write_all(&self.buffer[..n]).map_err(CopyError::Write)?;
            written += n as u64;
            self.tracker.report(n as u64, item, self.progress);
        }

        let mut probe = [0u8; 1];
        match read_some(reader, &mut probe).map_err(CopyError::Read)? {
            0 => Ok(Outcome::Completed(written)),
            n => {
                let rest = io::copy(reader, &mut io::sink()).map_err(CopyError::Read)?;
                Err(CopyError::Long {
                    actual: written + n as u64 + rest,
                })
            }
        }
    }

    /// Emit the closing 100% if byte accounting did not get there.
    pub(crate) fn complete(&mut self) {
        self.tracker.complete(self.progress);
    }
}

fn read_some<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Output file that is deleted unless committed.
pub(crate) struct PartialFile {
    path: PathBuf,
    file: Option<File>,
}

impl PartialFile {
    pub(crate) fn create(path: &Path) -> Result<Self> {
        let file = File::create(path).map_err(|e| ArchiveError::write(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    /// Keep the file, stamping it with `modified` when known.
    pub(crate) fn commit(mut self, modified: Option<NaiveDateTime>) {
        if let Some(file) = self.file.take() {
            if let Some(ts) = modified {
                if let Err(e) = set_file_time(&file, ts) {
                    warn!("Could not set timestamp on {}: {}", self.path.display(), e);
                }
            }
        }
    }
}

impl Write for PartialFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.as_mut() {
            Some(file) => file.write(buf),
            None => Err(io::Error::other("file already committed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            drop(file);
            match fs::remove_file(&self.path) {
                Ok(()) => debug!("Removed partial file {}", self.path.display()),
                Err(e) => warn!("Could not remove partial file {}: {}", self.path.display(), e),
            }
        }
    }
}

/// Archive being written; removed entirely unless committed.
pub(crate) struct PartialArchive {
    path: PathBuf,
    committed: bool,
}

impl PartialArchive {
    pub(crate) fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            committed: false,
        }
    }

    pub(crate) fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for PartialArchive {
    fn drop(&mut self) {
        if self.committed || !self.path.exists() {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed incomplete archive {}", self.path.display()),
            Err(e) => warn!("Could not remove incomplete archive {}: {}", self.path.display(), e),
        }
    }
}

/// Interpret a local wall-clock time as a `SystemTime`.
pub(crate) fn local_to_system_time(ts: NaiveDateTime) -> Option<SystemTime> {
    Local
        .from_local_datetime(&ts)
        .earliest()
        .map(SystemTime::from)
}

fn set_file_time(file: &File, ts: NaiveDateTime) -> io::Result<()> {
    match local_to_system_time(ts) {
        Some(time) => file.set_modified(time),
        None => Ok(()),
    }
}

/// Modification time of a file as local wall-clock time.
pub(crate) fn modified_local(meta: &fs::Metadata) -> Option<NaiveDateTime> {
    meta.modified()
        .ok()
        .map(|time| DateTime::<Local>::from(time).naive_local())
}

/// Per-entry driver for one extraction pass.
///
/// Backends feed it entries in archive order; it decides where each one
/// goes, writes it and keeps the counters.
pub(crate) struct ExtractSession<'a> {
    job: &'a ExtractJob<'a>,
    root: PathBuf,
    copier: ChunkCopier<'a>,
    stats: ExtractStats,
    cancelled: bool,
}

impl<'a> ExtractSession<'a> {
    /// Resolve the output root and size the operation from a pre-pass listing.
    pub(crate) fn begin(
        job: &'a ExtractJob<'a>,
        listing: &[ArchiveEntryInfo],
        chunk_size: usize,
        cancel: &'a CancellationToken,
        progress: Option<&'a ProgressCallback>,
    ) -> Result<Self> {
        let root = resolve_output_dir(job.output_dir, job.archive)?;
        fs::create_dir_all(&root).map_err(|e| ArchiveError::write(&root, e))?;

        let total: u64 = listing
            .iter()
            .filter(|e| !e.is_directory && job.filter.matches(&e.path))
            .filter(|e| entry_destination(&root, &e.path).is_some())
            .map(|e| e.size)
            .sum();

        info!(
            "Extracting {} ({} entries, {} bytes) to {}",
            job.archive.display(),
            listing.len(),
            total,
            root.display()
        );

        Ok(Self {
            job,
            root,
            copier: ChunkCopier::new(chunk_size, total, cancel, progress),
            stats: ExtractStats::default(),
            cancelled: false,
        })
    }

    /// Entry-boundary cancellation check. Once true, the session stays cancelled.
    pub(crate) fn check_cancelled(&mut self) -> bool {
        if !self.cancelled && self.copier.is_cancelled() {
            self.cancelled = true;
        }
        self.cancelled
    }

    /// Destination of an entry, or `None` if it is filtered out or unsafe.
    pub(crate) fn destination(&mut self, name: &str, is_dir: bool) -> Option<PathBuf> {
        if is_dir && !self.job.filter.is_all() {
            return None;
        }
        if !is_dir && !self.job.filter.matches(name) {
            return None;
        }

        match entry_destination(&self.root, name) {
            Some(dest) => Some(dest),
            None => {
                warn!("Skipping entry '{}': resolves outside {}", name, self.root.display());
                self.stats.skipped += 1;
                None
            }
        }
    }

    pub(crate) fn directory(&mut self, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest).map_err(|e| ArchiveError::write(dest, e))?;
        self.stats.directories += 1;
        Ok(())
    }

    /// Stream one file entry to `dest`. The file is removed again if the copy
    /// is cancelled or fails.
    pub(crate) fn file<R: Read + ?Sized>(
        &mut self,
        name: &str,
        dest: &Path,
        reader: &mut R,
        declared: u64,
        modified: Option<NaiveDateTime>,
    ) -> Result<Outcome<()>> {
        self.file_verified(name, dest, reader, declared, modified, || Ok(()))
    }

    /// Like [`file`](Self::file), but `verify` must also pass after the copy
    /// before the output is kept.
    pub(crate) fn file_verified<R, F>(
        &mut self,
        name: &str,
        dest: &Path,
        reader: &mut R,
        declared: u64,
        modified: Option<NaiveDateTime>,
        verify: F,
    ) -> Result<Outcome<()>>
    where
        R: Read + ?Sized,
        F: FnOnce() -> Result<()>,
    {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| ArchiveError::write(parent, e))?;
        }

        let mut out = PartialFile::create(dest)?;
        match self.copier.copy(reader, &mut out, declared, Path::new(name)) {
            Ok(Outcome::Completed(bytes)) => {
                verify()?;
                out.commit(modified);
                debug!("Extracted {} ({} bytes)", name, bytes);
                self.stats.files += 1;
                self.stats.bytes += bytes;
                Ok(Outcome::Completed(()))
            }
            Ok(Outcome::Cancelled) => {
                debug!("Cancelled while extracting {}", name);
                self.cancelled = true;
                Ok(Outcome::Cancelled)
            }
            Err(e) => Err(e.extracting(self.job.archive, name, declared, dest)),
        }
    }

    /// Close the pass: report 100%, then delete the source if requested.
    pub(crate) fn finish(mut self) -> Result<Outcome<ExtractStats>> {
        if self.cancelled {
            info!(
                "Extraction of {} cancelled after {} files",
                self.job.archive.display(),
                self.stats.files
            );
            return Ok(Outcome::Cancelled);
        }

        self.copier.complete();

        if self.job.delete_source {
            fs::remove_file(self.job.archive).map_err(|e| ArchiveError::write(self.job.archive, e))?;
            debug!("Deleted source archive {}", self.job.archive.display());
        }

        info!(
            "Extracted {} files, {} directories ({} bytes) from {}",
            self.stats.files,
            self.stats.directories,
            self.stats.bytes,
            self.job.archive.display()
        );
        Ok(Outcome::Completed(self.stats))
    }
}

/// One item to be written into a new archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackItem {
    pub source: PathBuf,
    /// Archive-relative name; directory markers end in `/`
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub modified: Option<NaiveDateTime>,
}

impl PackItem {
    pub fn info(&self) -> ArchiveEntryInfo {
        if self.is_dir {
            ArchiveEntryInfo::directory(self.name.clone(), self.modified)
        } else {
            ArchiveEntryInfo::file(self.name.clone(), self.size, self.modified)
        }
    }
}

/// Everything a backend needs to write an archive.
#[derive(Debug, Clone)]
pub struct PackPlan {
    /// Absolute destination path
    pub archive: PathBuf,
    /// Directory entry names are relative to
    pub base: PathBuf,
    pub items: Vec<PackItem>,
    pub total_bytes: u64,
}

impl PackPlan {
    /// Plan packing everything under `input_dir`.
    pub fn for_directory(input_dir: &Path, archive: &Path, include_root_dir: bool) -> Result<Self> {
        Self::new(&[input_dir.to_path_buf()], input_dir, archive, include_root_dir)
    }

    /// Plan packing `sources`, which must all live under `root`.
    ///
    /// Entry names are relative to `root`, or to its parent with
    /// `include_root_dir`. A file `root` is named after itself. An empty
    /// `archive` means `<root>/<root name>.zip`. The archive itself is never
    /// packed, even when it lies inside the input tree.
    pub fn new(sources: &[PathBuf], root: &Path, archive: &Path, include_root_dir: bool) -> Result<Self> {
        let root = lexical_normalize(&std::path::absolute(root)?);
        let root_meta = fs::metadata(&root).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ArchiveError::not_found(&root),
            _ => ArchiveError::Io(e),
        })?;

        let container = if root_meta.is_dir() {
            root.clone()
        } else {
            root.parent().map(Path::to_path_buf).unwrap_or_else(|| root.clone())
        };

        let archive = if archive.as_os_str().is_empty() {
            let stem = root
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "archive".to_string());
            container.join(format!("{}.zip", stem))
        } else {
            lexical_normalize(&std::path::absolute(archive)?)
        };

        let base = if !root_meta.is_dir() || include_root_dir {
            root.parent().map(Path::to_path_buf).unwrap_or_else(|| root.clone())
        } else {
            root.clone()
        };

        let mut list = FileList::default();
        for source in sources {
            let source = lexical_normalize(&std::path::absolute(source)?);
            if !source.starts_with(&root) {
                return Err(ArchiveError::write(
                    &archive,
                    format!("{} is not under {}", source.display(), root.display()),
                ));
            }
            list.add(&source)?;
        }

        let mut seen = HashSet::new();
        let mut items = Vec::with_capacity(list.len());
        let mut total_bytes = 0u64;

        for listed in list.items {
            if listed.path == archive {
                debug!("Not packing the output archive itself: {}", archive.display());
                continue;
            }

            let Some(mut name) = relative_name(&listed.path, &base) else {
                continue;
            };
            if listed.is_empty_dir {
                name.push('/');
            }
            if !seen.insert(name.clone()) {
                debug!("Skipping duplicate entry {}", name);
                continue;
            }

            let modified = fs::metadata(&listed.path).ok().as_ref().and_then(modified_local);
            total_bytes += listed.size;
            items.push(PackItem {
                source: listed.path,
                name,
                size: listed.size,
                is_dir: listed.is_empty_dir,
                modified,
            });
        }

        Ok(Self {
            archive,
            base,
            items,
            total_bytes,
        })
    }

    /// Remove an existing file at the destination before writing.
    pub fn clear_destination(&self) -> Result<()> {
        match fs::remove_file(&self.archive) {
            Ok(()) => {
                debug!("Removed existing archive {}", self.archive.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ArchiveError::write(&self.archive, e)),
        }
    }

    pub fn entries(&self) -> Vec<ArchiveEntryInfo> {
        self.items.iter().map(PackItem::info).collect()
    }
}

/// `path` relative to `base`, forward-slash joined. `None` when empty or not under `base`.
fn relative_name(path: &Path, base: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ArchiveProgress;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    fn copier(chunk: usize, total: u64, cancel: &CancellationToken) -> ChunkCopier<'_> {
        ChunkCopier::new(chunk, total, cancel, None)
    }

    #[test]
    fn test_copy_in_chunks() {
        let cancel = CancellationToken::new();
        let mut c = copier(4, 10, &cancel);
        let mut out = Vec::new();
        let res = c.copy(&mut &b"0123456789"[..], &mut out, 10, Path::new("x")).unwrap();
        assert_eq!(res, Outcome::Completed(10));
        assert_eq!(out, b"0123456789");
    }

    #[test]
    fn test_copy_detects_overlong_stream() {
        let cancel = CancellationToken::new();
        let mut c = copier(4, 5, &cancel);
        let mut out = Vec::new();
        let err = c.copy(&mut &b"0123456789"[..], &mut out, 5, Path::new("x")).unwrap_err();
        assert!(matches!(err, CopyError::Long { actual: 10 }));
        // never more than declared reaches the writer
        assert_eq!(out, b"01234");
    }

    #[test]
    fn test_copy_detects_short_stream() {
        let cancel = CancellationToken::new();
        let mut c = copier(4, 8, &cancel);
        let mut out = Vec::new();
        let err = c.copy(&mut &b"abc"[..], &mut out, 8, Path::new("x")).unwrap_err();
        assert!(matches!(err, CopyError::Short { actual: 3 }));
    }

    #[test]
    fn test_copy_stops_when_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut c = copier(4, 10, &cancel);
        let mut out = Vec::new();
        let res = c.copy(&mut &b"0123456789"[..], &mut out, 10, Path::new("x")).unwrap();
        assert!(res.is_cancelled());
        assert!(out.is_empty());
    }

    #[test]
    fn test_copy_progress_is_monotonic() {
        let cancel = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: ProgressCallback = Arc::new(move |p: &ArchiveProgress| sink.lock().unwrap().push(p.percent()));

        let data = vec![7u8; 1000];
        let mut c = ChunkCopier::new(64, 1000, &cancel, Some(&cb));
        let mut out = Vec::new();
        let _ = c.copy(&mut &data[..], &mut out, 1000, Path::new("x")).unwrap();
        c.complete();

        let seen = seen.lock().unwrap();
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(seen.last(), Some(&100));
    }

    #[test]
    fn test_partial_file_removed_unless_committed() {
        let dir = tempdir().unwrap();
        let dropped = dir.path().join("dropped.bin");
        let kept = dir.path().join("kept.bin");

        {
            let mut f = PartialFile::create(&dropped).unwrap();
            f.write_all(b"half").unwrap();
        }
        assert!(!dropped.exists());

        let mut f = PartialFile::create(&kept).unwrap();
        f.write_all(b"whole").unwrap();
        let ts = NaiveDateTime::parse_from_str("2020-05-06 07:08:09", "%Y-%m-%d %H:%M:%S").unwrap();
        f.commit(Some(ts));

        assert_eq!(fs::read(&kept).unwrap(), b"whole");
        let meta = fs::metadata(&kept).unwrap();
        assert_eq!(modified_local(&meta), Some(ts));
    }

    #[test]
    fn test_partial_archive_guard() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.zip");
        fs::write(&path, b"PK").unwrap();
        drop(PartialArchive::new(&path));
        assert!(!path.exists());

        fs::write(&path, b"PK").unwrap();
        PartialArchive::new(&path).commit();
        assert!(path.exists());
    }

    #[test]
    fn test_plan_names_relative_to_input() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        fs::create_dir_all(input.join("x")).unwrap();
        fs::write(input.join("x/y.bin"), [0u8; 100]).unwrap();

        let plan = PackPlan::for_directory(&input, &dir.path().join("out.zip"), false).unwrap();
        assert_eq!(plan.items.len(), 1);
        assert_eq!(plan.items[0].name, "x/y.bin");
        assert_eq!(plan.total_bytes, 100);

        let rooted = PackPlan::for_directory(&input, &dir.path().join("out.zip"), true).unwrap();
        assert_eq!(rooted.items[0].name, "in/x/y.bin");
    }

    #[test]
    fn test_plan_default_archive_skips_itself() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("data");
        fs::create_dir_all(input.join("empty")).unwrap();
        fs::write(input.join("a.txt"), b"hello").unwrap();
        fs::write(input.join("data.zip"), b"stale").unwrap();

        let plan = PackPlan::for_directory(&input, Path::new(""), false).unwrap();
        assert_eq!(plan.archive, lexical_normalize(&input.join("data.zip")));

        let mut names: Vec<_> = plan.items.iter().map(|i| i.name.as_str()).collect();
        names.sort();
        assert_eq!(names, vec!["a.txt", "empty/"]);
        assert_eq!(plan.total_bytes, 5);
    }

    #[test]
    fn test_plan_rejects_sources_outside_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        let other = dir.path().join("other.txt");
        fs::create_dir_all(&root).unwrap();
        fs::write(&other, b"x").unwrap();

        let err = PackPlan::new(&[other], &root, &dir.path().join("o.zip"), false).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ArchiveWrite);
    }

    #[test]
    fn test_relative_name() {
        assert_eq!(relative_name(Path::new("/a/b/c.txt"), Path::new("/a")), Some("b/c.txt".to_string()));
        assert_eq!(relative_name(Path::new("/a"), Path::new("/a")), None);
        assert_eq!(relative_name(Path::new("/z/c.txt"), Path::new("/a")), None);
    }
}
