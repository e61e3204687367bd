//! Extract every ZIP archive found under a folder.
//!
//! Each archive goes to `<output>/<archive stem>`. One bad archive does not
//! stop the batch; its error is recorded in the [`BatchReport`] and the next
//! archive is tried.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::backend::{ArchiveBackend, ExtractJob, ExtractOptions};
use crate::error::{ArchiveError, Result};
use crate::progress::{emit, ArchiveProgress, ProgressCallback};
use crate::sanitize::EntryFilter;
use crate::transfer::Outcome;

/// What to do with each archive after a successful extraction.
#[derive(Debug, Clone, Default)]
pub struct BatchOptions {
    password: Option<String>,
    move_source: bool,
    move_to: Option<PathBuf>,
}

impl BatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        let password = password.into();
        self.password = (!password.is_empty()).then_some(password);
        self
    }

    /// Remove the source archive once extracted. With [`with_move_to`](Self::with_move_to)
    /// pointing at an existing directory it is moved there instead.
    pub fn with_move_source(mut self, move_source: bool) -> Self {
        self.move_source = move_source;
        self
    }

    pub fn with_move_to(mut self, dir: impl Into<PathBuf>) -> Self {
        self.move_to = Some(dir.into());
        self
    }
}

#[derive(Debug)]
pub struct BatchFailure {
    pub archive: PathBuf,
    pub error: ArchiveError,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    /// Destination directory of every archive that extracted completely
    pub directories: Vec<PathBuf>,
    pub failed: Vec<BatchFailure>,
    pub cancelled: bool,
}

/// Find `*.zip` files under `folder`, case-insensitively, sorted by path.
pub fn find_archives(folder: &Path) -> Vec<PathBuf> {
    WalkDir::new(folder)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("zip"))
                .unwrap_or(false)
        })
        .map(|e| e.into_path())
        .collect()
}

/// Extract all archives in `folder` into per-archive folders under `output_dir`.
///
/// Progress counts archives, not bytes. An empty `output_dir` extracts next
/// to the archives.
pub fn extract_all_archives_in_folder(
    backend: &dyn ArchiveBackend,
    folder: &Path,
    output_dir: &Path,
    options: &BatchOptions,
    progress: Option<&ProgressCallback>,
) -> Result<BatchReport> {
    if !folder.is_dir() {
        return Err(ArchiveError::not_found(folder));
    }
    backend.cancellation().reset();

    let output_root = if output_dir.as_os_str().is_empty() {
        folder
    } else {
        output_dir
    };

    let archives = find_archives(folder);
    info!("Found {} archives in {}", archives.len(), folder.display());

    let extract_options = match &options.password {
        Some(pass) => ExtractOptions::new().with_password(pass.clone()),
        None => ExtractOptions::new(),
    };

    let mut report = BatchReport::default();
    let count = archives.len();

    for (index, archive) in archives.iter().enumerate() {
        if backend.cancellation().is_cancelled() {
            report.cancelled = true;
            break;
        }

        emit(
            progress,
            ArchiveProgress::Changed {
                percent: ((index + 1) * 100 / count) as u8,
                item: Some(archive.clone()),
            },
        );

        let stem = archive.file_stem().map(PathBuf::from).unwrap_or_default();
        let dest = output_root.join(stem);

        let job = ExtractJob::new(archive, &dest, &extract_options, EntryFilter::all());
        match backend.unpack(&job, None) {
            Ok(Outcome::Completed(stats)) => {
                debug!("{} -> {} ({} files)", archive.display(), dest.display(), stats.files);
                if options.move_source {
                    if let Err(e) = dispose_source(archive, options.move_to.as_deref()) {
                        warn!("Extracted {} but could not remove it: {}", archive.display(), e);
                        report.failed.push(BatchFailure {
                            archive: archive.clone(),
                            error: e,
                        });
                    }
                }
                report.directories.push(dest);
            }
            Ok(Outcome::Cancelled) => {
                report.cancelled = true;
                break;
            }
            Err(e) => {
                warn!("Failed to extract {}: {}", archive.display(), e);
                report.failed.push(BatchFailure {
                    archive: archive.clone(),
                    error: e.in_archive(archive),
                });
            }
        }
    }

    info!(
        "Batch finished: {} extracted, {} failed{}",
        report.directories.len(),
        report.failed.len(),
        if report.cancelled { " (cancelled)" } else { "" }
    );
    Ok(report)
}

/// Copy into `move_to` then delete, or just delete when there is no target directory.
fn dispose_source(archive: &Path, move_to: Option<&Path>) -> Result<()> {
    if let Some(dir) = move_to.filter(|d| d.is_dir()) {
        let name = archive
            .file_name()
            .ok_or_else(|| ArchiveError::write(archive, "archive has no file name"))?;
        let target = dir.join(name);
        fs::copy(archive, &target).map_err(|e| ArchiveError::write(&target, e))?;
        debug!("Moved {} to {}", archive.display(), target.display());
    }
    fs::remove_file(archive).map_err(|e| ArchiveError::write(archive, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::write_sample_zip;
    use crate::backend::StreamBackend;
    use crate::config::Settings;
    use crate::error::ErrorKind;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    #[test]
    fn test_find_archives_is_recursive_and_case_insensitive() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("nested")).unwrap();
        write_sample_zip(&dir.path().join("one.zip"));
        write_sample_zip(&dir.path().join("nested/TWO.ZIP"));
        fs::write(dir.path().join("readme.txt"), "x").unwrap();

        let found = find_archives(dir.path());
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|p| p.extension().is_some()));
    }

    #[test]
    fn test_missing_folder_is_not_found() {
        let dir = tempdir().unwrap();
        let backend = StreamBackend::new(&Settings::default());
        let err = extract_all_archives_in_folder(
            &backend,
            &dir.path().join("nope"),
            dir.path(),
            &BatchOptions::new(),
            None,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_corrupt_archive_does_not_stop_batch() {
        let dir = tempdir().unwrap();
        let zips = dir.path().join("zips");
        let out = dir.path().join("out");
        fs::create_dir_all(&zips).unwrap();
        write_sample_zip(&zips.join("a_good.zip"));
        fs::write(zips.join("b_bad.zip"), b"this is not a zip").unwrap();
        write_sample_zip(&zips.join("c_good.zip"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: ProgressCallback = Arc::new(move |p: &ArchiveProgress| sink.lock().unwrap().push(p.percent()));

        let backend = StreamBackend::new(&Settings::default());
        let report =
            extract_all_archives_in_folder(&backend, &zips, &out, &BatchOptions::new(), Some(&cb)).unwrap();

        assert_eq!(report.directories, vec![out.join("a_good"), out.join("c_good")]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].archive, zips.join("b_bad.zip"));
        assert!(!report.cancelled);
        assert_eq!(fs::read(out.join("c_good/a.txt")).unwrap(), b"hello");
        assert_eq!(*seen.lock().unwrap(), vec![33, 66, 100]);
    }

    #[test]
    fn test_move_source_to_existing_dir() {
        let dir = tempdir().unwrap();
        let zips = dir.path().join("zips");
        let done = dir.path().join("done");
        fs::create_dir_all(&zips).unwrap();
        fs::create_dir_all(&done).unwrap();
        write_sample_zip(&zips.join("one.zip"));

        let backend = StreamBackend::new(&Settings::default());
        let options = BatchOptions::new().with_move_source(true).with_move_to(&done);
        let report =
            extract_all_archives_in_folder(&backend, &zips, &dir.path().join("out"), &options, None).unwrap();

        assert!(report.failed.is_empty());
        assert!(!zips.join("one.zip").exists());
        assert!(done.join("one.zip").exists());
    }

    #[test]
    fn test_move_source_without_target_deletes() {
        let dir = tempdir().unwrap();
        let zips = dir.path().join("zips");
        fs::create_dir_all(&zips).unwrap();
        write_sample_zip(&zips.join("one.zip"));

        let backend = StreamBackend::new(&Settings::default());
        let options = BatchOptions::new()
            .with_move_source(true)
            .with_move_to(dir.path().join("missing"));
        let _ = extract_all_archives_in_folder(&backend, &zips, &dir.path().join("out"), &options, None).unwrap();

        assert!(!zips.join("one.zip").exists());
        assert!(!dir.path().join("missing").exists());
    }

    #[test]
    fn test_abort_between_archives_stops_batch() {
        let dir = tempdir().unwrap();
        let zips = dir.path().join("zips");
        let out = dir.path().join("out");
        fs::create_dir_all(&zips).unwrap();
        for name in ["a.zip", "b.zip", "c.zip"] {
            write_sample_zip(&zips.join(name));
        }

        let backend = Arc::new(StreamBackend::new(&Settings::default()));
        let remote = backend.clone();
        // Abort as soon as the first archive is announced
        let cb: ProgressCallback = Arc::new(move |_: &ArchiveProgress| remote.abort());

        let report = extract_all_archives_in_folder(backend.as_ref(), &zips, &out, &BatchOptions::new(), Some(&cb))
            .unwrap();

        assert!(report.cancelled);
        assert!(report.directories.is_empty());
        assert!(!out.join("b").exists());
        assert!(zips.join("a.zip").exists());
    }
}
