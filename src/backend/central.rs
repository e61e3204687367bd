//! Random-access ZIP backend built on [`zip::ZipArchive`].
//!
//! Sizes come straight from the central directory, so the pre-pass is a
//! metadata scan with no decompression. Encrypted entries are opened with
//! the supplied password.

use std::path::Path;

use tracing::debug;

use super::zipfmt::{self, open_archive as open, scan_archive as scan};
use super::{ArchiveBackend, BackendKind, ExtractJob};
use crate::cancel::CancellationToken;
use crate::config::Settings;
use crate::entry::ArchiveEntryInfo;
use crate::error::{ArchiveError, Result};
use crate::progress::ProgressCallback;
use crate::transfer::{ChunkCopier, ExtractSession, ExtractStats, Outcome, PackPlan};

pub struct CentralDirectoryBackend {
    cancel: CancellationToken,
    chunk_size: usize,
    compression_level: Option<i64>,
}

impl CentralDirectoryBackend {
    pub fn new(settings: &Settings) -> Self {
        Self {
            cancel: CancellationToken::new(),
            chunk_size: settings.effective_chunk_size(),
            compression_level: settings.compression_level,
        }
    }
}

impl ArchiveBackend for CentralDirectoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::CentralDirectory
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn probe(&self, archive: &Path) -> bool {
        match open(archive) {
            Ok(mut zip) => zip.len() > 0 && zip.by_index_raw(0).is_ok(),
            Err(_) => false,
        }
    }

    fn list(&self, archive: &Path, _password: Option<&str>) -> Result<Vec<ArchiveEntryInfo>> {
        let mut zip = open(archive)?;
        let entries = scan(&mut zip, archive)?;
        debug!("Listed {} entries from {}", entries.len(), archive.display());
        Ok(entries)
    }

    fn unpack(&self, job: &ExtractJob<'_>, progress: Option<&ProgressCallback>) -> Result<Outcome<ExtractStats>> {
        job.require_source()?;

        let mut zip = open(job.archive)?;
        let listing = scan(&mut zip, job.archive)?;
        let mut session = ExtractSession::begin(job, &listing, self.chunk_size, &self.cancel, progress)?;

        for (index, info) in listing.iter().enumerate() {
            if session.check_cancelled() {
                break;
            }

            let Some(dest) = session.destination(&info.path, info.is_directory) else {
                continue;
            };

            if info.is_directory {
                session.directory(&dest)?;
                continue;
            }

            let encrypted = zip
                .by_index_raw(index)
                .map_err(|e| ArchiveError::read(job.archive, e))?
                .encrypted();

            let opened = match job.password {
                Some(password) if encrypted => zip.by_index_decrypt(index, password.as_bytes()),
                _ => zip.by_index(index),
            };
            let mut file = opened.map_err(|e| ArchiveError::read(job.archive, format!("entry '{}': {}", info.path, e)))?;

            if session
                .file(&info.path, &dest, &mut file, info.size, info.last_write_time)?
                .is_cancelled()
            {
                break;
            }
        }

        session.finish()
    }

    fn pack(
        &self,
        plan: &PackPlan,
        password: Option<&str>,
        progress: Option<&ProgressCallback>,
    ) -> Result<Outcome<Vec<ArchiveEntryInfo>>> {
        let mut copier = ChunkCopier::new(self.chunk_size, plan.total_bytes, &self.cancel, progress);
        zipfmt::write_plan(plan, password, self.compression_level, &mut copier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::test_support::{write_sample_zip, write_traversal_zip};
    use crate::backend::{CreateOptions, ExtractOptions};
    use crate::error::ErrorKind;
    use std::fs;
    use tempfile::tempdir;

    fn backend() -> CentralDirectoryBackend {
        CentralDirectoryBackend::new(&Settings::default())
    }

    #[test]
    fn test_list_sample() {
        let dir = tempdir().unwrap();
        let zip_path = dir.path().join("sample.zip");
        write_sample_zip(&zip_path);

        let entries = backend().list(&zip_path, None).unwrap();
        let flags: Vec<_> = entries.iter().map(|e| e.is_directory).collect();
        assert_eq!(flags, vec![false, false, true]);
        assert_eq!(entries[0].size, 5);
        assert_eq!(entries[1].size, 0);
    }

    #[test]
    fn test_extract_twice_is_idempotent() {
        let dir = tempdir().unwrap();
        let zip_path = dir.path().join("sample.zip");
        write_sample_zip(&zip_path);

        let b = backend();
        let mut snapshots = Vec::new();
        for run in 0..2 {
            let out = dir.path().join(format!("out{}", run));
            let _ = b.extract_all(&zip_path, &out, &ExtractOptions::new(), None).unwrap();

            let mut files: Vec<_> = walkdir::WalkDir::new(&out)
                .into_iter()
                .filter_map(|e| e.ok())
                .map(|e| {
                    let rel = e.path().strip_prefix(&out).unwrap().to_path_buf();
                    let len = if e.file_type().is_file() { e.metadata().unwrap().len() } else { 0 };
                    (rel, e.file_type().is_dir(), len)
                })
                .collect();
            files.sort();
            snapshots.push(files);
        }
        assert_eq!(snapshots[0], snapshots[1]);
    }

    #[test]
    fn test_password_round_trip() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        fs::create_dir_all(&input).unwrap();
        fs::write(input.join("secret.txt"), b"classified").unwrap();

        let zip_path = dir.path().join("locked.zip");
        let b = backend();
        let _ = b
            .create_from_directory(&input, &zip_path, &CreateOptions::new().with_password("pw"), None)
            .unwrap();

        let without = b
            .extract_all(&zip_path, &dir.path().join("nopw"), &ExtractOptions::new(), None)
            .unwrap_err();
        assert_eq!(without.kind(), ErrorKind::ArchiveRead);
        assert!(!dir.path().join("nopw/secret.txt").exists());

        let out = dir.path().join("out");
        let _ = b
            .extract_all(&zip_path, &out, &ExtractOptions::new().with_password("pw"), None)
            .unwrap();
        assert_eq!(fs::read(out.join("secret.txt")).unwrap(), b"classified");
    }

    #[test]
    fn test_traversal_entry_is_skipped() {
        let dir = tempdir().unwrap();
        let zip_path = dir.path().join("evil.zip");
        let out = dir.path().join("a/b/out");
        write_traversal_zip(&zip_path);

        let stats = backend()
            .extract_all(&zip_path, &out, &ExtractOptions::new(), None)
            .unwrap()
            .completed()
            .unwrap();
        assert_eq!(stats.skipped, 1);
        assert!(!dir.path().join("a/evil.txt").exists());
    }

    #[test]
    fn test_create_scenario_single_nested_file() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        fs::create_dir_all(input.join("x")).unwrap();
        fs::write(input.join("x/y.bin"), vec![9u8; 100]).unwrap();

        let zip_path = dir.path().join("out.zip");
        let b = backend();
        let _ = b
            .create_from_directory(&input, &zip_path, &CreateOptions::new(), None)
            .unwrap();

        let entries = b.list(&zip_path, None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "x/y.bin");
        assert_eq!(entries[0].size, 100);
    }

    #[test]
    fn test_create_from_empty_directory_writes_nothing() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in");
        fs::create_dir_all(&input).unwrap();

        // the root itself has no name relative to itself, so nothing is packed
        let zip_path = dir.path().join("out.zip");
        let written = backend()
            .create_from_directory(&input, &zip_path, &CreateOptions::new(), None)
            .unwrap()
            .completed()
            .unwrap();
        assert!(written.is_empty());
        assert!(!zip_path.exists());
    }

    #[test]
    fn test_create_from_files_relative_to_common_root() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::write(root.join("docs/readme.md"), b"# hi").unwrap();
        fs::write(root.join("skip.txt"), b"no").unwrap();
        fs::write(root.join("keep.txt"), b"yes").unwrap();

        let zip_path = dir.path().join("sel.zip");
        let b = backend();
        let files = vec![root.join("docs"), root.join("keep.txt")];
        let _ = b
            .create_from_files(&files, &root, &zip_path, &CreateOptions::new().with_root_dir(true), None)
            .unwrap();

        let mut names: Vec<_> = b.list(&zip_path, None).unwrap().into_iter().map(|e| e.path).collect();
        names.sort();
        assert_eq!(names, vec!["root/docs/readme.md", "root/keep.txt"]);
    }
}
