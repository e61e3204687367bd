//! Sequential ZIP backend.
//!
//! Walks local file headers front to back with
//! [`zip::read::read_zipfile_from_stream`] and never consults the central
//! directory. Entry totals are therefore unknown until the stream has been
//! scanned once, so extraction always runs two passes: a listing pass to size
//! the progress bar and the copy pass proper.
//!
//! The sequential reader cannot decode encrypted entries; they surface as
//! `ArchiveRead`. Entries whose sizes live in a trailing data descriptor
//! (archives written by streaming tools) are resumed from the central
//! directory at the entry where the stream walk stopped.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use chrono::NaiveDateTime;
use tracing::debug;
use zip::read::read_zipfile_from_stream;

use super::zipfmt::{self, entry_info, lacks_local_sizes};
use super::{ArchiveBackend, BackendKind, ExtractJob};
use crate::cancel::CancellationToken;
use crate::config::Settings;
use crate::entry::ArchiveEntryInfo;
use crate::error::{ArchiveError, Result};
use crate::progress::ProgressCallback;
use crate::transfer::{ChunkCopier, ExtractSession, ExtractStats, Outcome, PackPlan};

pub struct StreamBackend {
    cancel: CancellationToken,
    chunk_size: usize,
    compression_level: Option<i64>,
}

impl StreamBackend {
    pub fn new(settings: &Settings) -> Self {
        Self {
            cancel: CancellationToken::new(),
            chunk_size: settings.effective_chunk_size(),
            compression_level: settings.compression_level,
        }
    }
}

fn open(archive: &Path) -> Result<BufReader<File>> {
    match File::open(archive) {
        Ok(file) => Ok(BufReader::new(file)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ArchiveError::not_found(archive)),
        Err(e) => Err(ArchiveError::read(archive, e)),
    }
}

impl ArchiveBackend for StreamBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Stream
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn probe(&self, archive: &Path) -> bool {
        let Ok(mut reader) = open(archive) else {
            return false;
        };
        let recognised = match read_zipfile_from_stream(&mut reader) {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => lacks_local_sizes(&e),
        };
        recognised
    }

    fn list(&self, archive: &Path, _password: Option<&str>) -> Result<Vec<ArchiveEntryInfo>> {
        let mut reader = open(archive)?;
        let mut entries = Vec::new();

        loop {
            match read_zipfile_from_stream(&mut reader) {
                // Dropping the record skips over its data
                Ok(Some(file)) => entries.push(entry_info(file.name(), file.size(), file.is_dir(), file.last_modified())),
                Ok(None) => break,
                Err(e) if lacks_local_sizes(&e) => {
                    debug!("{} uses data descriptors, listing from the central directory", archive.display());
                    let mut zip = zipfmt::open_archive(archive)?;
                    return zipfmt::scan_archive(&mut zip, archive);
                }
                Err(e) => return Err(ArchiveError::read(archive, e)),
            }
        }

        debug!("Listed {} entries from {}", entries.len(), archive.display());
        Ok(entries)
    }

    fn unpack(&self, job: &ExtractJob<'_>, progress: Option<&ProgressCallback>) -> Result<Outcome<ExtractStats>> {
        job.require_source()?;

        // Pass 1: sizes only
        let listing = self.list(job.archive, job.password)?;
        let mut session = ExtractSession::begin(job, &listing, self.chunk_size, &self.cancel, progress)?;

        // Pass 2: copy
        let mut reader = open(job.archive)?;
        let mut index = 0;
        while !session.check_cancelled() {
            let mut file = match read_zipfile_from_stream(&mut reader) {
                Ok(Some(file)) => file,
                Ok(None) => break,
                Err(e) if lacks_local_sizes(&e) => {
                    resume_from_central_directory(job, &mut session, index)?;
                    break;
                }
                Err(e) => return Err(ArchiveError::read(job.archive, e)),
            };
            index += 1;

            let name = file.name().to_string();
            let is_dir = file.is_dir();
            let size = file.size();
            let modified = file.last_modified().and_then(zipfmt::from_zip_time);
            if !copy_entry(&mut session, &mut file, &name, is_dir, size, modified)? {
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

/// Extract one entry. Returns `false` once the session has been cancelled.
fn copy_entry<R: Read>(
    session: &mut ExtractSession<'_>,
    file: &mut R,
    name: &str,
    is_dir: bool,
    size: u64,
    modified: Option<NaiveDateTime>,
) -> Result<bool> {
    let Some(dest) = session.destination(name, is_dir) else {
        return Ok(true);
    };
    if is_dir {
        session.directory(&dest)?;
        return Ok(true);
    }
    Ok(!session.file(name, &dest, file, size, modified)?.is_cancelled())
}

/// Continue an interrupted stream walk through the central directory,
/// starting at entry `start`.
fn resume_from_central_directory(job: &ExtractJob<'_>, session: &mut ExtractSession<'_>, start: usize) -> Result<()> {
    debug!(
        "{} uses data descriptors, continuing from entry {} via the central directory",
        job.archive.display(),
        start
    );
    let mut zip = zipfmt::open_archive(job.archive)?;
    for i in start..zip.len() {
        if session.check_cancelled() {
            break;
        }
        let mut file = zip.by_index(i).map_err(|e| ArchiveError::read(job.archive, e))?;
        let name = file.name().to_string();
        let is_dir = file.is_dir();
        let size = file.size();
        let modified = file.last_modified().and_then(zipfmt::from_zip_time);
        if !copy_entry(session, &mut file, &name, is_dir, size, modified)? {
            break;
        }
    }
    Ok(())
}
