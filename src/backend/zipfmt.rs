//! ZIP specifics shared by the two pure-Rust backends: DOS timestamps,
//! central-directory access and the archive writer.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use tracing::debug;
use zip::write::{FileOptions, SimpleFileOptions};
use zip::result::ZipError;
use zip::{AesMode, CompressionMethod, ZipArchive, ZipWriter};

use crate::entry::ArchiveEntryInfo;
use crate::error::{ArchiveError, Result};
use crate::transfer::{ChunkCopier, Outcome, PackItem, PackPlan, PartialArchive};

/// Convert a DOS timestamp (local wall-clock time) to chrono.
pub(crate) fn from_zip_time(time: zip::DateTime) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(time.year() as i32, time.month() as u32, time.day() as u32)?
        .and_hms_opt(time.hour() as u32, time.minute() as u32, time.second() as u32)
}

/// Convert to a DOS timestamp. `None` outside the representable 1980..=2107 range.
pub(crate) fn to_zip_time(time: NaiveDateTime) -> Option<zip::DateTime> {
    let year = u16::try_from(time.year()).ok()?;
    zip::DateTime::from_date_and_time(
        year,
        time.month() as u8,
        time.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
    )
    .ok()
}

/// Entry metadata from a zip-crate file record.
pub(crate) fn entry_info(name: &str, size: u64, is_dir: bool, modified: Option<zip::DateTime>) -> ArchiveEntryInfo {
    ArchiveEntryInfo::from_listing(name, size, modified.and_then(from_zip_time), is_dir)
}

pub(crate) type Archive = ZipArchive<BufReader<File>>;

/// Open `archive` for random access through its central directory.
pub(crate) fn open_archive(archive: &Path) -> Result<Archive> {
    let file = match File::open(archive) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ArchiveError::not_found(archive)),
        Err(e) => return Err(ArchiveError::read(archive, e)),
    };
    ZipArchive::new(BufReader::new(file)).map_err(|e| ArchiveError::read(archive, e))
}

/// Entry metadata from the central directory, without decoding any data.
pub(crate) fn scan_archive(zip: &mut Archive, archive: &Path) -> Result<Vec<ArchiveEntryInfo>> {
    let mut entries = Vec::with_capacity(zip.len());
    for i in 0..zip.len() {
        let file = zip.by_index_raw(i).map_err(|e| ArchiveError::read(archive, e))?;
        entries.push(entry_info(file.name(), file.size(), file.is_dir(), file.last_modified()));
    }
    Ok(entries)
}

/// The sequential reader refuses entries whose sizes follow the data in a
/// data descriptor (general purpose flag bit 3); only the central directory
/// knows them.
pub(crate) fn lacks_local_sizes(error: &ZipError) -> bool {
    matches!(error, ZipError::UnsupportedArchive(msg) if msg.contains("length is not available"))
}

fn entry_options<'k>(item: &PackItem, password: Option<&'k str>, level: Option<i64>) -> FileOptions<'k, ()> {
    let mut options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(level)
        .large_file(item.size >= u32::MAX as u64);

    if let Some(time) = item.modified.and_then(to_zip_time) {
        options = options.last_modified_time(time);
    }
    if let Some(pass) = password {
        options = options.with_aes_encryption(AesMode::Aes256, pass);
    }
    options
}

/// Writer opened on the first entry, so an empty plan leaves no file behind.
struct LazyZip<'p> {
    path: &'p Path,
    inner: Option<ZipWriter<File>>,
}

impl<'p> LazyZip<'p> {
    fn get(&mut self) -> Result<&mut ZipWriter<File>> {
        if self.inner.is_none() {
            let file = File::create(self.path).map_err(|e| ArchiveError::write(self.path, e))?;
            debug!("Opened {} for writing", self.path.display());
            self.inner = Some(ZipWriter::new(file));
        }
        self.inner
            .as_mut()
            .ok_or_else(|| ArchiveError::write(self.path, "archive writer unavailable"))
    }

    fn finish(self) -> Result<()> {
        if let Some(writer) = self.inner {
            writer.finish().map_err(|e| ArchiveError::write(self.path, e))?;
        }
        Ok(())
    }
}

/// Write every item of `plan` into a new ZIP archive.
///
/// Cancellation or failure removes the archive.
pub(crate) fn write_plan(
    plan: &PackPlan,
    password: Option<&str>,
    level: Option<i64>,
    copier: &mut ChunkCopier<'_>,
) -> Result<Outcome<Vec<ArchiveEntryInfo>>> {
    let guard = PartialArchive::new(&plan.archive);
    let mut zip = LazyZip {
        path: &plan.archive,
        inner: None,
    };
    let mut written = Vec::with_capacity(plan.items.len());

    for item in &plan.items {
        if copier.is_cancelled() {
            return Ok(Outcome::Cancelled);
        }

        let writer = zip.get()?;
        if item.is_dir {
            writer
                .add_directory(item.name.as_str(), entry_options(item, None, level))
                .map_err(|e| ArchiveError::write(&plan.archive, e))?;
            written.push(item.info());
            continue;
        }

        writer
            .start_file(item.name.as_str(), entry_options(item, password, level))
            .map_err(|e| ArchiveError::write(&plan.archive, e))?;

        let mut source = File::open(&item.source)?;
        match copier.copy(&mut source, writer, item.size, Path::new(&item.name)) {
            Ok(Outcome::Completed(_)) => {
                debug!("Packed {} ({} bytes)", item.name, item.size);
                written.push(item.info());
            }
            Ok(Outcome::Cancelled) => return Ok(Outcome::Cancelled),
            Err(e) => return Err(e.packing(&plan.archive, &item.name, item.size)),
        }
    }

    zip.finish()?;
    copier.complete();
    guard.commit();
    Ok(Outcome::Completed(written))
}
