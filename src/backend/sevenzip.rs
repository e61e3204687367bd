//! 7-Zip binary backend.
//!
//! Drives an external `7zz`/`7z` process instead of decoding in-process.
//!
//! # 7z Commands Reference
//!
//! - List: `7zz l -slt -ba archive.zip`
//!   - `-slt`: technical listing (key = value blocks)
//!   - `-ba`: bare output (no headers)
//!
//! - Extract one entry to stdout: `7zz e -so -spd archive.zip "path/in/archive"`
//!   - `-so`: write to stdout, which is streamed through the shared chunk loop
//!   - `-spd`: disable wildcard matching (treat the name literally)
//!
//! - Create: `7zz a -tzip -bsp1 -spd archive.zip @listfile`
//!   - `-bsp1`: percent progress on stdout, parsed for notifications
//!   - `@listfile`: UTF-8 list of names relative to the working directory
//!
//! Every spawned process is killed and reaped before the operation returns,
//! whether it succeeded, failed or was cancelled.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use chrono::NaiveDateTime;
use tracing::{debug, info, warn};

use super::{ArchiveBackend, BackendKind, ExtractJob};
use crate::cancel::CancellationToken;
use crate::config::Settings;
use crate::entry::ArchiveEntryInfo;
use crate::error::{ArchiveError, ErrorKind, Result};
use crate::progress::{ProgressCallback, ProgressTracker};
use crate::transfer::{ExtractSession, ExtractStats, Outcome, PackPlan, PartialArchive};

/// How often the create loop looks at the cancellation token while 7-Zip is quiet.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Get the path to the 7z binary.
///
/// Looks for the binary in the following locations:
/// 1. The configured path, if it exists
/// 2. `bin/7zz`, `bin/7z.exe` or `7zz` next to the executable
/// 3. System PATH (`7zz`, `7z` or `7za`)
pub fn find_7z(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = configured {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        warn!("Configured 7-Zip binary {} does not exist, searching", path.display());
    }

    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            for candidate in ["bin/7zz", "bin/7z.exe", "7zz", "7z.exe"] {
                let bin_path = exe_dir.join(candidate);
                if bin_path.is_file() {
                    return Ok(bin_path);
                }
            }
        }
    }

    for name in ["7zz", "7z", "7za"] {
        if let Ok(path) = which::which(name) {
            return Ok(path);
        }
    }

    Err(ArchiveError::not_found(Path::new("7zz")))
}

/// Parse 7z technical listing output.
///
/// Directory paths get a trailing `/` so they read like ZIP directory entries.
fn parse_7z_list(output: &[u8]) -> Result<Vec<ArchiveEntryInfo>> {
    let mut entries = Vec::new();
    let mut current: HashMap<String, String> = HashMap::new();

    for line in BufReader::new(output).lines() {
        let line = line?;
        let line = line.trim();

        if line.is_empty() {
            // End of block
            if let Some(entry) = entry_from_block(&current) {
                entries.push(entry);
            }
            current.clear();
        } else if let Some((key, value)) = line.split_once(" = ") {
            current.insert(key.to_string(), value.to_string());
        }
    }

    // Last block without trailing blank line
    if let Some(entry) = entry_from_block(&current) {
        entries.push(entry);
    }

    Ok(entries)
}

fn entry_from_block(block: &HashMap<String, String>) -> Option<ArchiveEntryInfo> {
    // Archive-level blocks carry a Type key
    if block.contains_key("Type") {
        return None;
    }

    let path = block.get("Path").filter(|p| !p.is_empty())?;
    let is_dir = block.get("Folder").map(|v| v == "+").unwrap_or(false);
    let size = block
        .get("Size")
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0);
    let modified = block.get("Modified").and_then(|m| parse_modified(m));

    let path = if is_dir && !path.ends_with('/') && !path.ends_with('\\') {
        format!("{}/", path)
    } else {
        path.clone()
    };

    Some(ArchiveEntryInfo::from_listing(&path, size, modified, is_dir))
}

/// `2024-01-02 03:04:05` with optional fractional seconds.
fn parse_modified(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value.trim(), "%Y-%m-%d %H:%M:%S%.f").ok()
}

/// Pulls percentages out of `-bsp1` output.
///
/// 7-Zip redraws its progress line with backspaces and carriage returns, so
/// output is split on `\b`, `\r` and `\n`, and each segment that starts with
/// a number followed by `%` is a reading.
#[derive(Debug, Default)]
struct ProgressScanner {
    pending: Vec<u8>,
}

impl ProgressScanner {
    fn feed(&mut self, bytes: &[u8]) -> Vec<u8> {
        let mut found = Vec::new();
        for &byte in bytes {
            if matches!(byte, b'\x08' | b'\r' | b'\n') {
                if let Some(p) = parse_percent(&String::from_utf8_lossy(&self.pending)) {
                    found.push(p);
                }
                self.pending.clear();
            } else {
                self.pending.push(byte);
            }
        }
        found
    }

    fn flush(&mut self) -> Option<u8> {
        let p = parse_percent(&String::from_utf8_lossy(&self.pending));
        self.pending.clear();
        p
    }
}

fn parse_percent(segment: &str) -> Option<u8> {
    let s = segment.trim_start();
    let digits = s.find(|c: char| !c.is_ascii_digit())?;
    if digits == 0 || !s[digits..].starts_with('%') {
        return None;
    }
    s[..digits].parse::<u8>().ok().filter(|p| *p <= 100)
}

/// Child process that is killed and reaped on drop unless waited for.
struct ChildGuard {
    child: Child,
    reaped: bool,
}

impl ChildGuard {
    fn spawn(cmd: &mut Command) -> io::Result<Self> {
        Ok(Self {
            child: cmd.spawn()?,
            reaped: false,
        })
    }

    fn take_stdout(&mut self) -> io::Result<ChildStdout> {
        self.child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("7-Zip stdout not captured"))
    }

    fn wait(&mut self) -> io::Result<ExitStatus> {
        let status = self.child.wait()?;
        self.reaped = true;
        Ok(status)
    }

    fn kill(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
            self.reaped = true;
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        self.kill();
    }
}

pub struct SevenZipBackend {
    cancel: CancellationToken,
    configured: Option<PathBuf>,
    chunk_size: usize,
    compression_level: Option<i64>,
}

impl SevenZipBackend {
    pub fn new(settings: &Settings) -> Self {
        Self {
            cancel: CancellationToken::new(),
            configured: settings.sevenzip_path.clone(),
            chunk_size: settings.effective_chunk_size(),
            compression_level: settings.compression_level,
        }
    }

    fn binary(&self) -> Result<PathBuf> {
        find_7z(self.configured.as_deref())
    }

    /// `7z <verb> -tzip` with stdin closed, so a missing password fails
    /// instead of prompting. Other formats 7-Zip understands are refused.
    fn command(&self, bin: &Path, verb: &str, password: Option<&str>) -> Command {
        let mut cmd = Command::new(bin);
        cmd.arg(verb).arg("-tzip").stdin(Stdio::null());
        if let Some(pass) = password {
            cmd.arg(format!("-p{}", pass));
        }
        cmd
    }

    /// Stream one entry through `7z e -so` into the session.
    fn extract_entry(
        &self,
        bin: &Path,
        job: &ExtractJob<'_>,
        session: &mut ExtractSession<'_>,
        info: &ArchiveEntryInfo,
        dest: &Path,
    ) -> Result<Outcome<()>> {
        if info.size == 0 {
            return session.file(&info.path, dest, &mut io::empty(), 0, info.last_write_time);
        }

        let mut cmd = self.command(bin, "e", job.password);
        cmd.arg("-so") // Write to stdout
            .arg("-bd") // Disable progress indicator
            .arg("-y") // Yes to all
            .arg("-spd") // Disable wildcard matching
            .arg("-scsUTF-8") // Force UTF-8 charset for filenames
            .arg("--")
            .arg(job.archive)
            .arg(&info.path)
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = ChildGuard::spawn(&mut cmd).map_err(|e| ArchiveError::read(job.archive, format!("failed to spawn 7-Zip: {}", e)))?;
        let mut stdout = child.take_stdout().map_err(|e| ArchiveError::read(job.archive, e))?;

        let result = session.file_verified(&info.path, dest, &mut stdout, info.size, info.last_write_time, || {
            let status = child.wait().map_err(|e| ArchiveError::read(job.archive, e))?;
            if status.success() {
                Ok(())
            } else {
                Err(ArchiveError::read(
                    job.archive,
                    format!("7-Zip failed on '{}' ({})", info.path, status),
                ))
            }
        });
        drop(stdout);

        match result {
            // The stream hit EOF, so the process is done writing and can be reaped
            Err(e) if e.kind() == ErrorKind::EntryIntegrity => match child.wait() {
                Ok(status) if !status.success() => Err(ArchiveError::read(
                    job.archive,
                    format!("7-Zip failed on '{}' ({})", info.path, status),
                )),
                _ => Err(e),
            },
            other => other,
        }
    }
}

impl ArchiveBackend for SevenZipBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::SevenZip
    }

    fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn probe(&self, archive: &Path) -> bool {
        archive.is_file() && matches!(self.list(archive, None), Ok(entries) if !entries.is_empty())
    }

    fn list(&self, archive: &Path, password: Option<&str>) -> Result<Vec<ArchiveEntryInfo>> {
        if !archive.is_file() {
            return Err(ArchiveError::not_found(archive));
        }
        let bin = self.binary()?;

        let output = self
            .command(&bin, "l", password)
            .arg("-slt") // Technical listing format (key=value)
            .arg("-ba") // Bare output (no headers)
            .arg("-scsUTF-8") // Force UTF-8 charset for filenames
            .arg("--")
            .arg(archive)
            .output()
            .map_err(|e| ArchiveError::read(archive, format!("failed to run 7-Zip: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ArchiveError::read(archive, format!("7-Zip list failed: {}", stderr.trim())));
        }

        let entries = parse_7z_list(&output.stdout)?;
        debug!("Listed {} entries from {}", entries.len(), archive.display());
        Ok(entries)
    }

    fn unpack(&self, job: &ExtractJob<'_>, progress: Option<&ProgressCallback>) -> Result<Outcome<ExtractStats>> {
        job.require_source()?;
        let bin = self.binary()?;

        let listing = self.list(job.archive, job.password)?;
        let mut session = ExtractSession::begin(job, &listing, self.chunk_size, &self.cancel, progress)?;

        for info in &listing {
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

            if self.extract_entry(&bin, job, &mut session, info, &dest)?.is_cancelled() {
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
        if plan.items.is_empty() {
            return Ok(Outcome::Completed(Vec::new()));
        }
        let bin = self.binary()?;

        let mut list_file = tempfile::NamedTempFile::new()?;
        for item in &plan.items {
            writeln!(list_file, "{}", item.name.trim_end_matches('/'))?;
        }
        list_file.flush()?;

        let guard = PartialArchive::new(&plan.archive);

        let mut cmd = self.command(&bin, "a", None);
        cmd.current_dir(&plan.base)
            .arg("-bsp1") // Progress on stdout
            .arg("-bso0") // No other messages
            .arg("-bse0")
            .arg("-y")
            .arg("-spd")
            .arg("-scsUTF-8");
        if let Some(level) = self.compression_level {
            cmd.arg(format!("-mx={}", level));
        }
        if let Some(pass) = password {
            cmd.arg(format!("-p{}", pass)).arg("-mem=AES256");
        }
        cmd.arg(&plan.archive)
            .arg(format!("@{}", list_file.path().display()))
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = ChildGuard::spawn(&mut cmd)
            .map_err(|e| ArchiveError::write(&plan.archive, format!("failed to spawn 7-Zip: {}", e)))?;
        let stdout = child.take_stdout().map_err(|e| ArchiveError::write(&plan.archive, e))?;

        let (tx, rx) = mpsc::channel();
        let reader = thread::spawn(move || forward_progress(stdout, tx));

        let mut tracker = ProgressTracker::new(100);
        let mut reported = 0u8;
        loop {
            if self.cancel.is_cancelled() {
                info!("Cancelling 7-Zip while writing {}", plan.archive.display());
                child.kill();
                let _ = reader.join();
                return Ok(Outcome::Cancelled);
            }

            match rx.recv_timeout(POLL_INTERVAL) {
                Ok(percent) if percent > reported => {
                    tracker.report((percent - reported) as u64, &plan.archive, progress);
                    reported = percent;
                }
                Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let status = child.wait().map_err(|e| ArchiveError::write(&plan.archive, e))?;
        let _ = reader.join();
        if !status.success() {
            return Err(ArchiveError::write(&plan.archive, format!("7-Zip exited with {}", status)));
        }

        tracker.complete(progress);
        guard.commit();
        debug!("7-Zip wrote {}", plan.archive.display());
        Ok(Outcome::Completed(plan.entries()))
    }
}

/// Reader thread: forward each percentage 7-Zip prints until stdout closes.
fn forward_progress(mut stdout: ChildStdout, tx: mpsc::Sender<u8>) {
    let mut scanner = ProgressScanner::default();
    let mut buf = [0u8; 512];
    loop {
        match stdout.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for percent in scanner.feed(&buf[..n]) {
                    if tx.send(percent).is_err() {
                        return;
                    }
                }
            }
        }
    }
    if let Some(percent) = scanner.flush() {
        let _ = tx.send(percent);
    }
}
