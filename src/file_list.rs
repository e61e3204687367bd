//! Recursive file enumeration for archive creation.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{ArchiveError, Result};

/// One item found under a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedItem {
    pub path: PathBuf,
    /// File length; 0 for empty directory markers
    pub size: u64,
    /// Directory with no files and no subdirectories
    pub is_empty_dir: bool,
}

/// Ordered file list plus the byte total that drives creation progress.
#[derive(Debug, Clone, Default)]
pub struct FileList {
    pub items: Vec<ListedItem>,
    pub total_bytes: u64,
}

impl FileList {
    /// Enumerate `root`.
    ///
    /// A file root yields just that file. A directory root yields, per
    /// directory, its files first, then an empty-directory marker when the
    /// directory has neither files nor subdirectories, then each subdirectory
    /// depth-first. Sibling order is whatever the filesystem returns.
    ///
    /// Symlinks are followed. Broken links are skipped, and a directory
    /// reached a second time through links is walked only once.
    pub fn build(root: &Path) -> Result<Self> {
        let mut list = Self::default();
        list.add(root)?;
        Ok(list)
    }

    /// Append `path` (file or directory) to the list.
    pub fn add(&mut self, path: &Path) -> Result<()> {
        let meta = fs::metadata(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ArchiveError::not_found(path),
            _ => ArchiveError::Io(e),
        })?;

        if meta.is_file() {
            self.push_file(path.to_path_buf(), meta.len());
        } else {
            self.walk(path, &mut HashSet::new())?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn push_file(&mut self, path: PathBuf, size: u64) {
        self.total_bytes += size;
        self.items.push(ListedItem {
            path,
            size,
            is_empty_dir: false,
        });
    }

    fn walk(&mut self, dir: &Path, visited: &mut HashSet<PathBuf>) -> Result<()> {
        if let Ok(real) = fs::canonicalize(dir) {
            if !visited.insert(real) {
                warn!("Skipping {}: directory already listed", dir.display());
                return Ok(());
            }
        }

        let mut subdirs = Vec::new();
        let mut has_files = false;

        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let meta = match fs::metadata(&path) {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("Skipping {}: {}", path.display(), e);
                    continue;
                }
            };
            if meta.is_dir() {
                subdirs.push(path);
            } else {
                self.push_file(path, meta.len());
                has_files = true;
            }
        }

        if !has_files && subdirs.is_empty() {
            debug!("Empty directory: {}", dir.display());
            self.items.push(ListedItem {
                path: dir.to_path_buf(),
                size: 0,
                is_empty_dir: true,
            });
        }

        for sub in subdirs {
            self.walk(&sub, visited)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    #[test]
    fn test_single_file_root() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("one.bin");
        fs::write(&file, [0u8; 42]).unwrap();

        let list = FileList::build(&file).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list.items[0].path, file);
        assert_eq!(list.total_bytes, 42);
    }

    #[test]
    fn test_files_before_subdirectories() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("x/deeper")).unwrap();
        fs::create_dir_all(dir.path().join("empty")).unwrap();
        fs::write(dir.path().join("top.txt"), b"abc").unwrap();
        fs::write(dir.path().join("x/y.bin"), [1u8; 100]).unwrap();

        let list = FileList::build(dir.path()).unwrap();
        assert_eq!(list.total_bytes, 103);
        assert_eq!(list.items[0].path, dir.path().join("top.txt"));

        let markers: Vec<_> = list.items.iter().filter(|i| i.is_empty_dir).map(|i| i.path.clone()).collect();
        assert_eq!(markers.len(), 2);
        assert!(markers.contains(&dir.path().join("empty")));
        assert!(markers.contains(&dir.path().join("x/deeper")));

        // x has a file, so it gets no marker of its own
        assert!(!markers.contains(&dir.path().join("x")));
    }

    #[test]
    fn test_missing_root() {
        let dir = tempdir().unwrap();
        let err = FileList::build(&dir.path().join("missing")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[test]
    fn test_directory_symlink_is_followed() {
        use std::os::unix::fs::symlink;

        let dir = tempdir().unwrap();
        let target = dir.path().join("target");
        let root = dir.path().join("root");
        fs::create_dir_all(&target).unwrap();
        fs::create_dir_all(&root).unwrap();
        fs::write(target.join("inner.txt"), b"12345").unwrap();
        symlink(&target, root.join("link")).unwrap();
        symlink(root.join("gone"), root.join("dangling")).unwrap();

        let list = FileList::build(&root).unwrap();
        let paths: Vec<_> = list.items.iter().map(|i| i.path.clone()).collect();
        assert_eq!(paths, vec![root.join("link/inner.txt")]);
        assert_eq!(list.total_bytes, 5);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_cycle_terminates() {
        use std::os::unix::fs::symlink;

        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/a.txt"), b"a").unwrap();
        symlink(&root, root.join("sub/back")).unwrap();

        let list = FileList::build(&root).unwrap();
        let files: Vec<_> = list.items.iter().filter(|i| !i.is_empty_dir).map(|i| i.path.clone()).collect();
        assert_eq!(files, vec![root.join("sub/a.txt")]);
    }
}
