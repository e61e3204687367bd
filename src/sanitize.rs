//! Path handling for archive entries.
//!
//! Archive entry names come from untrusted input. Before anything is written,
//! each name is resolved against the normalized output root and rejected if
//! the result would land outside it.

use std::path::{Component, Path, PathBuf};

use crate::error::Result;

/// Resolve an output directory to an absolute, lexically normalized path.
///
/// An empty `output_dir` means "next to the archive" (its parent directory,
/// or the current directory for a bare file name).
pub fn resolve_output_dir(output_dir: &Path, archive: &Path) -> Result<PathBuf> {
    let dir = if output_dir.as_os_str().is_empty() {
        match archive.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    } else {
        output_dir.to_path_buf()
    };

    Ok(lexical_normalize(&std::path::absolute(dir)?))
}

/// Collapse `.` and `..` without touching the filesystem.
pub(crate) fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Map an archive entry name to its destination under `root`.
///
/// Returns `None` for names that are absolute, carry a drive prefix, resolve
/// to the root itself, or climb out of `root` through `..`.
pub fn entry_destination(root: &Path, entry_name: &str) -> Option<PathBuf> {
    let unified = entry_name.replace('\\', "/");
    if unified.starts_with('/') {
        return None;
    }

    let mut relative = PathBuf::new();
    let mut depth = 0usize;
    for part in unified.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if depth == 0 {
                    return None;
                }
                relative.pop();
                depth -= 1;
            }
            _ => {
                // `C:` style prefixes only parse as such on Windows
                if part.contains(':') && cfg!(windows) {
                    return None;
                }
                relative.push(part);
                depth += 1;
            }
        }
    }

    if depth == 0 {
        return None;
    }

    let destination = root.join(relative);
    destination.starts_with(root).then_some(destination)
}

/// Whether an entry name denotes a directory marker.
pub fn is_directory_name(name: &str) -> bool {
    name.ends_with('/') || name.ends_with('\\')
}

/// Normalize a path for case-insensitive comparison.
///
/// Lowercases, turns `\` into `/` and trims leading/trailing slashes.
pub fn normalize_path(path: &str) -> String {
    path.to_lowercase()
        .replace('\\', "/")
        .trim_matches('/')
        .to_string()
}

/// Case-insensitive exact-name filter for subset extraction.
///
/// Requested names ending in a separator are directory filters and are
/// ignored. A filter built from nothing (or only directory names) matches
/// every entry.
#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    names: Option<std::collections::HashSet<String>>,
}

impl EntryFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new<S: AsRef<str>>(requested: &[S]) -> Self {
        let names: std::collections::HashSet<String> = requested
            .iter()
            .map(AsRef::as_ref)
            .filter(|name| !is_directory_name(name))
            .map(normalize_path)
            .filter(|name| !name.is_empty())
            .collect();

        Self {
            names: (!names.is_empty()).then_some(names),
        }
    }

    pub fn is_all(&self) -> bool {
        self.names.is_none()
    }

    pub fn matches(&self, entry_name: &str) -> bool {
        match &self.names {
            None => true,
            Some(names) => names.contains(&normalize_path(entry_name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("Data\\Textures\\test.dds"), "data/textures/test.dds");
        assert_eq!(normalize_path("/foo/bar/"), "foo/bar");
    }

    #[test]
    fn test_entry_destination_rejects_traversal() {
        let root = Path::new("/tmp/out");
        assert_eq!(entry_destination(root, "../../evil.txt"), None);
        assert_eq!(entry_destination(root, "a/../../evil.txt"), None);
        assert_eq!(entry_destination(root, "/etc/passwd"), None);
        assert_eq!(entry_destination(root, "\\abs\\file"), None);
        assert_eq!(entry_destination(root, "./"), None);
    }

    #[test]
    fn test_entry_destination_accepts_nested() {
        let root = Path::new("/tmp/out");
        assert_eq!(
            entry_destination(root, "sub/./b.txt"),
            Some(PathBuf::from("/tmp/out/sub/b.txt"))
        );
        assert_eq!(
            entry_destination(root, "sub\\x\\..\\c.txt"),
            Some(PathBuf::from("/tmp/out/sub/c.txt"))
        );
        assert_eq!(
            entry_destination(root, "sub/empty/"),
            Some(PathBuf::from("/tmp/out/sub/empty"))
        );
    }

    #[test]
    fn test_resolve_output_dir_defaults_to_archive_dir() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.zip");
        let resolved = resolve_output_dir(Path::new(""), &archive).unwrap();
        assert_eq!(resolved, lexical_normalize(dir.path()));

        let nested = resolve_output_dir(&dir.path().join("x/../y"), &archive).unwrap();
        assert_eq!(nested, lexical_normalize(&dir.path().join("y")));
    }

    #[test]
    fn test_entry_filter() {
        let filter = EntryFilter::new(&["A.TXT", "sub\\B.txt", "sub/"]);
        assert!(filter.matches("a.txt"));
        assert!(filter.matches("Sub/b.TXT"));
        assert!(!filter.matches("sub/"));
        assert!(!filter.matches("c.txt"));

        assert!(EntryFilter::new::<&str>(&[]).is_all());
        assert!(EntryFilter::new(&["only/dirs/"]).matches("anything"));
    }
}
