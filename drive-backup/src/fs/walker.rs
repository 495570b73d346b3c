//! Directory traversal that maps files to their paths inside an archive.
//!
//! Every entry is placed under the backed-up folder's own name, so walking
//! `/home/user/docs` yields `docs/a.txt`, `docs/notes/b.txt` and so on.

use std::path::{Path, PathBuf};

use tracing::warn;
use walkdir::{DirEntry, WalkDir};

use crate::fs::filter::{should_exclude, ExclusionSet};
use crate::utils::{BackupError, Result};

/// A file scheduled for archiving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedEntry {
    /// Absolute path of the file on disk
    pub source: PathBuf,

    /// Path inside the archive, `/`-separated and prefixed with the root folder name
    pub archive_path: String,
}

/// A validated backup target, ready to be walked.
#[derive(Debug, Clone)]
pub struct PreparedFolder {
    root: PathBuf,
    root_name: String,
    exclusions: ExclusionSet,
}

/// Validate `folder` and bind it to the exclusion rules.
///
/// The folder is canonicalized, so its identity is its absolute path and the
/// archive prefix is its real name even for inputs like `.` or `docs/`.
pub fn prepare(folder: &Path, exclusions: &ExclusionSet) -> Result<PreparedFolder> {
    let root = match std::fs::canonicalize(folder) {
        Ok(root) => root,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(BackupError::FolderNotFound(folder.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };

    if !root.is_dir() {
        return Err(BackupError::NotADirectory(folder.to_path_buf()));
    }

    // Only the filesystem root has no name; archive it as "root".
    let root_name = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "root".to_string());

    Ok(PreparedFolder {
        root,
        root_name,
        exclusions: exclusions.clone(),
    })
}

impl PreparedFolder {
    /// Absolute path of the folder being backed up
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Base name used as the archive prefix and in the archive file name
    pub fn root_name(&self) -> &str {
        &self.root_name
    }

    /// Lazily walk the folder.
    ///
    /// Each call starts a fresh walk, so the sequence reflects the disk at the
    /// time it is consumed. Entries come out sorted by file name within each
    /// directory. Excluded directories are pruned with their whole subtree.
    pub fn entries(&self) -> impl Iterator<Item = PreparedEntry> + '_ {
        WalkDir::new(&self.root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(move |entry| !self.is_excluded_dir(entry))
            .filter_map(move |entry| match entry {
                Ok(entry) => self.to_prepared(&entry),
                Err(e) => {
                    warn!("Skipping unreadable path under {}: {}", self.root.display(), e);
                    None
                }
            })
    }

    /// Directories are checked by their path starting at the root folder's
    /// name, so the target's own ancestors never cause an exclusion.
    fn is_excluded_dir(&self, entry: &DirEntry) -> bool {
        if !entry.file_type().is_dir() {
            return false;
        }

        let relative = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
        should_exclude(&Path::new(&self.root_name).join(relative), &self.exclusions)
    }

    /// Map a walked entry to its archive path.
    /// Symlinks are resolved; links to directories and broken links are skipped.
    fn to_prepared(&self, entry: &DirEntry) -> Option<PreparedEntry> {
        let file_type = entry.file_type();

        if file_type.is_dir() {
            return None;
        }

        if file_type.is_symlink() {
            match std::fs::metadata(entry.path()) {
                Ok(resolved) if resolved.is_file() => {}
                Ok(_) => return None,
                Err(_) => {
                    warn!("Skipping broken symlink: {}", entry.path().display());
                    return None;
                }
            }
        }

        let relative = entry.path().strip_prefix(&self.root).ok()?;
        let mut archive_path = self.root_name.clone();
        for component in relative.components() {
            archive_path.push('/');
            archive_path.push_str(&component.as_os_str().to_string_lossy());
        }

        Some(PreparedEntry {
            source: entry.path().to_path_buf(),
            archive_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn archive_paths(folder: &PreparedFolder) -> Vec<String> {
        folder.entries().map(|e| e.archive_path).collect()
    }

    #[test]
    fn test_walk_empty_directory() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let folder = prepare(temp_dir.path(), &ExclusionSet::default())?;
        assert_eq!(folder.entries().count(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let docs = temp_dir.path().join("docs");
        fs::create_dir_all(docs.join("nested/deeper"))?;
        fs::write(docs.join("a.txt"), b"a")?;
        fs::write(docs.join("nested/b.txt"), b"b")?;
        fs::write(docs.join("nested/deeper/c.txt"), b"c")?;

        let folder = prepare(&docs, &ExclusionSet::default())?;

        assert_eq!(folder.root_name(), "docs");
        assert_eq!(
            archive_paths(&folder),
            vec!["docs/a.txt", "docs/nested/b.txt", "docs/nested/deeper/c.txt"]
        );

        let first = folder.entries().next().unwrap();
        assert_eq!(first.source, docs.canonicalize()?.join("a.txt"));
        Ok(())
    }

    #[test]
    fn test_excluded_subtree_is_pruned() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let docs = temp_dir.path().join("docs");
        fs::create_dir_all(docs.join("skip/inner"))?;
        fs::create_dir_all(docs.join("keep/skip"))?;
        fs::write(docs.join("a.txt"), b"a")?;
        fs::write(docs.join("skip/b.txt"), b"b")?;
        fs::write(docs.join("skip/inner/c.txt"), b"c")?;
        fs::write(docs.join("keep/d.txt"), b"d")?;
        fs::write(docs.join("keep/skip/e.txt"), b"e")?;

        let exclusions: ExclusionSet = ["skip"].into_iter().collect();
        let folder = prepare(&docs, &exclusions)?;

        assert_eq!(archive_paths(&folder), vec!["docs/a.txt", "docs/keep/d.txt"]);
        for entry in folder.entries() {
            assert!(!entry.source.components().any(|c| c.as_os_str() == "skip"));
        }
        Ok(())
    }

    #[test]
    fn test_file_named_like_excluded_folder_is_kept() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("cache"), b"not a folder")?;

        let exclusions: ExclusionSet = ["cache"].into_iter().collect();
        let folder = prepare(temp_dir.path(), &exclusions)?;

        assert_eq!(folder.entries().count(), 1);
        Ok(())
    }

    #[test]
    fn test_excluded_ancestor_does_not_exclude_target() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let target = temp_dir.path().join("skip/docs");
        fs::create_dir_all(&target)?;
        fs::write(target.join("a.txt"), b"a")?;

        let exclusions: ExclusionSet = ["skip"].into_iter().collect();
        let folder = prepare(&target, &exclusions)?;

        assert_eq!(archive_paths(&folder), vec!["docs/a.txt"]);
        Ok(())
    }

    #[test]
    fn test_entries_restart_from_disk() -> Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("one.txt"), b"1")?;

        let folder = prepare(temp_dir.path(), &ExclusionSet::default())?;
        assert_eq!(folder.entries().count(), 1);

        fs::write(temp_dir.path().join("two.txt"), b"2")?;
        assert_eq!(folder.entries().count(), 2);
        Ok(())
    }

    #[test]
    fn test_prepare_missing_folder() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("missing");

        let result = prepare(&missing, &ExclusionSet::default());
        assert!(matches!(result, Err(BackupError::FolderNotFound(_))));
    }

    #[test]
    fn test_prepare_rejects_file() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("file.txt");
        fs::write(&file, b"x").unwrap();

        let result = prepare(&file, &ExclusionSet::default());
        assert!(matches!(result, Err(BackupError::NotADirectory(_))));
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinks() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let outside = temp_dir.path().join("outside");
        let docs = temp_dir.path().join("docs");
        fs::create_dir_all(&outside)?;
        fs::create_dir_all(&docs)?;
        fs::write(outside.join("target.txt"), b"target")?;

        std::os::unix::fs::symlink(outside.join("target.txt"), docs.join("file_link"))?;
        std::os::unix::fs::symlink(&outside, docs.join("dir_link"))?;
        std::os::unix::fs::symlink(outside.join("gone.txt"), docs.join("broken_link"))?;

        let folder = prepare(&docs, &ExclusionSet::default())?;
        assert_eq!(archive_paths(&folder), vec!["docs/file_link"]);
        Ok(())
    }
}
