use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{PublishError, Result};

/// Directory names that are never published by default.
pub const DEFAULT_EXCLUDED_DIRS: &[&str] = &["admin", "grappelli"];

/// Directory-name exclusion filter applied while walking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExcludeFilter {
    dir_names: BTreeSet<String>,
}

impl Default for ExcludeFilter {
    fn default() -> Self {
        Self::new(DEFAULT_EXCLUDED_DIRS.iter().copied())
    }
}

impl ExcludeFilter {
    pub fn new<S: Into<String>>(dir_names: impl IntoIterator<Item = S>) -> Self {
        Self {
            dir_names: dir_names.into_iter().map(Into::into).collect(),
        }
    }

    /// A filter that excludes nothing.
    pub fn none() -> Self {
        Self {
            dir_names: BTreeSet::new(),
        }
    }

    pub fn with(mut self, dir_name: impl Into<String>) -> Self {
        self.dir_names.insert(dir_name.into());
        self
    }

    pub fn is_excluded(&self, dir_name: &str) -> bool {
        self.dir_names.contains(dir_name)
    }
}

/// Snapshot of the files and directories under a local site root.
#[derive(Debug, Clone, Default)]
pub struct LocalIndex {
    root: PathBuf,
    files: BTreeSet<PathBuf>,
    dirs: BTreeSet<PathBuf>,
}

impl LocalIndex {
    /// Walk `root` once, pruning excluded directories.
    ///
    /// Symlinks are followed, so a linked file is indexed (and later hashed)
    /// by its resolved content.
    pub fn scan(root: &Path, filter: &ExcludeFilter) -> Result<Self> {
        if !root.is_dir() {
            return Err(PublishError::Io(format!(
                "site directory does not exist: {}",
                root.display()
            )));
        }

        let mut files = BTreeSet::new();
        let mut dirs = BTreeSet::new();

        let walker = WalkDir::new(root)
            .follow_links(true)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| {
                !(entry.file_type().is_dir()
                    && entry
                        .file_name()
                        .to_str()
                        .is_some_and(|name| filter.is_excluded(name)))
            });

        for entry in walker {
            let entry = entry.map_err(|e| {
                PublishError::Io(format!("failed to walk {}: {}", root.display(), e))
            })?;
            if entry.file_type().is_dir() {
                dirs.insert(entry.path().to_path_buf());
            } else if entry.file_type().is_file() {
                files.insert(entry.path().to_path_buf());
            } else {
                debug!("Skipping non-regular entry {}", entry.path().display());
            }
        }

        info!(
            "Indexed {} local files in {} directories under {}",
            files.len(),
            dirs.len(),
            root.display()
        );

        Ok(Self {
            root: root.to_path_buf(),
            files,
            dirs,
        })
    }

    /// Build an index from already-known paths.
    pub fn from_parts(
        root: impl Into<PathBuf>,
        files: impl IntoIterator<Item = PathBuf>,
        dirs: impl IntoIterator<Item = PathBuf>,
    ) -> Self {
        Self {
            root: root.into(),
            files: files.into_iter().collect(),
            dirs: dirs.into_iter().collect(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &BTreeSet<PathBuf> {
        &self.files
    }

    pub fn dirs(&self) -> &BTreeSet<PathBuf> {
        &self.dirs
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, data: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    #[test]
    fn test_scan_files_and_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write(root, "index.html", "home");
        write(root, "blog/post-1/index.html", "post");
        write(root, "static/css/site.css", "body{}");

        let index = LocalIndex::scan(root, &ExcludeFilter::default()).unwrap();

        assert_eq!(index.files().len(), 3);
        assert!(index.files().contains(&root.join("blog/post-1/index.html")));
        assert!(index.dirs().contains(&root.join("blog")));
        assert!(index.dirs().contains(&root.join("static/css")));
        assert!(!index.dirs().contains(&root.to_path_buf()));
    }

    #[test]
    fn test_excluded_dirs_are_pruned() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        write(root, "static/admin/css/base.css", "admin");
        write(root, "static/grappelli/x.js", "grp");
        write(root, "static/site.js", "site");

        let index = LocalIndex::scan(root, &ExcludeFilter::default()).unwrap();
        assert_eq!(
            index.files().iter().collect::<Vec<_>>(),
            vec![&root.join("static/site.js")]
        );
        assert!(!index.dirs().contains(&root.join("static/admin")));

        let everything = LocalIndex::scan(root, &ExcludeFilter::none()).unwrap();
        assert_eq!(everything.files().len(), 3);

        let custom = LocalIndex::scan(root, &ExcludeFilter::none().with("static")).unwrap();
        assert!(custom.is_empty());
    }

    #[test]
    fn test_empty_tree() {
        let temp_dir = TempDir::new().unwrap();
        let index = LocalIndex::scan(temp_dir.path(), &ExcludeFilter::default()).unwrap();
        assert!(index.is_empty());
        assert!(index.dirs().is_empty());
    }

    #[test]
    fn test_missing_root() {
        let result = LocalIndex::scan(Path::new("/nonexistent/sitepub/root"), &ExcludeFilter::default());
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_file_is_regular() {
        let temp_dir = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let target = outside.path().join("shared.css");
        std::fs::write(&target, "shared").unwrap();
        std::os::unix::fs::symlink(&target, temp_dir.path().join("linked.css")).unwrap();

        let index = LocalIndex::scan(temp_dir.path(), &ExcludeFilter::default()).unwrap();
        assert!(index.files().contains(&temp_dir.path().join("linked.css")));
    }
}
