use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::error::{RenderError, RenderResult};

/// Keeps media lookups inside the media root: relative references are joined
/// onto the root, canonicalized, and rejected if they land outside it.
#[derive(Debug, Clone)]
pub struct MediaSandbox {
    root: PathBuf,
}

impl MediaSandbox {
    /// Canonicalizes the media root. The directory must exist.
    pub fn new<P: AsRef<Path>>(root: P) -> RenderResult<Self> {
        let root = fs::canonicalize(root.as_ref())
            .map_err(|error| RenderError::io(root.as_ref(), error))?;
        Ok(Self { root })
    }

    /// Resolves `relative` under the root to an existing regular file.
    /// Returns `None` when the file does not exist, is not a file, or escapes
    /// the root through `..` or a symlink.
    pub fn resolve_file<P: AsRef<Path>>(&self, relative: P) -> Option<PathBuf> {
        let relative = relative.as_ref();
        if relative.as_os_str().is_empty() || relative.is_absolute() {
            return None;
        }
        if relative
            .components()
            .any(|component| matches!(component, Component::Prefix(_) | Component::RootDir))
        {
            return None;
        }

        let canonical = fs::canonicalize(self.root.join(relative)).ok()?;
        if !canonical.starts_with(&self.root) {
            tracing::warn!(
                path = %canonical.display(),
                root = %self.root.display(),
                "blocked media reference escaping the media root"
            );
            return None;
        }
        canonical.is_file().then_some(canonical)
    }

    /// Returns the canonicalized root path.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    #[test]
    fn sandbox_valid_child_path() {
        let dir = tempdir().unwrap();
        let sandbox = MediaSandbox::new(dir.path()).unwrap();

        fs::create_dir(dir.path().join("co1")).unwrap();
        let child_path = dir.path().join("co1/logo.png");
        File::create(&child_path).unwrap();

        let resolved = sandbox.resolve_file("co1/logo.png").unwrap();
        assert_eq!(resolved, fs::canonicalize(&child_path).unwrap());
    }

    #[test]
    fn sandbox_rejects_path_traversal() {
        let parent_dir = tempdir().unwrap();
        let root_dir = parent_dir.path().join("root");
        fs::create_dir(&root_dir).unwrap();

        let outside_file = parent_dir.path().join("outside.txt");
        File::create(&outside_file).unwrap();

        let sandbox = MediaSandbox::new(&root_dir).unwrap();
        assert!(sandbox.resolve_file("../outside.txt").is_none());
    }

    #[test]
    fn sandbox_rejects_absolute_paths() {
        let parent_dir = tempdir().unwrap();
        let root_dir = parent_dir.path().join("root");
        fs::create_dir(&root_dir).unwrap();

        let outside_file = parent_dir.path().join("outside.txt");
        File::create(&outside_file).unwrap();

        let sandbox = MediaSandbox::new(&root_dir).unwrap();
        let absolute_outside = fs::canonicalize(&outside_file).unwrap();
        assert!(sandbox.resolve_file(absolute_outside).is_none());
    }

    #[test]
    fn sandbox_rejects_directories() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        let sandbox = MediaSandbox::new(dir.path()).unwrap();
        assert!(sandbox.resolve_file("nested").is_none());
    }

    #[cfg(unix)]
    #[test]
    fn sandbox_rejects_symlink_escape() {
        let parent_dir = tempdir().unwrap();
        let root_dir = parent_dir.path().join("root");
        fs::create_dir(&root_dir).unwrap();

        let outside_file = parent_dir.path().join("outside.txt");
        File::create(&outside_file).unwrap();

        let sandbox = MediaSandbox::new(&root_dir).unwrap();
        std::os::unix::fs::symlink(&outside_file, root_dir.join("link_to_outside")).unwrap();

        assert!(sandbox.resolve_file("link_to_outside").is_none());
    }

    #[test]
    fn missing_root_is_an_io_error() {
        let dir = tempdir().unwrap();
        let err = MediaSandbox::new(dir.path().join("missing")).unwrap_err();
        assert_eq!(err.code(), "IO_ERROR");
    }
}
