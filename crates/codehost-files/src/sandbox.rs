//! Prefix-based authorization of path arguments.
//!
//! Paths are normalised lexically and never touch the filesystem. The
//! normalised path is what gets checked and what callers operate on, so
//! `..` never climbs back out through a symlink. A symlink inside a
//! permitted root is otherwise trusted as-is.

use std::path::{Component, Path, PathBuf};

use tracing::warn;

use crate::error::{FileStoreError, Result};
use crate::layout::{Layout, Root};

/// Roots whose contents can be listed, read, sized and zipped.
pub const READABLE: &[Root] = &[Root::Code, Root::ProgramData, Root::Recycle, Root::Library];

/// Roots that accept new or overwritten content.
pub const WRITABLE: &[Root] = &[Root::Code, Root::ProgramData];

/// Roots content can be copied or moved out of.
pub const MOVABLE_SOURCES: &[Root] = &[Root::Code, Root::ProgramData, Root::Recycle];

/// Validates path arguments against a [`Layout`].
#[derive(Debug, Clone, Copy)]
pub struct PathSandbox<'a> {
    layout: &'a Layout,
}

impl<'a> PathSandbox<'a> {
    pub fn new(layout: &'a Layout) -> Self {
        Self { layout }
    }

    /// Check that `path` lies under one of `allowed`.
    ///
    /// Returns the normalised path. Callers must do their I/O on it rather
    /// than on `path`: the OS resolves `link/..` through the symlink, which
    /// can land outside the root that was checked.
    pub fn validate(&self, path: &Path, allowed: &[Root]) -> Result<PathBuf> {
        self.locate(path, allowed).map(|(_, normalized)| normalized)
    }

    /// Like [`validate`](Self::validate), but also rejects the root directory itself.
    ///
    /// Used by operations that would remove or relocate the target.
    pub fn validate_entry(&self, path: &Path, allowed: &[Root]) -> Result<PathBuf> {
        let (root, normalized) = self.locate(path, allowed)?;
        if normalized == self.layout.dir(root) {
            warn!("Rejected operation on {} root itself", root);
            return Err(FileStoreError::InvalidPath(format!(
                "cannot operate on the {} root itself",
                root
            )));
        }
        Ok(normalized)
    }

    fn locate(&self, path: &Path, allowed: &[Root]) -> Result<(Root, PathBuf)> {
        let Some(normalized) = normalize(path) else {
            warn!("Rejected non-absolute path: {:?}", path);
            return Err(FileStoreError::AccessDenied(path.to_path_buf()));
        };

        let root = allowed
            .iter()
            .copied()
            .find(|root| normalized.starts_with(self.layout.dir(*root)))
            .ok_or_else(|| {
                warn!("Rejected path outside {:?}: {:?}", allowed, path);
                FileStoreError::AccessDenied(path.to_path_buf())
            })?;
        Ok((root, normalized))
    }
}

/// Lexically normalise an absolute path: drop `.`, let `..` pop a component.
///
/// Returns `None` for relative paths or paths with a Windows prefix.
pub fn normalize(path: &Path) -> Option<PathBuf> {
    let mut components = path.components();
    if components.next() != Some(Component::RootDir) {
        return None;
    }

    let mut result = PathBuf::from("/");
    for component in components {
        match component {
            Component::Normal(name) => result.push(name),
            Component::ParentDir => {
                result.pop();
            }
            Component::CurDir => continue,
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> Layout {
        Layout::new("/srv")
    }

    #[test]
    fn test_normalize_resolves_dot_segments() {
        assert_eq!(
            normalize(Path::new("/srv/user_data/code/./a/../b")),
            Some(PathBuf::from("/srv/user_data/code/b"))
        );
        assert_eq!(normalize(Path::new("/../..")), Some(PathBuf::from("/")));
        assert_eq!(normalize(Path::new("relative/path")), None);
    }

    #[test]
    fn test_validate_accepts_descendants() {
        let layout = layout();
        let sandbox = PathSandbox::new(&layout);
        let (root, path) = sandbox
            .locate(Path::new("/srv/user_data/code/app/main.js"), READABLE)
            .unwrap();
        assert_eq!(root, Root::Code);
        assert_eq!(path, PathBuf::from("/srv/user_data/code/app/main.js"));

        let (root, _) = sandbox
            .locate(Path::new("/srv/program_data/out.txt"), WRITABLE)
            .unwrap();
        assert_eq!(root, Root::ProgramData);
    }

    #[test]
    fn test_validate_accepts_root_with_trailing_slash() {
        let layout = layout();
        let sandbox = PathSandbox::new(&layout);
        assert!(sandbox.validate(Path::new("/srv/user_data/code/"), READABLE).is_ok());
    }

    #[test]
    fn test_validate_rejects_sibling_prefix() {
        let layout = layout();
        let sandbox = PathSandbox::new(&layout);
        let err = sandbox
            .validate(Path::new("/srv/user_data/codex/main.js"), READABLE)
            .unwrap_err();
        assert!(matches!(err, FileStoreError::AccessDenied(_)));
    }

    #[test]
    fn test_validate_rejects_parent_escape() {
        let layout = layout();
        let sandbox = PathSandbox::new(&layout);
        let err = sandbox
            .validate(Path::new("/srv/user_data/code/../db/system_data.db"), READABLE)
            .unwrap_err();
        assert!(matches!(err, FileStoreError::AccessDenied(_)));
    }

    #[test]
    fn test_validate_returns_normalized_path() {
        let layout = layout();
        let sandbox = PathSandbox::new(&layout);
        let path = sandbox
            .validate(Path::new("/srv/program_data/link/../system_data.db"), READABLE)
            .unwrap();
        assert_eq!(path, PathBuf::from("/srv/program_data/system_data.db"));
    }

    #[test]
    fn test_validate_rejects_relative_paths() {
        let layout = layout();
        let sandbox = PathSandbox::new(&layout);
        assert!(sandbox.validate(Path::new("user_data/code/a.js"), READABLE).is_err());
    }

    #[test]
    fn test_recycle_is_never_writable() {
        let layout = layout();
        let sandbox = PathSandbox::new(&layout);
        let recycled = Path::new("/srv/user_data/recycle/a_2024_01_01_00_00_00.js");
        assert!(sandbox.validate(recycled, MOVABLE_SOURCES).is_ok());
        assert!(sandbox.validate(recycled, WRITABLE).is_err());
    }

    #[test]
    fn test_database_is_not_exposed() {
        let layout = layout();
        let sandbox = PathSandbox::new(&layout);
        let db = Path::new("/srv/user_data/db/system_data.db");
        for allowed in [READABLE, WRITABLE, MOVABLE_SOURCES] {
            assert!(sandbox.validate(db, allowed).is_err());
        }
    }

    #[test]
    fn test_validate_entry_rejects_root_itself() {
        let layout = layout();
        let sandbox = PathSandbox::new(&layout);
        let err = sandbox
            .validate_entry(Path::new("/srv/user_data/code/"), &[Root::Code])
            .unwrap_err();
        assert!(matches!(err, FileStoreError::InvalidPath(_)));

        let entry = sandbox
            .validate_entry(Path::new("/srv/user_data/code/a.js"), &[Root::Code])
            .unwrap();
        assert_eq!(entry, PathBuf::from("/srv/user_data/code/a.js"));
    }
}
