//! Fixed directory topology of a codehost data root.
//!
//! The on-disk names are shared with backup and restore tooling, so they must
//! not change:
//!
//! ```text
//! <data_root>/user_data/code/          user source files
//! <data_root>/user_data/node_modules/  installed libraries
//! <data_root>/user_data/recycle/       soft-deleted code
//! <data_root>/user_data/db/            persisted application state
//! <data_root>/program_data/            working directory of running tasks
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

/// One of the top-level directories managed by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Root {
    Code,
    ProgramData,
    Library,
    Recycle,
    Database,
}

impl Root {
    pub const ALL: [Root; 5] = [
        Root::Code,
        Root::ProgramData,
        Root::Library,
        Root::Recycle,
        Root::Database,
    ];

    fn relative(self) -> &'static str {
        match self {
            Root::Code => "user_data/code",
            Root::ProgramData => "program_data",
            Root::Library => "user_data/node_modules",
            Root::Recycle => "user_data/recycle",
            Root::Database => "user_data/db",
        }
    }
}

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Root::Code => "code",
            Root::ProgramData => "program_data",
            Root::Library => "library",
            Root::Recycle => "recycle",
            Root::Database => "database",
        };
        f.write_str(name)
    }
}

/// Database file kept under the database root.
const DATABASE_FILE: &str = "system_data.db";

/// Absolute locations of every root, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    data_root: PathBuf,
    code_dir: PathBuf,
    program_data_dir: PathBuf,
    library_dir: PathBuf,
    recycle_dir: PathBuf,
    database_dir: PathBuf,
}

impl Layout {
    /// Build the layout under `data_root`.
    ///
    /// `data_root` must be absolute; sandbox checks compare absolute paths only.
    pub fn new(data_root: impl Into<PathBuf>) -> Self {
        let data_root = data_root.into();
        Self {
            code_dir: data_root.join(Root::Code.relative()),
            program_data_dir: data_root.join(Root::ProgramData.relative()),
            library_dir: data_root.join(Root::Library.relative()),
            recycle_dir: data_root.join(Root::Recycle.relative()),
            database_dir: data_root.join(Root::Database.relative()),
            data_root,
        }
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn code_dir(&self) -> &Path {
        &self.code_dir
    }

    pub fn program_data_dir(&self) -> &Path {
        &self.program_data_dir
    }

    pub fn library_dir(&self) -> &Path {
        &self.library_dir
    }

    pub fn recycle_dir(&self) -> &Path {
        &self.recycle_dir
    }

    pub fn database_dir(&self) -> &Path {
        &self.database_dir
    }

    pub fn database_file(&self) -> PathBuf {
        self.database_dir.join(DATABASE_FILE)
    }

    /// Absolute directory of `root`.
    pub fn dir(&self, root: Root) -> &Path {
        match root {
            Root::Code => &self.code_dir,
            Root::ProgramData => &self.program_data_dir,
            Root::Library => &self.library_dir,
            Root::Recycle => &self.recycle_dir,
            Root::Database => &self.database_dir,
        }
    }

    /// Create every root directory that does not exist yet.
    pub async fn ensure(&self) -> std::io::Result<()> {
        for root in Root::ALL {
            let dir = self.dir(root);
            debug!("Ensuring {} directory at {}", root, dir.display());
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_matches_on_disk_contract() {
        let layout = Layout::new("/");
        assert_eq!(layout.code_dir(), Path::new("/user_data/code"));
        assert_eq!(layout.library_dir(), Path::new("/user_data/node_modules"));
        assert_eq!(layout.recycle_dir(), Path::new("/user_data/recycle"));
        assert_eq!(layout.database_dir(), Path::new("/user_data/db"));
        assert_eq!(layout.program_data_dir(), Path::new("/program_data"));
        assert_eq!(
            layout.database_file(),
            PathBuf::from("/user_data/db/system_data.db")
        );
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let layout = Layout::new(tmp.path());

        layout.ensure().await.unwrap();
        layout.ensure().await.unwrap();

        for root in Root::ALL {
            assert!(layout.dir(root).is_dir(), "{root} missing");
        }
    }
}
