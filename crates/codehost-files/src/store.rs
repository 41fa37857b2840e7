//! File operations over the managed roots.
//!
//! Every public method runs its sandbox check before touching the filesystem,
//! so a rejected call has no effect at all.

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::archive;
use crate::error::{FileStoreError, Result};
use crate::layout::{Layout, Root};
use crate::sandbox::{self, MOVABLE_SOURCES, PathSandbox, READABLE, WRITABLE};

/// Lazy byte stream over a file on disk.
pub type FileStream = ReaderStream<fs::File>;

/// Suffix appended to soft-deleted names.
const RECYCLE_TIMESTAMP_FORMAT: &str = "_%Y_%m_%d_%H_%M_%S";

/// A direct child of a listed directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    pub is_file: bool,
}

/// Sandboxed access to the user data tree.
#[derive(Debug, Clone)]
pub struct FileStore {
    layout: Arc<Layout>,
    /// Serialises picking a free recycle name with moving into it.
    recycle_lock: Arc<Mutex<()>>,
}

impl FileStore {
    pub fn new(layout: Arc<Layout>) -> Self {
        Self {
            layout,
            recycle_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn sandbox(&self) -> PathSandbox<'_> {
        PathSandbox::new(&self.layout)
    }

    /// List files and directories directly inside `path`.
    ///
    /// Symlinks and special files are skipped. Order follows the OS.
    pub async fn list_directory(&self, path: &Path) -> Result<Vec<DirEntry>> {
        let path = self.sandbox().validate(path, READABLE)?;
        debug!("Listing {}", path.display());

        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&path)
            .await
            .map_err(|e| FileStoreError::from_io(&path, e))?;

        while let Some(entry) = dir.next_entry().await? {
            let file_type = entry.file_type().await?;
            if !(file_type.is_file() || file_type.is_dir()) {
                continue;
            }
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_file: file_type.is_file(),
            });
        }

        Ok(entries)
    }

    /// Create `path` and any missing ancestors. Existing directories are fine.
    pub async fn create_directory(&self, path: &Path) -> Result<()> {
        let path = self.sandbox().validate(path, WRITABLE)?;
        info!("Creating directory: {}", path.display());
        fs::create_dir_all(&path).await?;
        Ok(())
    }

    /// Copy a file to `to`, or the contents of a directory into `to`.
    ///
    /// Existing entries are overwritten and symlinks are dereferenced.
    pub async fn copy(&self, from: &Path, to: &Path) -> Result<()> {
        let sandbox = self.sandbox();
        let from = sandbox.validate(from, MOVABLE_SOURCES)?;
        let to = sandbox.validate(to, WRITABLE)?;

        info!("Copying {} -> {}", from.display(), to.display());
        tokio::task::spawn_blocking(move || copy_blocking(&from, &to)).await?
    }

    /// Move `from` to `to`, replacing whatever is at `to`.
    pub async fn move_entry(&self, from: &Path, to: &Path) -> Result<()> {
        let sandbox = self.sandbox();
        let from = sandbox.validate_entry(from, MOVABLE_SOURCES)?;
        let to = sandbox.validate(to, WRITABLE)?;

        info!("Moving {} -> {}", from.display(), to.display());
        move_path(&from, &to).await
    }

    /// Move content staged outside the managed roots (e.g. an upload) into place.
    ///
    /// Only the destination is checked.
    pub async fn move_from_outside(&self, from: &Path, to: &Path) -> Result<()> {
        let to = self.sandbox().validate(to, WRITABLE)?;

        info!("Importing {} -> {}", from.display(), to.display());
        move_path(from, &to).await
    }

    /// Soft delete: move a code entry into the recycle bin under a timestamped name.
    ///
    /// Never replaces anything already in the bin: when the stamped name is
    /// taken, `_1`, `_2`, ... is appended after the stamp. Returns the entry's
    /// new location.
    pub async fn delete_code_data(&self, path: &Path) -> Result<PathBuf> {
        let path = self.sandbox().validate_entry(path, &[Root::Code])?;
        let name = path
            .file_name()
            .ok_or_else(|| FileStoreError::InvalidPath(path.display().to_string()))?
            .to_os_string();
        fs::symlink_metadata(&path)
            .await
            .map_err(|e| FileStoreError::from_io(&path, e))?;

        let recycle = self.layout.recycle_dir();
        let _guard = self.recycle_lock.lock().await;
        fs::create_dir_all(recycle).await?;

        let at = Local::now();
        let mut attempt = 0;
        let target = loop {
            let candidate = recycle.join(recycled_name(&name, at, attempt));
            match fs::symlink_metadata(&candidate).await {
                Err(e) if e.kind() == io::ErrorKind::NotFound => break candidate,
                Err(e) => return Err(e.into()),
                Ok(_) => attempt += 1,
            }
        };

        info!("Recycling {} -> {}", path.display(), target.display());
        move_path(&path, &target).await?;
        Ok(target)
    }

    /// Permanently delete a code entry.
    pub async fn delete_code_data_directly(&self, path: &Path) -> Result<()> {
        let path = self.sandbox().validate_entry(path, &[Root::Code])?;
        info!("Deleting code entry: {}", path.display());
        remove_path(&path).await
    }

    /// Permanently empty the recycle bin.
    pub async fn clean_recycle(&self) -> Result<()> {
        let recycle = self.layout.recycle_dir();
        info!("Emptying recycle bin at {}", recycle.display());

        match fs::remove_dir_all(recycle).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(recycle).await?;
        Ok(())
    }

    /// Permanently delete a program data entry.
    pub async fn delete_program_data(&self, path: &Path) -> Result<()> {
        let path = self.sandbox().validate_entry(path, &[Root::ProgramData])?;
        info!("Deleting program data: {}", path.display());
        remove_path(&path).await
    }

    /// Open a file for streaming.
    pub async fn read_file(&self, path: &Path) -> Result<FileStream> {
        let path = self.sandbox().validate(path, READABLE)?;

        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| FileStoreError::from_io(&path, e))?;
        if metadata.is_dir() {
            return Err(FileStoreError::InvalidPath(format!(
                "{} is a directory",
                path.display()
            )));
        }

        debug!("Streaming file: {}", path.display());
        let file = fs::File::open(&path)
            .await
            .map_err(|e| FileStoreError::from_io(&path, e))?;
        Ok(ReaderStream::new(file))
    }

    /// Size of a file in bytes, from metadata only.
    pub async fn file_size(&self, path: &Path) -> Result<u64> {
        let path = self.sandbox().validate(path, READABLE)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| FileStoreError::from_io(&path, e))?;
        Ok(metadata.len())
    }

    /// Zip a file or directory for download.
    ///
    /// The archive is finalised into an anonymous temp file and streamed from
    /// there, so large trees are never buffered in memory.
    pub async fn zip_data(&self, path: &Path) -> Result<FileStream> {
        let source = self.sandbox().validate(path, READABLE)?;

        debug!("Zipping {}", source.display());
        let file = tokio::task::spawn_blocking(move || archive::zip_to_tempfile(&source)).await??;
        Ok(ReaderStream::new(fs::File::from_std(file)))
    }

    /// Extract `zip_file` into `to`, then delete `zip_file`.
    ///
    /// The archive is removed whether or not extraction succeeded. A sandbox
    /// rejection of `to` leaves it in place.
    pub async fn unzip_data(&self, zip_file: &Path, to: &Path) -> Result<()> {
        let target = self.sandbox().validate(to, WRITABLE)?;

        info!("Extracting {} into {}", zip_file.display(), target.display());
        let source = zip_file.to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || archive::extract(&source, &target))
            .await
            .map_err(FileStoreError::from)
            .and_then(|result| result);

        let removed = fs::remove_file(zip_file).await;
        if let Err(ref e) = removed {
            warn!("Failed to remove archive {}: {}", zip_file.display(), e);
        }

        extracted?;
        removed.map_err(|e| FileStoreError::from_io(zip_file, e))
    }
}

/// Name under which `name` is stored in the recycle bin.
///
/// `main.js` deleted at 2024-03-05 14:07:09 becomes `main_2024_03_05_14_07_09.js`,
/// or `main_2024_03_05_14_07_09_2.js` for `attempt` 2. Non-UTF-8 names are
/// kept byte for byte.
pub fn recycled_name(name: &OsStr, at: DateTime<Local>, attempt: u32) -> OsString {
    let path = Path::new(name);
    let mut recycled = path.file_stem().map(OsStr::to_os_string).unwrap_or_default();
    recycled.push(at.format(RECYCLE_TIMESTAMP_FORMAT).to_string());
    if attempt > 0 {
        recycled.push(format!("_{attempt}"));
    }
    if let Some(ext) = path.extension() {
        recycled.push(".");
        recycled.push(ext);
    }
    recycled
}

/// Reject copying or moving `from` onto itself or into its own subtree.
fn check_not_nested(from: &Path, to: &Path) -> Result<()> {
    let (Some(from), Some(to)) = (sandbox::normalize(from), sandbox::normalize(to)) else {
        return Ok(());
    };
    if to == from {
        return Err(FileStoreError::InvalidPath(format!(
            "source and destination are the same: {}",
            from.display()
        )));
    }
    if to.starts_with(&from) {
        return Err(FileStoreError::InvalidPath(format!(
            "cannot place {} inside itself",
            from.display()
        )));
    }
    Ok(())
}

fn copy_blocking(from: &Path, to: &Path) -> Result<()> {
    let metadata = std::fs::metadata(from).map_err(|e| FileStoreError::from_io(from, e))?;
    check_not_nested(from, to)?;

    if !metadata.is_dir() {
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(from, to)?;
        return Ok(());
    }

    std::fs::create_dir_all(to)?;
    for entry in WalkDir::new(from).follow_links(true).min_depth(1) {
        let entry = entry.map_err(|e| FileStoreError::Io(e.into()))?;
        let Ok(relative) = entry.path().strip_prefix(from) else {
            continue;
        };
        let target = to.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Rename with overwrite, falling back to copy + remove across filesystems.
async fn move_path(from: &Path, to: &Path) -> Result<()> {
    fs::symlink_metadata(from)
        .await
        .map_err(|e| FileStoreError::from_io(from, e))?;
    check_not_nested(from, to)?;
    if let (Some(src), Some(dst)) = (sandbox::normalize(from), sandbox::normalize(to))
        && src.starts_with(&dst)
    {
        return Err(FileStoreError::InvalidPath(format!(
            "cannot replace {} with one of its own descendants",
            dst.display()
        )));
    }

    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).await?;
    }
    if fs::symlink_metadata(to).await.is_ok() {
        debug!("Replacing existing {}", to.display());
        remove_path(to).await?;
    }

    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            debug!("Cross-device move, copying {}", from.display());
            let (src, dst) = (from.to_path_buf(), to.to_path_buf());
            tokio::task::spawn_blocking(move || copy_blocking(&src, &dst)).await??;
            remove_path(from).await
        }
        Err(e) => Err(e.into()),
    }
}

async fn remove_path(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path)
        .await
        .map_err(|e| FileStoreError::from_io(path, e))?;
    if metadata.is_dir() {
        fs::remove_dir_all(path).await?;
    } else {
        fs::remove_file(path).await?;
    }
    Ok(())
}
