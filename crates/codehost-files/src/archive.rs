//! Blocking zip helpers. Callers run these under `spawn_blocking`.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Component, Path};

use tempfile::tempfile;
use tracing::debug;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{FileStoreError, Result};

/// Deflate level used for downloads.
const COMPRESSION_LEVEL: i64 = 9;

fn file_options() -> SimpleFileOptions {
    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(COMPRESSION_LEVEL))
        .unix_permissions(0o644)
}

/// Archive `path` into an anonymous temp file, rewound to the start.
///
/// A file becomes a single entry named after it; a directory contributes its
/// contents with their relative structure and no enclosing folder.
pub(crate) fn zip_to_tempfile(path: &Path) -> Result<File> {
    let file = tempfile()?;
    let mut zip = ZipWriter::new(file);
    let options = file_options();

    let metadata = std::fs::metadata(path).map_err(|e| FileStoreError::from_io(path, e))?;
    if metadata.is_file() {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        zip.start_file(name.as_str(), options)?;
        let mut input = File::open(path)?;
        std::io::copy(&mut input, &mut zip)?;
    } else if metadata.is_dir() {
        add_directory_contents(&mut zip, path, options)?;
    }

    let mut file = zip.finish()?;
    file.flush()?;
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}

fn add_directory_contents<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    dir: &Path,
    options: SimpleFileOptions,
) -> Result<()> {
    for entry in WalkDir::new(dir).min_depth(1) {
        let entry = entry.map_err(|e| FileStoreError::Io(e.into()))?;
        let relative = relative_name(dir, entry.path());

        if entry.file_type().is_file() {
            zip.start_file(relative.as_str(), options)?;
            let mut input = File::open(entry.path())?;
            std::io::copy(&mut input, zip)?;
        } else if entry.file_type().is_dir() {
            zip.add_directory(format!("{}/", relative).as_str(), options)?;
        }
    }
    Ok(())
}

/// `/`-joined path of `full` relative to `base`, as zip entry names require.
fn relative_name(base: &Path, full: &Path) -> String {
    let Ok(relative) = full.strip_prefix(base) else {
        return String::new();
    };

    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Extract every entry of `zip_file` into `to`.
///
/// Entries whose names would land outside `to` fail the whole extraction.
pub(crate) fn extract(zip_file: &Path, to: &Path) -> Result<()> {
    let file = File::open(zip_file).map_err(|e| FileStoreError::from_io(zip_file, e))?;
    let mut archive = ZipArchive::new(file)?;
    debug!(
        "Extracting {} entries from {} into {}",
        archive.len(),
        zip_file.display(),
        to.display()
    );
    std::fs::create_dir_all(to)?;
    archive.extract(to)?;
    Ok(())
}
