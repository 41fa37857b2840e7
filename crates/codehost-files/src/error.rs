use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FileStoreError {
    #[error("Access denied: '{}' is outside the permitted roots", .0.display())]
    AccessDenied(PathBuf),

    #[error("File not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Archive(String),
}

impl FileStoreError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            FileStoreError::AccessDenied(_) => "ACCESS_DENIED",
            FileStoreError::NotFound(_) => "NOT_FOUND",
            FileStoreError::InvalidPath(_) => "INVALID_PATH",
            FileStoreError::Io(_) => "IO_ERROR",
            FileStoreError::Archive(_) => "ARCHIVE_ERROR",
        }
    }

    /// Map an IO error on `path`, turning `ErrorKind::NotFound` into `NotFound`.
    pub(crate) fn from_io(path: &std::path::Path, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            FileStoreError::NotFound(path.to_path_buf())
        } else {
            FileStoreError::Io(err)
        }
    }
}

impl From<zip::result::ZipError> for FileStoreError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => FileStoreError::Io(e),
            other => FileStoreError::Archive(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for FileStoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        FileStoreError::Io(std::io::Error::other(err.to_string()))
    }
}

pub type Result<T, E = FileStoreError> = std::result::Result<T, E>;
