use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Cannot create a task for '{}': only files in the code directory can run", .0.display())]
    InvalidLocation(PathBuf),

    #[error("Cannot create a task for '{}': expected a .{expected} file", .path.display())]
    InvalidExecutableType { path: PathBuf, expected: String },

    #[error("Failed to spawn task '{}': {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TaskError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            TaskError::InvalidLocation(_) => "INVALID_LOCATION",
            TaskError::InvalidExecutableType { .. } => "INVALID_EXECUTABLE_TYPE",
            TaskError::Spawn { .. } => "SPAWN_FAILED",
        }
    }
}
