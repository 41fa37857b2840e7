//! Script execution: one supervised child process per script path.

pub mod error;
pub mod hardware;
pub mod logs;
pub mod manager;
pub mod status;
pub mod usage;

pub use error::TaskError;
pub use hardware::HardwareInfo;
pub use logs::{LogEntry, LogEvent, LogManager, TaskLogSink, TaskLogger};
pub use manager::TaskManager;
pub use status::{ExitReport, TaskStatus};
pub use usage::ResourceUsage;
