//! Task log collaborator.
//!
//! [`TaskManager`](super::TaskManager) only talks to the [`TaskLogSink`] and
//! [`TaskLogger`] traits. [`LogManager`] is the in-process implementation:
//! it keeps a bounded history per task and broadcasts every change so a
//! consumer can follow tasks live.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use log::trace;
use serde::Serialize;
use tokio::sync::broadcast;

use super::status::TaskStatus;

/// Default number of log entries kept per task.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Per-task log handle.
pub trait TaskLogger: Send + Sync {
    fn set_status(&self, status: TaskStatus);
    fn add_log(&self, is_error: bool, text: &str);
}

/// Hands out a logger for each task path.
pub trait TaskLogSink: Send + Sync {
    fn create_logger(&self, task: &Path) -> Arc<dyn TaskLogger>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub is_error: bool,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    Log { task: PathBuf, entry: LogEntry },
    Status { task: PathBuf, status: TaskStatus },
}

#[derive(Debug)]
struct TaskLog {
    status: TaskStatus,
    entries: VecDeque<LogEntry>,
}

#[derive(Debug)]
struct Inner {
    tasks: Mutex<HashMap<PathBuf, TaskLog>>,
    events: broadcast::Sender<LogEvent>,
    max_entries: usize,
}

impl Inner {
    fn tasks(&self) -> MutexGuard<'_, HashMap<PathBuf, TaskLog>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: LogEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// In-memory log store shared by all tasks.
#[derive(Debug, Clone)]
pub struct LogManager {
    inner: Arc<Inner>,
}

impl Default for LogManager {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl LogManager {
    /// Create a manager keeping at most `max_entries` entries per task.
    pub fn new(max_entries: usize) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                tasks: Mutex::new(HashMap::new()),
                events,
                max_entries: max_entries.max(1),
            }),
        }
    }

    /// Receive every log entry and status change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.inner.events.subscribe()
    }

    /// Last reported status of `task`, if it ever had a logger.
    pub fn status(&self, task: &Path) -> Option<TaskStatus> {
        self.inner.tasks().get(task).map(|log| log.status)
    }

    /// Buffered entries of `task`, oldest first.
    pub fn logs(&self, task: &Path) -> Vec<LogEntry> {
        self.inner
            .tasks()
            .get(task)
            .map(|log| log.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every task path that has a log.
    pub fn tasks(&self) -> Vec<PathBuf> {
        self.inner.tasks().keys().cloned().collect()
    }

    /// Forget the history of `task`. Returns whether anything was removed.
    pub fn clear(&self, task: &Path) -> bool {
        self.inner.tasks().remove(task).is_some()
    }
}

impl TaskLogSink for LogManager {
    fn create_logger(&self, task: &Path) -> Arc<dyn TaskLogger> {
        self.inner
            .tasks()
            .entry(task.to_path_buf())
            .or_insert_with(|| TaskLog {
                status: TaskStatus::Stop,
                entries: VecDeque::new(),
            });

        Arc::new(ManagedLogger {
            inner: Arc::clone(&self.inner),
            task: task.to_path_buf(),
        })
    }
}

struct ManagedLogger {
    inner: Arc<Inner>,
    task: PathBuf,
}

impl TaskLogger for ManagedLogger {
    fn set_status(&self, status: TaskStatus) {
        {
            let mut tasks = self.inner.tasks();
            let log = tasks.entry(self.task.clone()).or_insert_with(|| TaskLog {
                status,
                entries: VecDeque::new(),
            });
            log.status = status;
        }
        trace!("Task {} status: {}", self.task.display(), status);
        self.inner.publish(LogEvent::Status {
            task: self.task.clone(),
            status,
        });
    }

    fn add_log(&self, is_error: bool, text: &str) {
        let entry = LogEntry {
            timestamp: now_millis(),
            is_error,
            text: text.to_string(),
        };

        {
            let mut tasks = self.inner.tasks();
            let log = tasks.entry(self.task.clone()).or_insert_with(|| TaskLog {
                status: TaskStatus::Running,
                entries: VecDeque::new(),
            });
            log.entries.push_back(entry.clone());
            while log.entries.len() > self.inner.max_entries {
                log.entries.pop_front();
            }
        }

        self.inner.publish(LogEvent::Log {
            task: self.task.clone(),
            entry,
        });
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logger_records_entries_and_status() {
        let manager = LogManager::default();
        let task = Path::new("/user_data/code/app.js");
        let logger = manager.create_logger(task);

        logger.set_status(TaskStatus::Running);
        logger.add_log(false, "hello\n");
        logger.add_log(true, "oops\n");

        assert_eq!(manager.status(task), Some(TaskStatus::Running));
        let logs = manager.logs(task);
        assert_eq!(logs.len(), 2);
        assert!(!logs[0].is_error);
        assert_eq!(logs[0].text, "hello\n");
        assert!(logs[1].is_error);
    }

    #[test]
    fn test_history_is_bounded() {
        let manager = LogManager::new(3);
        let task = Path::new("/user_data/code/chatty.js");
        let logger = manager.create_logger(task);

        for i in 0..10 {
            logger.add_log(false, &i.to_string());
        }

        let texts: Vec<String> = manager.logs(task).into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["7", "8", "9"]);
    }

    #[test]
    fn test_history_survives_new_logger() {
        let manager = LogManager::default();
        let task = Path::new("/user_data/code/app.js");

        manager.create_logger(task).add_log(false, "first run");
        manager.create_logger(task).add_log(false, "second run");

        assert_eq!(manager.logs(task).len(), 2);
        assert!(manager.clear(task));
        assert!(manager.logs(task).is_empty());
        assert_eq!(manager.status(task), None);
    }

    #[tokio::test]
    async fn test_subscribers_see_events_in_order() {
        let manager = LogManager::default();
        let mut events = manager.subscribe();
        let task = Path::new("/user_data/code/app.js");
        let logger = manager.create_logger(task);

        logger.set_status(TaskStatus::Running);
        logger.add_log(false, "line");
        logger.set_status(TaskStatus::Stop);

        assert!(matches!(
            events.recv().await.unwrap(),
            LogEvent::Status { status: TaskStatus::Running, .. }
        ));
        match events.recv().await.unwrap() {
            LogEvent::Log { task: t, entry } => {
                assert_eq!(t, task);
                assert_eq!(entry.text, "line");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(
            events.recv().await.unwrap(),
            LogEvent::Status { status: TaskStatus::Stop, .. }
        ));
    }
}
