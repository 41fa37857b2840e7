//! Shared fixtures for task integration tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use codehost::config::TasksConfig;
use codehost::files::Layout;
use codehost::tasks::{LogManager, TaskManager, TaskStatus};
use tempfile::TempDir;

const EXIT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A data root in a temp dir with a task manager running `sh` scripts.
pub struct TestHost {
    pub dir: TempDir,
    pub layout: Arc<Layout>,
    pub logs: LogManager,
    pub tasks: TaskManager,
}

pub async fn test_host() -> TestHost {
    let dir = TempDir::new().unwrap();
    let layout = Arc::new(Layout::new(dir.path()));
    layout.ensure().await.unwrap();

    let config = TasksConfig {
        script_extension: "sh".to_string(),
        interpreter: "sh".to_string(),
        drop_privileges: false,
        ..TasksConfig::default()
    };
    let logs = LogManager::default();
    let tasks = TaskManager::new(Arc::clone(&layout), config, Arc::new(logs.clone()))
        .with_domain(Some("test.local".to_string()));

    TestHost {
        dir,
        layout,
        logs,
        tasks,
    }
}

impl TestHost {
    /// Write `body` to `name` inside the code directory.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.layout.code_dir().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    /// Poll until the task is gone from the live map and return its final status.
    pub async fn wait_for_exit(&self, path: &Path) -> TaskStatus {
        tokio::time::timeout(EXIT_TIMEOUT, async {
            while self.tasks.is_running(path).await {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        })
        .await
        .expect("task did not exit in time");

        self.logs.status(path).expect("task never reported a status")
    }

    /// Concatenated log text of one stream.
    pub fn output(&self, path: &Path, is_error: bool) -> String {
        self.logs
            .logs(path)
            .into_iter()
            .filter(|entry| entry.is_error == is_error)
            .map(|entry| entry.text)
            .collect()
    }
}
