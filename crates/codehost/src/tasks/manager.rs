//! Task lifecycle: spawn, supervise and terminate script processes.
//!
//! Each task is keyed by the normalised path of the script it runs. A
//! background supervisor forwards the child's output to its logger, waits
//! for exit, reports `stop` or `crashed` and drops the task from the live
//! map. Check-and-insert and removal both happen under the map lock, so at
//! most one process runs per script.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use codehost_files::{Layout, PathSandbox, Root, sandbox};

use super::error::TaskError;
use super::hardware::{self, HardwareInfo};
use super::logs::{TaskLogSink, TaskLogger};
use super::status::{ExitReport, TERMINATION_SIGNAL, TaskStatus};
use super::usage::{self, ResourceUsage};
use crate::config::TasksConfig;

const READ_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Copy)]
struct LiveTask {
    pid: Option<u32>,
    /// Distinguishes successive runs of the same script.
    instance: u64,
}

type TaskMap = Arc<Mutex<HashMap<PathBuf, LiveTask>>>;

/// Runs scripts from the code directory as child processes.
#[derive(Clone)]
pub struct TaskManager {
    layout: Arc<Layout>,
    config: TasksConfig,
    domain: Option<String>,
    sink: Arc<dyn TaskLogSink>,
    tasks: TaskMap,
    next_instance: Arc<AtomicU64>,
}

impl TaskManager {
    pub fn new(layout: Arc<Layout>, config: TasksConfig, sink: Arc<dyn TaskLogSink>) -> Self {
        Self {
            layout,
            config,
            domain: None,
            sink,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_instance: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Domain reported by [`system_hardware_info`](Self::system_hardware_info).
    pub fn with_domain(mut self, domain: Option<String>) -> Self {
        self.domain = domain;
        self
    }

    /// Validate `path` as a runnable script and return its task key.
    pub fn task_key(&self, path: &Path) -> Result<PathBuf, TaskError> {
        let invalid_location = || TaskError::InvalidLocation(path.to_path_buf());

        let key = PathSandbox::new(&self.layout)
            .validate(path, &[Root::Code])
            .map_err(|_| invalid_location())?;

        // Suffix match, so a file named just `.js` is runnable too.
        let suffix = format!(".{}", self.config.extension());
        let runnable = key
            .file_name()
            .is_some_and(|name| name.as_encoded_bytes().ends_with(suffix.as_bytes()));
        if !runnable {
            return Err(TaskError::InvalidExecutableType {
                path: path.to_path_buf(),
                expected: self.config.extension().to_string(),
            });
        }

        Ok(key)
    }

    /// Start running the script at `path`. Does nothing if it is already running.
    ///
    /// Returns the task key once the process exists and its output is wired
    /// to the logger; it does not wait for any output. A later crash is only
    /// visible through the logger status.
    pub async fn create_task(&self, path: &Path) -> Result<PathBuf, TaskError> {
        let key = self.task_key(path)?;

        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&key) {
            debug!("Task {} is already running", key.display());
            return Ok(key);
        }

        let mut child = self.command(&key).spawn().map_err(|source| {
            warn!("Failed to spawn task {}: {}", key.display(), source);
            TaskError::Spawn {
                path: key.clone(),
                source,
            }
        })?;
        let pid = child.id();
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);

        let logger = self.sink.create_logger(&key);
        logger.set_status(TaskStatus::Running);

        tasks.insert(key.clone(), LiveTask { pid, instance });
        info!(
            "Started task {} with {} (pid={:?})",
            key.display(),
            self.config.interpreter,
            pid
        );

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tokio::spawn(supervise(
            child,
            stdout,
            stderr,
            logger,
            Arc::clone(&self.tasks),
            key.clone(),
            instance,
        ));

        Ok(key)
    }

    /// Ask the task for `path` to terminate. Does not wait for it to exit.
    ///
    /// Returns whether a termination signal was delivered; unknown tasks are a no-op.
    pub async fn destroy_task(&self, path: &Path) -> bool {
        let Some(key) = sandbox::normalize(path) else {
            return false;
        };

        let tasks = self.tasks.lock().await;
        let Some(task) = tasks.get(&key) else {
            debug!("No running task for {}", key.display());
            return false;
        };
        let Some(pid) = task.pid.filter(|pid| *pid > 0) else {
            return false;
        };

        info!("Stopping task {} (pid={})", key.display(), pid);
        send_termination(pid)
    }

    /// CPU and memory usage of the task's own process, if it is running.
    pub async fn task_resource_usage(&self, path: &Path) -> Option<ResourceUsage> {
        let key = sandbox::normalize(path)?;
        let pid = self.tasks.lock().await.get(&key)?.pid?;

        match usage::sample(pid).await {
            Ok(usage) => Some(usage),
            Err(e) => {
                debug!("Could not sample task {} (pid={}): {:#}", key.display(), pid, e);
                None
            }
        }
    }

    pub async fn is_running(&self, path: &Path) -> bool {
        match sandbox::normalize(path) {
            Some(key) => self.tasks.lock().await.contains_key(&key),
            None => false,
        }
    }

    pub async fn running_tasks(&self) -> Vec<PathBuf> {
        self.tasks.lock().await.keys().cloned().collect()
    }

    /// Point-in-time hardware information of the host.
    pub async fn system_hardware_info(&self) -> Result<HardwareInfo> {
        hardware::read_hardware_info(self.domain.clone()).await
    }

    fn command(&self, script: &Path) -> Command {
        let mut cmd = Command::new(&self.config.interpreter);
        cmd.args(&self.config.interpreter_args)
            .arg(script)
            .current_dir(self.layout.program_data_dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            if self.config.drop_privileges {
                if !rustix::process::geteuid().is_root() {
                    warn!(
                        "Not running as root; switching tasks to uid {} will likely fail",
                        self.config.run_as_uid
                    );
                }
                cmd.uid(self.config.run_as_uid).gid(self.config.run_as_gid);
            }
        }

        cmd
    }
}

/// Forward output, wait for exit, report the final status and unregister.
async fn supervise(
    mut child: Child,
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
    logger: Arc<dyn TaskLogger>,
    tasks: TaskMap,
    key: PathBuf,
    instance: u64,
) {
    tokio::join!(
        forward_output(stdout, logger.as_ref(), false),
        forward_output(stderr, logger.as_ref(), true),
    );

    // Reap only while holding the map lock, so destroy_task never signals a
    // pid that was already reaped and possibly reused. If the child could not
    // be observed without reaping, fall back to reaping before locking.
    let (report, mut tasks) = if wait_until_exited(child.id()).await {
        let tasks = tasks.lock().await;
        (reap(&mut child, &key).await, tasks)
    } else {
        let report = reap(&mut child, &key).await;
        (report, tasks.lock().await)
    };
    let status = TaskStatus::classify(&report);
    info!("Task {} {}: {}", key.display(), report, status);

    logger.set_status(status);
    if tasks.get(&key).is_some_and(|task| task.instance == instance) {
        tasks.remove(&key);
    }
}

/// Wait until the child `pid` has exited without reaping it.
///
/// Returns false when that cannot be observed.
async fn wait_until_exited(pid: Option<u32>) -> bool {
    #[cfg(unix)]
    {
        let Some(pid) = pid
            .and_then(|pid| i32::try_from(pid).ok())
            .and_then(rustix::process::Pid::from_raw)
        else {
            return false;
        };

        let waited = tokio::task::spawn_blocking(move || {
            use rustix::process::{WaitId, WaitIdOptions, waitid};
            loop {
                match waitid(
                    WaitId::Pid(pid),
                    WaitIdOptions::EXITED | WaitIdOptions::NOWAIT,
                ) {
                    Ok(_) => return Ok(()),
                    Err(rustix::io::Errno::INTR) => continue,
                    Err(e) => return Err(e),
                }
            }
        })
        .await;

        match waited {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                debug!("waitid on pid {} failed: {}", pid.as_raw_nonzero(), e);
                false
            }
            Err(e) => {
                warn!("Exit watcher for pid {} failed: {}", pid.as_raw_nonzero(), e);
                false
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

async fn reap(child: &mut Child, key: &Path) -> ExitReport {
    match child.wait().await {
        Ok(status) => ExitReport::from(status),
        Err(e) => {
            warn!("Error waiting for task {}: {}", key.display(), e);
            ExitReport::default()
        }
    }
}

/// Pass chunks to the logger as they arrive, until EOF.
async fn forward_output<R>(stream: Option<R>, logger: &dyn TaskLogger, is_error: bool)
where
    R: AsyncRead + Unpin,
{
    let Some(mut stream) = stream else {
        return;
    };

    let mut buf = vec![0u8; READ_CHUNK_SIZE];
    let mut pending = Vec::new();
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let text = take_utf8(&mut pending);
                if !text.is_empty() {
                    logger.add_log(is_error, &text);
                }
            }
            Err(e) => {
                warn!("Error reading task output: {}", e);
                break;
            }
        }
    }

    if !pending.is_empty() {
        logger.add_log(is_error, &String::from_utf8_lossy(&pending));
    }
}

/// Drain `pending` as text, keeping back an incomplete trailing UTF-8 sequence.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    let complete = match std::str::from_utf8(pending) {
        Ok(_) => pending.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => pending.len(),
    };

    let rest = pending.split_off(complete);
    let text = String::from_utf8_lossy(pending).into_owned();
    *pending = rest;
    text
}

fn send_termination(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid as libc::pid_t, TERMINATION_SIGNAL) };
        if rc != 0 {
            warn!(
                "Failed to signal pid {}: {}",
                pid,
                std::io::Error::last_os_error()
            );
            return false;
        }
        true
    }
    #[cfg(not(unix))]
    {
        warn!("Cannot signal pid {} on this platform", pid);
        false
    }
}
