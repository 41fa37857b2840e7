use std::fmt;
use std::process::ExitStatus;

use serde::{Deserialize, Serialize};

/// Signal sent by `destroy_task`; a task killed by it counts as stopped.
pub const TERMINATION_SIGNAL: i32 = libc::SIGTERM;

/// Reported state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Stop,
    Crashed,
}

impl TaskStatus {
    /// Final status for a process that exited with `report`.
    pub fn classify(report: &ExitReport) -> Self {
        if report.exit_code == Some(0) || report.signal == Some(TERMINATION_SIGNAL) {
            TaskStatus::Stop
        } else {
            TaskStatus::Crashed
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TaskStatus::Running => "running",
            TaskStatus::Stop => "stop",
            TaskStatus::Crashed => "crashed",
        })
    }
}

/// How a task process ended.
///
/// On Unix a process killed by a signal has no exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ExitReport {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitReport {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            exit_code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.exit_code, self.signal) {
            (Some(code), _) => write!(f, "exited with code {}", code),
            (None, Some(sig)) => {
                let sig_name = match sig {
                    9 => "SIGKILL",
                    15 => "SIGTERM",
                    11 => "SIGSEGV",
                    6 => "SIGABRT",
                    _ => "",
                };
                if sig_name.is_empty() {
                    write!(f, "killed by signal {}", sig)
                } else {
                    write!(f, "killed by {} (signal {})", sig_name, sig)
                }
            }
            (None, None) => f.write_str("exited (unknown status)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_exit_is_stop() {
        let report = ExitReport {
            exit_code: Some(0),
            signal: None,
        };
        assert_eq!(TaskStatus::classify(&report), TaskStatus::Stop);
    }

    #[test]
    fn test_termination_signal_is_stop() {
        let report = ExitReport {
            exit_code: None,
            signal: Some(libc::SIGTERM),
        };
        assert_eq!(TaskStatus::classify(&report), TaskStatus::Stop);
    }

    #[test]
    fn test_failures_are_crashes() {
        for report in [
            ExitReport { exit_code: Some(1), signal: None },
            ExitReport { exit_code: None, signal: Some(libc::SIGKILL) },
            ExitReport { exit_code: None, signal: Some(libc::SIGSEGV) },
            ExitReport::default(),
        ] {
            assert_eq!(TaskStatus::classify(&report), TaskStatus::Crashed, "{report}");
        }
    }

    #[test]
    fn test_format_exit_report() {
        let code = ExitReport { exit_code: Some(2), signal: None };
        assert_eq!(code.to_string(), "exited with code 2");

        let term = ExitReport { exit_code: None, signal: Some(15) };
        assert_eq!(term.to_string(), "killed by SIGTERM (signal 15)");

        let odd = ExitReport { exit_code: None, signal: Some(10) };
        assert_eq!(odd.to_string(), "killed by signal 10");
    }

    #[cfg(unix)]
    #[test]
    fn test_report_from_exit_status() {
        use std::os::unix::process::ExitStatusExt;

        let report = ExitReport::from(ExitStatus::from_raw(3 << 8));
        assert_eq!(report.exit_code, Some(3));
        assert_eq!(report.signal, None);

        let report = ExitReport::from(ExitStatus::from_raw(libc::SIGTERM));
        assert_eq!(report.exit_code, None);
        assert_eq!(report.signal, Some(libc::SIGTERM));
    }
}
