//! Layered configuration: defaults, optional TOML file, `CODEHOST__*` env vars.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

pub const APP_NAME: &str = "codehost";

const ENV_PREFIX: &str = "CODEHOST";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory holding `user_data/` and `program_data/`.
    pub data_root: PathBuf,
    /// Public domain reported with hardware info. Falls back to `$DOMAIN`.
    pub domain: Option<String>,
    pub logging: LoggingConfig,
    pub tasks: TasksConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/"),
            domain: None,
            logging: LoggingConfig::default(),
            tasks: TasksConfig::default(),
        }
    }
}

impl AppConfig {
    /// Configured domain, or the `DOMAIN` environment variable.
    pub fn effective_domain(&self) -> Option<String> {
        self.domain
            .clone()
            .or_else(|| std::env::var("DOMAIN").ok())
            .filter(|d| !d.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// How task processes are launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TasksConfig {
    /// Extension (without the dot) a file needs to be runnable.
    pub script_extension: String,
    /// Program that executes the script.
    pub interpreter: String,
    /// Arguments placed before the script path.
    pub interpreter_args: Vec<String>,
    /// Switch task processes to `run_as_uid`/`run_as_gid`. Needs root.
    pub drop_privileges: bool,
    pub run_as_uid: u32,
    pub run_as_gid: u32,
    /// Log entries kept per task.
    pub log_buffer_lines: usize,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            script_extension: "js".to_string(),
            interpreter: "node".to_string(),
            interpreter_args: Vec::new(),
            drop_privileges: true,
            run_as_uid: 6000,
            run_as_gid: 6000,
            log_buffer_lines: crate::tasks::logs::DEFAULT_MAX_ENTRIES,
        }
    }
}

impl TasksConfig {
    /// Configured extension with any leading dot removed.
    pub fn extension(&self) -> &str {
        self.script_extension.trim_start_matches('.')
    }
}

/// Default config file location (`$XDG_CONFIG_HOME/codehost/config.toml`).
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_NAME).join("config.toml"))
}

/// Load configuration. A missing file is not an error.
pub fn load(path: Option<&Path>) -> Result<AppConfig> {
    let mut builder = Config::builder();

    let file = path.map(Path::to_path_buf).or_else(default_config_path);
    if let Some(file) = file {
        builder = builder.add_source(
            File::from(file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        );
    }

    let built = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("tasks.interpreter_args"),
        )
        .build()
        .context("building configuration")?;

    built
        .try_deserialize()
        .context("deserializing configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_match_production_layout() {
        let config = AppConfig::default();
        assert_eq!(config.data_root, PathBuf::from("/"));
        assert_eq!(config.tasks.extension(), "js");
        assert_eq!(config.tasks.interpreter, "node");
        assert!(config.tasks.drop_privileges);
        assert_eq!((config.tasks.run_as_uid, config.tasks.run_as_gid), (6000, 6000));
    }

    #[test]
    fn test_load_from_toml_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        fs::write(
            &path,
            r#"
data_root = "/srv/codehost"
domain = "code.example.com"

[tasks]
script_extension = ".py"
interpreter = "python3"
drop_privileges = false
"#,
        )
        .unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.data_root, PathBuf::from("/srv/codehost"));
        assert_eq!(config.effective_domain().as_deref(), Some("code.example.com"));
        assert_eq!(config.tasks.extension(), "py");
        assert_eq!(config.tasks.interpreter, "python3");
        assert!(!config.tasks.drop_privileges);
        assert_eq!(config.tasks.run_as_uid, 6000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = load(Some(&tmp.path().join("absent.toml"))).unwrap();
        assert_eq!(config.tasks.interpreter, "node");
    }
}
