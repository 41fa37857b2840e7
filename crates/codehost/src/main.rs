use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use log::{LevelFilter, debug, info, warn};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::error::RecvError;

use codehost::config::{self, APP_NAME, AppConfig};
use codehost::files::{FileStore, FileStream, Layout};
use codehost::tasks::{LogEvent, LogManager, TaskManager, TaskStatus};

fn main() {
    match try_main() {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(err) => {
            let _ = writeln!(io::stderr(), "{err:?}");
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, command: Command) -> Result<i32> {
    handle_command(&ctx, command).await
}

fn try_main() -> Result<i32> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common)?;
    ctx.init_logging()?;
    debug!("data root: {}", ctx.config.data_root.display());

    async_main(ctx, cli.command)
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Codehost - sandboxed code storage and script runner.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Override the data root from the config
    #[arg(long, value_name = "DIR", global = true)]
    data_root: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the data directories and a default config file
    Init(InitCommand),
    /// List a directory
    Ls { path: PathBuf },
    /// Create a directory (and its parents)
    Mkdir { path: PathBuf },
    /// Copy a file or directory
    Cp { from: PathBuf, to: PathBuf },
    /// Move a file or directory inside the data root
    Mv { from: PathBuf, to: PathBuf },
    /// Move a file from anywhere into the data root
    Import { from: PathBuf, to: PathBuf },
    /// Delete code, to the recycle bin unless --permanent
    Rm {
        path: PathBuf,
        /// Delete immediately instead of recycling
        #[arg(long)]
        permanent: bool,
    },
    /// Delete program data permanently
    RmData { path: PathBuf },
    /// Empty the recycle bin
    CleanRecycle,
    /// Write a file to stdout
    Cat { path: PathBuf },
    /// Print the size of a file in bytes
    Size { path: PathBuf },
    /// Zip a file or directory
    Zip {
        path: PathBuf,
        /// Write the archive here instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Extract an archive into a directory and delete the archive
    Unzip { archive: PathBuf, to: PathBuf },
    /// Run a script in the foreground and follow its output
    Run { path: PathBuf },
    /// Show host hardware information
    Hw,
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Overwrite an existing config file
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Print the config file path
    Path,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_path: Option<PathBuf>,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_path = common.config.clone().or_else(config::default_config_path);
        let mut config = config::load(config_path.as_deref())?;
        if let Some(root) = &common.data_root {
            config.data_root = absolute(root)?;
        }
        Ok(Self {
            common,
            config_path,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = self.effective_log_level().as_str().to_lowercase();
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{APP_NAME}={level},codehost_files={level}"))
        });

        if self.common.json || self.config.logging.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(io::stderr().is_terminal()),
                )
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => LevelFilter::from_str(&self.config.logging.level).unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn layout(&self) -> Arc<Layout> {
        Arc::new(Layout::new(&self.config.data_root))
    }

    /// Print `value` as JSON, or via `human` otherwise.
    fn emit<T: Serialize>(&self, value: &T, human: impl FnOnce(&T) -> String) -> Result<()> {
        let text = if self.common.json {
            serde_json::to_string_pretty(value)?
        } else {
            human(value)
        };
        if !text.is_empty() {
            println!("{text}");
        }
        Ok(())
    }
}

async fn handle_command(ctx: &RuntimeContext, command: Command) -> Result<i32> {
    let layout = ctx.layout();
    let store = FileStore::new(Arc::clone(&layout));

    match command {
        Command::Init(cmd) => handle_init(ctx, &layout, cmd).await?,
        Command::Ls { path } => {
            let entries = store.list_directory(&absolute(&path)?).await?;
            ctx.emit(&entries, |entries| {
                entries
                    .iter()
                    .map(|e| {
                        if e.is_file {
                            e.name.clone()
                        } else {
                            format!("{}/", e.name)
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }
        Command::Mkdir { path } => store.create_directory(&absolute(&path)?).await?,
        Command::Cp { from, to } => store.copy(&absolute(&from)?, &absolute(&to)?).await?,
        Command::Mv { from, to } => {
            store
                .move_entry(&absolute(&from)?, &absolute(&to)?)
                .await?
        }
        Command::Import { from, to } => {
            store
                .move_from_outside(&absolute(&from)?, &absolute(&to)?)
                .await?
        }
        Command::Rm { path, permanent } => {
            let path = absolute(&path)?;
            if permanent {
                store.delete_code_data_directly(&path).await?;
            } else {
                let recycled = store.delete_code_data(&path).await?;
                info!("Moved {} to {}", path.display(), recycled.display());
            }
        }
        Command::RmData { path } => store.delete_program_data(&absolute(&path)?).await?,
        Command::CleanRecycle => store.clean_recycle().await?,
        Command::Cat { path } => {
            let stream = store.read_file(&absolute(&path)?).await?;
            copy_stream(stream, &mut tokio::io::stdout()).await?;
        }
        Command::Size { path } => {
            let size = store.file_size(&absolute(&path)?).await?;
            ctx.emit(&size, u64::to_string)?;
        }
        Command::Zip { path, output } => {
            let stream = store.zip_data(&absolute(&path)?).await?;
            match output {
                Some(output) => {
                    let mut file = tokio::fs::File::create(&output)
                        .await
                        .with_context(|| format!("creating {}", output.display()))?;
                    copy_stream(stream, &mut file).await?;
                }
                None => copy_stream(stream, &mut tokio::io::stdout()).await?,
            }
        }
        Command::Unzip { archive, to } => {
            store
                .unzip_data(&absolute(&archive)?, &absolute(&to)?)
                .await?
        }
        Command::Run { path } => return handle_run(ctx, layout, &absolute(&path)?).await,
        Command::Hw => {
            let tasks = TaskManager::new(
                layout,
                ctx.config.tasks.clone(),
                Arc::new(LogManager::new(1)),
            )
            .with_domain(ctx.config.effective_domain());
            let info = tasks.system_hardware_info().await?;
            ctx.emit(&info, |info| {
                format!(
                    "cpus:    {} x {}\nmemory:  {} / {} MiB free\nuptime:  {:.0}s\ndomain:  {}",
                    info.cpu_count,
                    info.cpu_model,
                    info.free_memory / (1024 * 1024),
                    info.total_memory / (1024 * 1024),
                    info.uptime_seconds,
                    info.domain.as_deref().unwrap_or("-"),
                )
            })?;
        }
        Command::Config { command } => return handle_config(ctx, command),
    }

    Ok(0)
}

async fn handle_init(ctx: &RuntimeContext, layout: &Layout, cmd: InitCommand) -> Result<()> {
    layout
        .ensure()
        .await
        .with_context(|| format!("creating data directories under {}", layout.data_root().display()))?;
    info!("Data directories ready under {}", layout.data_root().display());

    let Some(path) = &ctx.config_path else {
        warn!("No config directory available; skipping config file");
        return Ok(());
    };
    if path.exists() && !cmd.force {
        info!("Config file already exists at {}", path.display());
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {}", parent.display()))?;
    }
    let contents = toml::to_string_pretty(&AppConfig::default())
        .context("serializing default config")?;
    fs::write(path, contents).with_context(|| format!("writing {}", path.display()))?;
    info!("Wrote default config to {}", path.display());
    Ok(())
}

/// Run one task in the foreground. Ctrl-C asks it to terminate.
///
/// Exit code is 0 when the task stopped and 1 when it crashed.
async fn handle_run(ctx: &RuntimeContext, layout: Arc<Layout>, path: &Path) -> Result<i32> {
    let logs = LogManager::new(ctx.config.tasks.log_buffer_lines);
    let mut events = logs.subscribe();
    let tasks = TaskManager::new(layout, ctx.config.tasks.clone(), Arc::new(logs))
        .with_domain(ctx.config.effective_domain());

    let key = tasks.create_task(path).await?;
    let mut stopping = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let (task, terminal) = match &event {
                        LogEvent::Log { task, .. } => (task, None),
                        LogEvent::Status { task, status } => {
                            (task, status.is_terminal().then_some(*status))
                        }
                    };
                    if *task != key {
                        continue;
                    }
                    print_event(ctx, &event)?;
                    if let Some(status) = terminal {
                        return Ok(if status == TaskStatus::Stop { 0 } else { 1 });
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} log events", skipped),
                Err(RecvError::Closed) => break,
            },
            result = tokio::signal::ctrl_c(), if !stopping => {
                result.context("listening for Ctrl-C")?;
                info!("Stopping {}", key.display());
                tasks.destroy_task(&key).await;
                stopping = true;
            }
        }
    }

    Ok(1)
}

fn print_event(ctx: &RuntimeContext, event: &LogEvent) -> Result<()> {
    if ctx.common.json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    match event {
        LogEvent::Log { entry, .. } if entry.is_error => {
            let mut stderr = io::stderr().lock();
            stderr.write_all(entry.text.as_bytes())?;
            stderr.flush()?;
        }
        LogEvent::Log { entry, .. } => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(entry.text.as_bytes())?;
            stdout.flush()?;
        }
        LogEvent::Status { task, status } => info!("{}: {}", task.display(), status),
    }
    Ok(())
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<i32> {
    match command {
        ConfigCommand::Show => {
            let text = if ctx.common.json {
                serde_json::to_string_pretty(&ctx.config)?
            } else {
                toml::to_string_pretty(&ctx.config).context("serializing config")?
            };
            println!("{text}");
        }
        ConfigCommand::Path => match &ctx.config_path {
            Some(path) => println!("{}", path.display()),
            None => anyhow::bail!("no config directory available"),
        },
    }
    Ok(0)
}

async fn copy_stream<W>(mut stream: FileStream, out: &mut W) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(chunk) = stream.next().await {
        out.write_all(&chunk?).await?;
    }
    out.flush().await?;
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("resolving {}", path.display()))
}
