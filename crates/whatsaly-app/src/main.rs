use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use whatsaly_config::{StateBackend, WhatsalyConfig};
use whatsaly_store::{
    FileSessionStore, InMemoryCache, RedisCache, SessionCache, SessionStore, SqliteSessionStore,
};
use whatsaly_supervisor::{
    RestartPolicy, SessionManager, SupervisorSettings, TerminationPolicy, WorkerCommand,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = parse_cli_flags(std::env::args().skip(1))?;
    if cli.help {
        print_cli_help();
        return Ok(());
    }
    let config = match cli.config_path.as_deref() {
        Some(path) => whatsaly_config::load_from_path(path)?,
        None => whatsaly_config::load_from_env()?,
    };
    init_logging(&config)?;

    let store = build_store(&config)?;
    let cache = build_cache(&config)?;
    let manager = SessionManager::new(store, cache, supervisor_settings(&config));

    let report = manager.reconcile().await?;
    tracing::info!(
        started = report.started.len(),
        already_running = report.already_running.len(),
        inert = report.inert.len(),
        failed = report.failed.len(),
        "restored persisted sessions"
    );
    for (identity, reason) in &report.failed {
        tracing::warn!(identity = %identity, reason = %reason, "session could not be restored");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    if let Err(error) = manager.save_state().await {
        tracing::warn!(error = %error, "failed to save session state during shutdown");
    }
    manager.shutdown().await;
    tracing::info!("all workers stopped");
    Ok(())
}

fn init_logging(config: &WhatsalyConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_filter.as_str().into());

    let Some(log_file) = config.log_file.as_deref() else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(());
    };

    let log_path = Path::new(log_file);
    if let Some(parent) = log_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create log directory '{}'", parent.display())
            })?;
        }
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("failed to open log file '{}'", log_path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(std::sync::Mutex::new(file))
        .init();
    Ok(())
}

fn build_store(config: &WhatsalyConfig) -> Result<Arc<dyn SessionStore>> {
    match config.state_backend {
        StateBackend::Sqlite => {
            let store = SqliteSessionStore::open(&config.database_path).with_context(|| {
                format!("failed to open session database '{}'", config.database_path)
            })?;
            Ok(Arc::new(store))
        }
        StateBackend::File => Ok(Arc::new(FileSessionStore::new(&config.sessions_file))),
    }
}

fn build_cache(config: &WhatsalyConfig) -> Result<Arc<dyn SessionCache>> {
    match config.cache_url.as_deref() {
        Some(url) => {
            let cache = RedisCache::open(url)
                .with_context(|| format!("failed to configure cache at '{url}'"))?;
            Ok(Arc::new(cache))
        }
        None => {
            tracing::info!("no cache_url configured; using in-process cache");
            Ok(Arc::new(InMemoryCache::new()))
        }
    }
}

fn supervisor_settings(config: &WhatsalyConfig) -> SupervisorSettings {
    let launch = config.worker_launch();
    let restart = config.restart_runtime();

    let mut command = WorkerCommand::new(launch.program).with_args(launch.args);
    for (key, value) in launch.env {
        command = command.with_env(key, value);
    }
    if let Some(dir) = launch.working_dir {
        command = command.with_working_dir(dir);
    }

    let mut settings = SupervisorSettings::new(command)
        .with_termination(TerminationPolicy {
            grace: launch.stop_grace,
            kill_wait: launch.kill_wait,
        })
        .with_restart(RestartPolicy {
            max_attempts: restart.max_attempts,
            backoff: restart.backoff,
            backoff_max: restart.backoff_max,
        });
    settings.input_buffer = launch.input_buffer;
    settings
}

#[derive(Debug, Default, PartialEq, Eq)]
struct CliFlags {
    config_path: Option<PathBuf>,
    help: bool,
}

fn parse_cli_flags<I>(args: I) -> Result<CliFlags>
where
    I: IntoIterator<Item = String>,
{
    let mut flags = CliFlags::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let value = args.next().with_context(|| {
                    format!("Missing value after {arg}. Use {arg} <path>.")
                })?;
                if value.trim().is_empty() {
                    anyhow::bail!("Flag '{arg}' requires a non-empty value.");
                }
                flags.config_path = Some(PathBuf::from(value.trim()));
            }
            "--help" | "-h" => flags.help = true,
            value if value.starts_with('-') => {
                anyhow::bail!("Unknown flag '{value}'. Run with --help for valid flags.");
            }
            unknown => {
                anyhow::bail!("Unexpected argument '{unknown}'. Run with --help for valid flags.");
            }
        }
    }

    Ok(flags)
}

fn print_cli_help() {
    println!("Usage: whatsaly [--config <path>]");
    println!();
    println!("  --config <path>   Read configuration from <path> instead of $WHATSALY_CONFIG");
    println!("  --help            Show this help message");
}
