use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use whatsaly_protocol::IDENTITY_PLACEHOLDER;

pub const ENV_WHATSALY_CONFIG: &str = "WHATSALY_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "./whatsaly.toml";
const DEFAULT_DATABASE_PATH: &str = "./whatsaly.db";
const DEFAULT_SESSIONS_FILE: &str = "./sessions.txt";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_WORKER_PROGRAM: &str = "./whatsaly-worker";
const DEFAULT_STOP_GRACE_MS: u64 = 5000;
const DEFAULT_KILL_WAIT_MS: u64 = 2000;
const DEFAULT_INPUT_BUFFER: usize = 64;
const DEFAULT_RESTART_MAX_ATTEMPTS: u32 = 0;
const DEFAULT_RESTART_BACKOFF_MS: u64 = 5000;
const DEFAULT_RESTART_BACKOFF_MAX_MS: u64 = 60_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0}")]
    Message(String),
}

impl ConfigError {
    fn configuration(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    #[default]
    Sqlite,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WhatsalyConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub state_backend: StateBackend,
    #[serde(default = "default_sessions_file")]
    pub sessions_file: String,
    #[serde(default)]
    pub cache_url: Option<String>,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default)]
    pub worker: WorkerConfigToml,
    #[serde(default)]
    pub restart: RestartConfigToml,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerConfigToml {
    #[serde(default = "default_worker_program")]
    pub program: String,
    /// Arguments passed to the worker; `{identity}` is replaced per session.
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    #[serde(default = "default_kill_wait_ms")]
    pub kill_wait_ms: u64,
    #[serde(default = "default_input_buffer")]
    pub input_buffer: usize,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestartConfigToml {
    /// Zero disables restarts of workers that exit on their own.
    #[serde(default = "default_restart_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_restart_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_restart_backoff_max_ms")]
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLaunchConfig {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub stop_grace: Duration,
    pub kill_wait: Duration,
    pub input_buffer: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartRuntimeConfig {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub backoff_max: Duration,
}

impl WhatsalyConfig {
    pub fn worker_launch(&self) -> WorkerLaunchConfig {
        WorkerLaunchConfig {
            program: self.worker.program.clone(),
            args: self.worker.args.clone(),
            working_dir: self.worker.working_dir.as_ref().map(PathBuf::from),
            env: self
                .worker
                .env
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
            stop_grace: Duration::from_millis(self.worker.stop_grace_ms),
            kill_wait: Duration::from_millis(self.worker.kill_wait_ms),
            input_buffer: self.worker.input_buffer,
        }
    }

    pub fn restart_runtime(&self) -> RestartRuntimeConfig {
        RestartRuntimeConfig {
            max_attempts: self.restart.max_attempts,
            backoff: Duration::from_millis(self.restart.backoff_ms),
            backoff_max: Duration::from_millis(self.restart.backoff_max_ms),
        }
    }
}

impl Default for WhatsalyConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            state_backend: StateBackend::default(),
            sessions_file: default_sessions_file(),
            cache_url: None,
            log_filter: default_log_filter(),
            log_file: None,
            worker: WorkerConfigToml::default(),
            restart: RestartConfigToml::default(),
        }
    }
}

impl Default for WorkerConfigToml {
    fn default() -> Self {
        Self {
            program: default_worker_program(),
            args: default_worker_args(),
            working_dir: None,
            stop_grace_ms: default_stop_grace_ms(),
            kill_wait_ms: default_kill_wait_ms(),
            input_buffer: default_input_buffer(),
            env: BTreeMap::new(),
        }
    }
}

impl Default for RestartConfigToml {
    fn default() -> Self {
        Self {
            max_attempts: default_restart_max_attempts(),
            backoff_ms: default_restart_backoff_ms(),
            backoff_max_ms: default_restart_backoff_max_ms(),
        }
    }
}

pub fn load_from_env() -> Result<WhatsalyConfig, ConfigError> {
    let path = config_path_from_env()?;
    load_from_path(path)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<WhatsalyConfig, ConfigError> {
    load_or_create_config(path.as_ref())
}

fn config_path_from_env() -> Result<PathBuf, ConfigError> {
    match std::env::var(ENV_WHATSALY_CONFIG) {
        Ok(raw) => {
            if raw.trim().is_empty() {
                Ok(PathBuf::from(DEFAULT_CONFIG_PATH))
            } else {
                Ok(raw.trim().into())
            }
        }
        Err(std::env::VarError::NotPresent) => Ok(PathBuf::from(DEFAULT_CONFIG_PATH)),
        Err(_) => Err(ConfigError::configuration(
            "WHATSALY_CONFIG contained invalid UTF-8",
        )),
    }
}

fn default_database_path() -> String {
    DEFAULT_DATABASE_PATH.to_owned()
}

fn default_sessions_file() -> String {
    DEFAULT_SESSIONS_FILE.to_owned()
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

fn default_worker_program() -> String {
    DEFAULT_WORKER_PROGRAM.to_owned()
}

fn default_worker_args() -> Vec<String> {
    vec!["--phone".to_owned(), IDENTITY_PLACEHOLDER.to_owned()]
}

fn default_stop_grace_ms() -> u64 {
    DEFAULT_STOP_GRACE_MS
}

fn default_kill_wait_ms() -> u64 {
    DEFAULT_KILL_WAIT_MS
}

fn default_input_buffer() -> usize {
    DEFAULT_INPUT_BUFFER
}

fn default_restart_max_attempts() -> u32 {
    DEFAULT_RESTART_MAX_ATTEMPTS
}

fn default_restart_backoff_ms() -> u64 {
    DEFAULT_RESTART_BACKOFF_MS
}

fn default_restart_backoff_max_ms() -> u64 {
    DEFAULT_RESTART_BACKOFF_MAX_MS
}

fn persist_config(path: &Path, config: &WhatsalyConfig) -> Result<(), ConfigError> {
    let rendered = toml::to_string_pretty(config).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to serialize WHATSALY_CONFIG for {}: {err}",
            path.display()
        ))
    })?;

    std::fs::write(path, rendered.as_bytes()).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to write WHATSALY_CONFIG to {}: {err}",
            path.display()
        ))
    })
}

fn load_or_create_config(path: &Path) -> Result<WhatsalyConfig, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|err| {
                        ConfigError::configuration(format!(
                            "Failed to create parent directory {} for WHATSALY_CONFIG: {err}",
                            parent.display()
                        ))
                    })?;
                }
            }

            let default_config = WhatsalyConfig::default();
            persist_config(path, &default_config)?;
            return Ok(default_config);
        }
        Err(err) => {
            return Err(ConfigError::configuration(format!(
                "Failed to read WHATSALY_CONFIG from {}: {err}",
                path.display()
            )));
        }
    };

    let mut config: WhatsalyConfig = toml::from_str(&raw).map_err(|err| {
        ConfigError::configuration(format!(
            "Failed to parse WHATSALY_CONFIG from {}: {err}",
            path.display()
        ))
    })?;

    normalize_config(&mut config)?;
    Ok(config)
}

fn normalize_config(config: &mut WhatsalyConfig) -> Result<(), ConfigError> {
    normalize_path_field(&mut config.database_path, DEFAULT_DATABASE_PATH);
    normalize_path_field(&mut config.sessions_file, DEFAULT_SESSIONS_FILE);
    normalize_path_field(&mut config.log_filter, DEFAULT_LOG_FILTER);
    config.cache_url = normalize_optional(config.cache_url.take());
    config.log_file = normalize_optional(config.log_file.take());
    config.worker.working_dir = normalize_optional(config.worker.working_dir.take());

    let program = config.worker.program.trim();
    if program.is_empty() {
        return Err(ConfigError::configuration(
            "worker.program must name the worker executable",
        ));
    }
    config.worker.program = program.to_owned();

    if config.worker.stop_grace_ms == 0 {
        return Err(ConfigError::configuration(
            "worker.stop_grace_ms must be greater than 0",
        ));
    }
    if config.worker.input_buffer == 0 {
        config.worker.input_buffer = DEFAULT_INPUT_BUFFER;
    }
    if config.restart.backoff_max_ms < config.restart.backoff_ms {
        config.restart.backoff_max_ms = config.restart.backoff_ms;
    }
    Ok(())
}

fn normalize_path_field(value: &mut String, default: &str) {
    let trimmed = value.trim();
    *value = if trimmed.is_empty() {
        default.to_owned()
    } else {
        trimmed.to_owned()
    };
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_owned())
        .filter(|raw| !raw.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn env_lock() -> &'static Mutex<()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn with_env_var<F>(name: &str, value: Option<&str>, test: F)
    where
        F: FnOnce(),
    {
        let _guard = env_lock().lock().expect("env lock");
        let backup = std::env::var(name).ok();
        match value {
            Some(value) => std::env::set_var(name, value),
            None => std::env::remove_var(name),
        }

        test();

        match backup {
            Some(value) => std::env::set_var(name, value),
            None => std::env::remove_var(name),
        }
    }

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let path = std::env::temp_dir().join(format!(
            "whatsaly-config-{prefix}-{nanos}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&path).expect("create temp dir");
        path
    }

    fn remove_temp_path(path: &Path) {
        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn missing_config_is_created_with_defaults() {
        let root = unique_temp_dir("create");
        let path = root.join("nested").join("whatsaly.toml");

        let config = load_from_path(&path).expect("load config");

        assert!(path.exists());
        assert_eq!(config, WhatsalyConfig::default());
        assert_eq!(config.worker.stop_grace_ms, 5000);
        assert_eq!(config.restart.max_attempts, 0);
        let reloaded = load_from_path(&path).expect("reload config");
        assert_eq!(reloaded, config);

        remove_temp_path(&root);
    }

    #[test]
    fn partial_config_fills_defaults_and_normalizes() {
        let root = unique_temp_dir("partial");
        let path = root.join("whatsaly.toml");
        std::fs::write(
            &path,
            "state_backend = 'file'\ncache_url = '  '\n[worker]\nprogram = ' node '\nargs = ['worker.js', '{identity}']\ninput_buffer = 0\n[worker.env]\nLOG_LEVEL = 'debug'\n[restart]\nmax_attempts = 3\nbackoff_ms = 1000\nbackoff_max_ms = 10\n",
        )
        .expect("write config");

        let config = load_from_path(&path).expect("load config");

        assert_eq!(config.state_backend, StateBackend::File);
        assert_eq!(config.cache_url, None);
        assert_eq!(config.database_path, "./whatsaly.db");
        assert_eq!(config.worker.program, "node");
        assert_eq!(config.worker.input_buffer, 64);
        assert_eq!(config.restart.backoff_max_ms, 1000);

        let launch = config.worker_launch();
        assert_eq!(launch.args, vec!["worker.js", "{identity}"]);
        assert_eq!(launch.env, vec![("LOG_LEVEL".to_owned(), "debug".to_owned())]);
        assert_eq!(launch.stop_grace, Duration::from_secs(5));
        let restart = config.restart_runtime();
        assert_eq!(restart.max_attempts, 3);
        assert_eq!(restart.backoff, Duration::from_secs(1));

        remove_temp_path(&root);
    }

    #[test]
    fn zero_grace_period_is_rejected() {
        let root = unique_temp_dir("grace");
        let path = root.join("whatsaly.toml");
        std::fs::write(&path, "[worker]\nstop_grace_ms = 0\n").expect("write config");

        let error = load_from_path(&path).expect_err("zero grace should be rejected");
        assert!(error.to_string().contains("stop_grace_ms"));

        remove_temp_path(&root);
    }

    #[test]
    fn load_from_path_returns_parse_error_for_invalid_toml() {
        let root = unique_temp_dir("invalid");
        let path = root.join("whatsaly.toml");
        std::fs::write(&path, "database_path = [\n").expect("write config");

        let error = load_from_path(&path).expect_err("expected parse failure");
        assert!(error.to_string().contains("Failed to parse WHATSALY_CONFIG"));

        remove_temp_path(&root);
    }

    #[test]
    fn env_var_selects_config_path() {
        let root = unique_temp_dir("env");
        let path = root.join("custom.toml");
        std::fs::write(&path, "log_filter = 'debug'\n").expect("write config");

        with_env_var(ENV_WHATSALY_CONFIG, path.to_str(), || {
            let config = load_from_env().expect("load config from env");
            assert_eq!(config.log_filter, "debug");
        });

        remove_temp_path(&root);
    }

    #[test]
    fn default_worker_args_carry_the_identity_token() {
        let launch = WhatsalyConfig::default().worker_launch();

        assert_eq!(IDENTITY_PLACEHOLDER, "{identity}");
        assert_eq!(launch.args, vec!["--phone".to_owned(), "{identity}".to_owned()]);
        assert!(launch
            .args
            .iter()
            .any(|arg| arg.contains(IDENTITY_PLACEHOLDER)));
    }
}
