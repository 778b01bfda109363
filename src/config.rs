use std::path::PathBuf;

use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "runwright";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Target identifier handed to every stage.
pub const ENV_TARGET: &str = "RUNWRIGHT_TARGET";
/// Directory of the run the stages read from and write to.
pub const ENV_RUN_DIR: &str = "RUNWRIGHT_RUN_DIR";
/// Log filter override (EnvFilter syntax).
pub const ENV_LOG: &str = "RUNWRIGHT_LOG";
pub const ENV_OLLAMA_URL: &str = "RUNWRIGHT_OLLAMA_URL";
pub const ENV_MODEL: &str = "RUNWRIGHT_MODEL";
pub const ENV_CACHE: &str = "RUNWRIGHT_CACHE";

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL: &str = "mistral:7b-instruct";
pub const DEFAULT_TASK_TIMEOUT_SECS: u64 = 180;
pub const DEFAULT_LLM_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_SERVE_ADDR: &str = "127.0.0.1:8080";

/// Run manifest written by the stage runner.
pub const MANIFEST_FILE: &str = "run.json";
pub const PROMPT_LOG_FILE: &str = "prompt_log.jsonl";
pub const MODEL_CHOICES_FILE: &str = "model_choices.jsonl";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Required environment variable {0} is not set")]
    MissingVar(&'static str),
}

/// Default tracing filter when `RUNWRIGHT_LOG` is unset.
pub fn default_log_filter(verbose: bool) -> &'static str {
    if verbose {
        "runwright=debug,runwright_lib=debug"
    } else {
        "runwright=info,runwright_lib=info"
    }
}

/// Per-user data directory. Falls back to the working directory on
/// platforms without one.
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Root under which new runs are created.
pub fn default_runs_root() -> PathBuf {
    data_dir().join("runs")
}

/// Shared result cache file (survives across runs).
pub fn default_cache_path() -> PathBuf {
    data_dir().join("cache.json")
}

/// The two inputs every stage needs when invoked on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvConfig {
    pub target: String,
    pub run_dir: PathBuf,
}

impl EnvConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary lookup; blank values count as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::MissingVar(key))
        };

        Ok(Self {
            target: get(ENV_TARGET)?,
            run_dir: PathBuf::from(get(ENV_RUN_DIR)?),
        })
    }
}
