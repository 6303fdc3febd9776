use crate::fetch::DEFAULT_API_URL;
use crate::process::ProcessCommand;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_DATABASE: &str = "Crypto.db";
pub const DEFAULT_LOG_FILE: &str = "log.txt";
pub const DEFAULT_CURRENCY: &str = "usd";
pub const DEFAULT_ANALYSIS: &str = "python3 Analysis.py";
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TICK_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct Settings {
    pub db_path: String,
    pub log_path: PathBuf,
    pub api_url: String,
    pub currency: String,
    pub http_timeout: Duration,
    pub tick: Duration,
    pub analysis: ProcessCommand,
    pub frontend: Option<ProcessCommand>,
}

impl Settings {
    /// Reads `COINWATCH_*` variables, falling back to `.env` and then to defaults.
    pub fn from_env() -> Result<Settings, ConfigError> {
        Self::from_lookup(|key| dotenv::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Settings, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let text = |key: &str, default: &str| {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let seconds = |key: &str, default: u64| -> Result<Duration, ConfigError> {
            match lookup(key) {
                Some(value) => value
                    .trim()
                    .parse()
                    .map(Duration::from_secs)
                    .map_err(|_| ConfigError::InvalidNumber {
                        key: key.to_string(),
                        value,
                    }),
                None => Ok(Duration::from_secs(default)),
            }
        };

        let analysis = ProcessCommand::parse(&text("COINWATCH_ANALYSIS", DEFAULT_ANALYSIS))
            .ok_or_else(|| ConfigError::EmptyCommand("COINWATCH_ANALYSIS".to_string()))?;
        let frontend = lookup("COINWATCH_FRONTEND").and_then(|line| ProcessCommand::parse(&line));

        Ok(Settings {
            db_path: text("COINWATCH_DATABASE", DEFAULT_DATABASE),
            log_path: PathBuf::from(text("COINWATCH_LOG_FILE", DEFAULT_LOG_FILE)),
            api_url: text("COINWATCH_API_URL", DEFAULT_API_URL),
            currency: text("COINWATCH_CURRENCY", DEFAULT_CURRENCY).to_lowercase(),
            http_timeout: seconds("COINWATCH_HTTP_TIMEOUT", DEFAULT_HTTP_TIMEOUT_SECS)?,
            tick: seconds("COINWATCH_TICK", DEFAULT_TICK_SECS)?,
            analysis,
            frontend,
        })
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidNumber { key: String, value: String },
    EmptyCommand(String),
}

impl std::error::Error for ConfigError {}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidNumber { key, value } => {
                write!(f, "{} must be a whole number of seconds, got '{}'", key, value)
            }
            ConfigError::EmptyCommand(key) => write!(f, "{} is set but empty", key),
        }
    }
}
