use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};
use crate::lifecycle::RetryPolicy;
use crate::recovery::RecoveryPolicy;

const APP_NAME: &str = "crewledger";
const CONFIG_FILE: &str = "config.json";
const STATE_DIR: &str = ".maf";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "CREW_CONFIG";

/// Where the state document lives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// A single JSON document, replaced on every save.
    #[default]
    Json,
    /// SQLite tables, replaced inside one transaction per save.
    Sqlite,
}

impl StateBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Sqlite => "sqlite",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "sqlite" | "db" => Some(Self::Sqlite),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LedgerConfig {
    /// Failed attempts allowed before a task is permanently failed.
    pub max_retries: u32,
    /// Back-off after a monitor tick fails before the next attempt.
    pub retry_delay_secs: u64,
    pub stall_timeout_minutes: i64,
    pub long_running_minutes: i64,
    /// Retention window for completed and permanently failed tasks.
    pub cleanup_retention_days: u32,
    pub max_concurrent_tasks_per_agent: usize,
    pub health_check_interval_secs: u64,
    /// Run stall recovery and retries from the monitor loop.
    pub auto_recovery: bool,
    /// Run cleanup on every monitor tick, even when the system is healthy.
    pub auto_cleanup: bool,
    pub state_backend: StateBackend,
    /// Defaults to `.maf/state.json` or `.maf/state.db` by backend.
    pub state_path: Option<PathBuf>,
    /// Mailbox database for the JSON backend. Defaults to `.maf/mailbox.db`.
    pub mailbox_path: Option<PathBuf>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_secs: 5,
            stall_timeout_minutes: 30,
            long_running_minutes: 15,
            cleanup_retention_days: 7,
            max_concurrent_tasks_per_agent: 1,
            health_check_interval_secs: 60,
            auto_recovery: true,
            auto_cleanup: false,
            state_backend: StateBackend::Json,
            state_path: None,
            mailbox_path: None,
        }
    }
}

impl LedgerConfig {
    /// Defaults, then the config file, then `CREW_*` environment overrides.
    ///
    /// The file is `explicit` if given, else `$CREW_CONFIG`, else
    /// `config.json` in the user config directory. Only an explicitly named
    /// file is required to exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let named = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut config = match named {
            Some(path) => Self::from_file(&path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            LedgerError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| LedgerError::Config(format!("cannot parse {}: {}", path.display(), e)))
    }

    /// Apply `CREW_*` overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| LedgerError::Config(format!("{}={} is not valid", key, value)))
        }

        fn flag(key: &str, value: &str) -> Result<bool> {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(LedgerError::Config(format!("{}={} is not a boolean", key, value))),
            }
        }

        if let Some(v) = lookup("CREW_MAX_RETRIES") {
            self.max_retries = parse("CREW_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("CREW_RETRY_DELAY_SECS") {
            self.retry_delay_secs = parse("CREW_RETRY_DELAY_SECS", &v)?;
        }
        if let Some(v) = lookup("CREW_STALL_TIMEOUT_MINUTES") {
            self.stall_timeout_minutes = parse("CREW_STALL_TIMEOUT_MINUTES", &v)?;
        }
        if let Some(v) = lookup("CREW_LONG_RUNNING_MINUTES") {
            self.long_running_minutes = parse("CREW_LONG_RUNNING_MINUTES", &v)?;
        }
        if let Some(v) = lookup("CREW_RETENTION_DAYS") {
            self.cleanup_retention_days = parse("CREW_RETENTION_DAYS", &v)?;
        }
        if let Some(v) = lookup("CREW_MAX_CONCURRENT_TASKS") {
            self.max_concurrent_tasks_per_agent = parse("CREW_MAX_CONCURRENT_TASKS", &v)?;
        }
        if let Some(v) = lookup("CREW_HEALTH_CHECK_INTERVAL_SECS") {
            self.health_check_interval_secs = parse("CREW_HEALTH_CHECK_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("CREW_AUTO_RECOVERY") {
            self.auto_recovery = flag("CREW_AUTO_RECOVERY", &v)?;
        }
        if let Some(v) = lookup("CREW_AUTO_CLEANUP") {
            self.auto_cleanup = flag("CREW_AUTO_CLEANUP", &v)?;
        }
        if let Some(v) = lookup("CREW_STATE_BACKEND") {
            self.state_backend = StateBackend::from_str(&v).ok_or_else(|| {
                LedgerError::Config(format!("CREW_STATE_BACKEND={} is not json or sqlite", v))
            })?;
        }
        if let Some(v) = lookup("CREW_STATE_PATH") {
            self.state_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("CREW_MAILBOX_PATH") {
            self.mailbox_path = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.stall_timeout_minutes <= 0 {
            return Err(LedgerError::Config(
                "stall_timeout_minutes must be positive".to_string(),
            ));
        }
        if self.long_running_minutes < 0 || self.long_running_minutes >= self.stall_timeout_minutes
        {
            return Err(LedgerError::Config(format!(
                "long_running_minutes ({}) must be below stall_timeout_minutes ({})",
                self.long_running_minutes, self.stall_timeout_minutes
            )));
        }
        if self.max_concurrent_tasks_per_agent == 0 {
            return Err(LedgerError::Config(
                "max_concurrent_tasks_per_agent must be at least 1".to_string(),
            ));
        }
        if self.health_check_interval_secs == 0 {
            return Err(LedgerError::Config(
                "health_check_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_path.clone().unwrap_or_else(|| {
            let file = match self.state_backend {
                StateBackend::Json => "state.json",
                StateBackend::Sqlite => "state.db",
            };
            Path::new(STATE_DIR).join(file)
        })
    }

    pub fn mailbox_path(&self) -> PathBuf {
        self.mailbox_path
            .clone()
            .unwrap_or_else(|| Path::new(STATE_DIR).join("mailbox.db"))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
        }
    }

    pub fn recovery_policy(&self) -> RecoveryPolicy {
        RecoveryPolicy {
            stall_timeout_minutes: self.stall_timeout_minutes,
            long_running_minutes: self.long_running_minutes,
            max_retries: self.max_retries,
            retention_days: self.cleanup_retention_days,
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().join(CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = LedgerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.state_path(), PathBuf::from(".maf/state.json"));
        assert_eq!(config.recovery_policy(), RecoveryPolicy::default());
    }

    #[test]
    fn test_file_values_with_missing_fields_defaulted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"max_retries": 5, "state_backend": "sqlite"}"#).unwrap();

        let config = LedgerConfig::from_file(&path).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.stall_timeout_minutes, 30);
        assert_eq!(config.state_path(), PathBuf::from(".maf/state.db"));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = LedgerConfig {
            max_retries: 5,
            ..Default::default()
        };
        config
            .apply_env(env(&[
                ("CREW_MAX_RETRIES", "2"),
                ("CREW_AUTO_CLEANUP", "yes"),
                ("CREW_STATE_PATH", "/tmp/crew/state.json"),
            ]))
            .unwrap();

        assert_eq!(config.max_retries, 2);
        assert!(config.auto_cleanup);
        assert_eq!(config.state_path(), PathBuf::from("/tmp/crew/state.json"));
    }

    #[test]
    fn test_bad_env_value_is_config_error() {
        let mut config = LedgerConfig::default();
        let err = config
            .apply_env(env(&[("CREW_STALL_TIMEOUT_MINUTES", "soon")]))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Config(_)));
    }

    #[test]
    fn test_long_running_must_be_below_stall_timeout() {
        let config = LedgerConfig {
            long_running_minutes: 30,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let err = LedgerConfig::load(Some(&dir.path().join("nope.json"))).unwrap_err();
        assert!(matches!(err, LedgerError::Config(_)));
    }
}
