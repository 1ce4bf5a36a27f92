//! Configuration loader and validator for the GitHub stars bot.
use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::model::MIN_MONITOR_INTERVAL_SECS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Top-level YAML document. `github`, `digest` and `gemini` may be omitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub telegram: Telegram,
    #[serde(default)]
    pub github: GitHub,
    #[serde(default)]
    pub digest: Digest,
    #[serde(default)]
    pub gemini: Option<Gemini>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Used until an interval is stored with `/setinterval`.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_seconds: u64,
    #[serde(default = "default_send_delay")]
    pub send_delay_ms: u64,
    #[serde(default = "default_error_backoff")]
    pub error_backoff_seconds: u64,
}

/// Telegram bot settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    pub bot_token: String,
    pub owner_user_id: i64,
}

/// GitHub REST API settings. The token itself lives in the database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitHub {
    pub api_base: String,
    pub request_timeout_seconds: u64,
    pub fast_cache_ttl_seconds: u64,
    pub star_page_size: u32,
}

impl Default for GitHub {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com/".into(),
            request_timeout_seconds: 30,
            fast_cache_ttl_seconds: 60,
            star_page_size: 50,
        }
    }
}

/// Wall-clock digest triggers, evaluated at a fixed UTC offset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Digest {
    pub hour: u32,
    pub minute: u32,
    pub weekday: Weekday,
    pub utc_offset_hours: i32,
}

impl Default for Digest {
    fn default() -> Self {
        Self {
            hour: 21,
            minute: 0,
            weekday: Weekday::Sun,
            utc_offset_hours: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Gemini {
    pub api_key: String,
    #[serde(default = "default_gemini_model")]
    pub model: String,
}

fn default_monitor_interval() -> u64 {
    300
}

fn default_send_delay() -> u64 {
    2000
}

fn default_error_backoff() -> u64 {
    60
}

fn default_gemini_model() -> String {
    "gemini-2.5-flash".into()
}

impl Config {
    /// Create `app.data_dir` so the SQLite file can be opened.
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// `DATABASE_URL` wins; otherwise a file under `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/starbot.db", self.app.data_dir))
    }
}

/// Read, parse and validate the config file (`./config.yaml` when `path` is None).
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.monitor_interval_seconds < MIN_MONITOR_INTERVAL_SECS {
        return Err(ConfigError::Invalid(
            "app.monitor_interval_seconds must be >= 60",
        ));
    }
    if cfg.app.error_backoff_seconds == 0 {
        return Err(ConfigError::Invalid("app.error_backoff_seconds must be > 0"));
    }

    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid("telegram.bot_token must be non-empty"));
    }
    // 0 would lock everybody out, including the owner.
    if cfg.telegram.owner_user_id == 0 {
        return Err(ConfigError::Invalid("telegram.owner_user_id must be set"));
    }

    if reqwest::Url::parse(&cfg.github.api_base).is_err() {
        return Err(ConfigError::Invalid("github.api_base must be a valid URL"));
    }
    if cfg.github.request_timeout_seconds == 0 {
        return Err(ConfigError::Invalid(
            "github.request_timeout_seconds must be > 0",
        ));
    }
    if !(1..=100).contains(&cfg.github.star_page_size) {
        return Err(ConfigError::Invalid(
            "github.star_page_size must be between 1 and 100",
        ));
    }

    if cfg.digest.hour > 23 || cfg.digest.minute > 59 {
        return Err(ConfigError::Invalid("digest.hour/minute out of range"));
    }
    if !(-12..=14).contains(&cfg.digest.utc_offset_hours) {
        return Err(ConfigError::Invalid(
            "digest.utc_offset_hours must be between -12 and 14",
        ));
    }

    if let Some(gemini) = &cfg.gemini {
        if gemini.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid("gemini.api_key must be non-empty"));
        }
    }

    Ok(())
}

/// Returns the example YAML content shipped with the bot.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  monitor_interval_seconds: 300
  send_delay_ms: 2000
  error_backoff_seconds: 60

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  owner_user_id: 123456789

github:
  api_base: "https://api.github.com/"
  request_timeout_seconds: 30
  fast_cache_ttl_seconds: 60
  star_page_size: 50

digest:
  hour: 21
  minute: 0
  weekday: "Sun"
  utc_offset_hours: 3

gemini:
  api_key: "YOUR_GEMINI_API_KEY"
  model: "gemini-2.5-flash"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.digest.weekday, Weekday::Sun);
        assert!(cfg.gemini.is_some());
    }

    #[test]
    fn optional_sections_default() {
        let yaml = r#"app:
  data_dir: "./data"
telegram:
  bot_token: "t"
  owner_user_id: 1
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.app.monitor_interval_seconds, 300);
        assert_eq!(cfg.github, GitHub::default());
        assert_eq!(cfg.digest.hour, 21);
        assert!(cfg.gemini.is_none());
    }

    fn rejected_field(mutate: impl FnOnce(&mut Config)) -> &'static str {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        mutate(&mut cfg);
        match validate(&cfg) {
            Err(ConfigError::Invalid(msg)) => msg,
            other => panic!("expected invalid config, got {:?}", other),
        }
    }

    #[test]
    fn invalid_fields_are_named() {
        let msg = rejected_field(|c| c.telegram.bot_token = " ".into());
        assert!(msg.contains("telegram.bot_token"));
        let msg = rejected_field(|c| c.telegram.owner_user_id = 0);
        assert!(msg.contains("owner_user_id"));
        let msg = rejected_field(|c| c.app.monitor_interval_seconds = 10);
        assert!(msg.contains("monitor_interval"));
    }

    #[test]
    fn github_and_digest_ranges() {
        rejected_field(|c| c.github.star_page_size = 0);
        rejected_field(|c| c.github.api_base = "not a url".into());
        rejected_field(|c| c.digest.hour = 24);
        rejected_field(|c| c.digest.utc_offset_hours = 20);
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("state").join("db");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = nested.display().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(nested.is_dir());
    }

    #[test]
    fn load_from_file_ok() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("starbot.yaml");
        fs::write(&path, example()).unwrap();
        let cfg = load(Some(&path)).unwrap();
        assert_eq!(cfg.telegram.owner_user_id, 123456789);
    }
}
