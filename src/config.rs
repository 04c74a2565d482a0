use anyhow::{bail, Context, Result};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::scheduler::WINDOW_MINUTES;

pub const DEFAULT_RULES_PATH: &str = "channels.json";
pub const DEFAULT_CACHE_PATH: &str = ".cache.json";
pub const DEFAULT_NOTIFY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_POLL_SECS: u64 = 300;

/// Upper bound for a single delivery attempt
pub const MAX_NOTIFY_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct Config {
    // Rules file (JSON array of rules)
    pub rules_path: PathBuf,

    // Dedupe store (JSON object of key -> last-sent millis)
    pub cache_path: PathBuf,

    // Delivery hook; required unless running --dry-run or --preview
    pub notify_command: Option<String>,
    pub notify_timeout_secs: u64,

    // Maximum sleep between checks in --watch mode; must stay under the window
    pub poll_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env if present, ignore if missing
        Self::from_getter(|key| env::var(key).ok())
    }

    /// Parse config from a custom getter function (for testing)
    pub fn from_getter<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Config {
            rules_path: get("DUSKBELL_RULES")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_RULES_PATH.to_string())
                .into(),
            cache_path: get("DUSKBELL_CACHE")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_CACHE_PATH.to_string())
                .into(),

            notify_command: get("DUSKBELL_NOTIFY_CMD").filter(|s| !s.trim().is_empty()),
            notify_timeout_secs: match get("DUSKBELL_NOTIFY_TIMEOUT_SECS").filter(|s| !s.trim().is_empty()) {
                Some(s) => s
                    .trim()
                    .parse()
                    .context("DUSKBELL_NOTIFY_TIMEOUT_SECS must be a whole number of seconds")?,
                None => DEFAULT_NOTIFY_TIMEOUT_SECS,
            },

            poll_secs: match get("DUSKBELL_POLL_SECS").filter(|s| !s.trim().is_empty()) {
                Some(s) => s
                    .trim()
                    .parse()
                    .context("DUSKBELL_POLL_SECS must be a whole number of seconds")?,
                None => DEFAULT_POLL_SECS,
            },
        })
    }

    /// Create config from a HashMap (convenience for testing)
    #[cfg(test)]
    pub fn from_map(map: &std::collections::HashMap<&str, &str>) -> Result<Self> {
        Self::from_getter(|key| map.get(key).map(|v| v.to_string()))
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }

    /// Validate configuration values at startup.
    /// Returns Ok(()) if all validations pass, or Err with details of what failed.
    pub fn validate(&self, needs_notifier: bool) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if !Path::new(&self.rules_path).is_file() {
            errors.push(format!(
                "Rules file not found at '{}'. Set DUSKBELL_RULES.",
                self.rules_path.display()
            ));
        }

        if needs_notifier && self.notify_command.is_none() {
            errors.push("DUSKBELL_NOTIFY_CMD not set (use --dry-run to only log messages).".to_string());
        }

        if self.notify_timeout_secs == 0 {
            errors.push("DUSKBELL_NOTIFY_TIMEOUT_SECS must be greater than 0.".to_string());
        } else if self.notify_timeout_secs > MAX_NOTIFY_TIMEOUT_SECS {
            errors.push(format!(
                "DUSKBELL_NOTIFY_TIMEOUT_SECS={} seems too long (max: {}).",
                self.notify_timeout_secs, MAX_NOTIFY_TIMEOUT_SECS
            ));
        }

        // A poll interval at or beyond the window could sleep straight past it
        let window_secs = WINDOW_MINUTES as u64 * 60;
        if self.poll_secs == 0 {
            errors.push("DUSKBELL_POLL_SECS must be greater than 0.".to_string());
        } else if self.poll_secs >= window_secs {
            errors.push(format!(
                "DUSKBELL_POLL_SECS={} must be shorter than the {}s schedule window.",
                self.poll_secs, window_secs
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn rules_file() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "[]").unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_map(&HashMap::new()).expect("empty env should parse");
        assert_eq!(config.rules_path, PathBuf::from("channels.json"));
        assert_eq!(config.cache_path, PathBuf::from(".cache.json"));
        assert_eq!(config.notify_command, None);
        assert_eq!(config.notify_timeout_secs, 30);
        assert_eq!(config.poll_secs, 300);
    }

    #[test]
    fn test_custom_values() {
        let mut env = HashMap::new();
        env.insert("DUSKBELL_RULES", "/etc/duskbell/rules.json");
        env.insert("DUSKBELL_CACHE", "/var/lib/duskbell/cache.json");
        env.insert("DUSKBELL_NOTIFY_CMD", "/usr/local/bin/send-telegram");
        env.insert("DUSKBELL_NOTIFY_TIMEOUT_SECS", "10");
        env.insert("DUSKBELL_POLL_SECS", " 120 ");
        let config = Config::from_map(&env).expect("should parse");
        assert_eq!(config.rules_path, PathBuf::from("/etc/duskbell/rules.json"));
        assert_eq!(config.notify_command.as_deref(), Some("/usr/local/bin/send-telegram"));
        assert_eq!(config.notify_timeout(), Duration::from_secs(10));
        assert_eq!(config.poll_interval(), Duration::from_secs(120));
    }

    #[test]
    fn test_empty_values_use_defaults() {
        let mut env = HashMap::new();
        env.insert("DUSKBELL_RULES", "  ");
        env.insert("DUSKBELL_NOTIFY_CMD", "");
        env.insert("DUSKBELL_POLL_SECS", "");
        let config = Config::from_map(&env).expect("should parse");
        assert_eq!(config.rules_path, PathBuf::from("channels.json"));
        assert_eq!(config.notify_command, None);
        assert_eq!(config.poll_secs, DEFAULT_POLL_SECS);
    }

    #[test]
    fn test_invalid_numbers() {
        for key in ["DUSKBELL_NOTIFY_TIMEOUT_SECS", "DUSKBELL_POLL_SECS"] {
            let mut env = HashMap::new();
            env.insert(key, "soon");
            let err = Config::from_map(&env).unwrap_err().to_string();
            assert!(err.contains(key), "error should mention {}: {}", key, err);
        }
    }

    #[test]
    fn test_validation_passes() {
        let file = rules_file();
        let path = file.path().to_string_lossy().into_owned();
        let mut env = HashMap::new();
        env.insert("DUSKBELL_RULES", path.as_str());
        env.insert("DUSKBELL_NOTIFY_CMD", "true");
        let config = Config::from_map(&env).unwrap();
        assert!(config.validate(true).is_ok());
    }

    #[test]
    fn test_validation_missing_rules_file() {
        let mut env = HashMap::new();
        env.insert("DUSKBELL_RULES", "/nonexistent/rules.json");
        let config = Config::from_map(&env).unwrap();
        let err = config.validate(false).unwrap_err().to_string();
        assert!(err.contains("Rules file not found"), "{}", err);
    }

    #[test]
    fn test_validation_requires_notifier_only_when_sending() {
        let file = rules_file();
        let path = file.path().to_string_lossy().into_owned();
        let mut env = HashMap::new();
        env.insert("DUSKBELL_RULES", path.as_str());
        let config = Config::from_map(&env).unwrap();
        assert!(config.validate(false).is_ok());
        let err = config.validate(true).unwrap_err().to_string();
        assert!(err.contains("DUSKBELL_NOTIFY_CMD"), "{}", err);
    }

    #[test]
    fn test_validation_poll_must_fit_window() {
        let file = rules_file();
        let path = file.path().to_string_lossy().into_owned();
        for (poll, ok) in [("0", false), ("1", true), ("899", true), ("900", false), ("3600", false)] {
            let mut env = HashMap::new();
            env.insert("DUSKBELL_RULES", path.as_str());
            env.insert("DUSKBELL_POLL_SECS", poll);
            let config = Config::from_map(&env).unwrap();
            assert_eq!(config.validate(false).is_ok(), ok, "poll={}", poll);
        }
    }

    #[test]
    fn test_validation_timeout_bounds() {
        let file = rules_file();
        let path = file.path().to_string_lossy().into_owned();
        for (timeout, ok) in [("0", false), ("1", true), ("300", true), ("301", false)] {
            let mut env = HashMap::new();
            env.insert("DUSKBELL_RULES", path.as_str());
            env.insert("DUSKBELL_NOTIFY_TIMEOUT_SECS", timeout);
            let config = Config::from_map(&env).unwrap();
            assert_eq!(config.validate(false).is_ok(), ok, "timeout={}", timeout);
        }
    }

    #[test]
    fn test_validation_reports_all_errors() {
        let mut env = HashMap::new();
        env.insert("DUSKBELL_RULES", "/nonexistent/rules.json");
        env.insert("DUSKBELL_POLL_SECS", "0");
        env.insert("DUSKBELL_NOTIFY_TIMEOUT_SECS", "0");
        let config = Config::from_map(&env).unwrap();
        let err = config.validate(true).unwrap_err().to_string();
        assert_eq!(err.matches("\n  - ").count(), 4, "{}", err);
    }
}
