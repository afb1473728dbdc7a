//! Configuration
//!
//! Two layers:
//! - `Config`: per-user settings in `~/.config/branch-fixer/config.json`
//!   (model, API endpoint). The API key itself lives in the keychain.
//! - `FixSettings`: per-project settings in `<repo>/.branch-fixer.toml`
//!   (retry budget, temperatures, timeouts, pytest invocation). CLI flags
//!   override them.

use crate::coordinator::{StepTimeouts, DEFAULT_GENERATION_TIMEOUT, DEFAULT_VERIFICATION_TIMEOUT};
use crate::error::ConfigError;
use crate::keyring;
use crate::retry::{
    RetryPolicy, DEFAULT_INITIAL_TEMPERATURE, DEFAULT_MAX_ATTEMPTS, DEFAULT_TEMPERATURE_INCREMENT,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_API_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4.5";
pub const SETTINGS_FILE: &str = ".branch-fixer.toml";
const API_KEY_ENV: &str = "OPENROUTER_API_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Model id sent to the chat completions endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// OpenAI-compatible API base, e.g. a local gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Config {
    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("branch-fixer"))
    }

    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load config from disk, or return default
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                preserve_corrupt_config(path, &content);
                warn!(
                    "config file was corrupted ({}); a backup was saved and defaults were loaded",
                    err
                );
                Self::default()
            }
        }
    }

    pub fn save(&self) -> Result<(), String> {
        let dir =
            Self::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
        self.save_to(&dir)
    }

    fn save_to(&self, dir: &Path) -> Result<(), String> {
        fs::create_dir_all(dir).map_err(|e| format!("Failed to create config directory: {}", e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o700)) {
                warn!("failed to set config directory permissions: {}", e);
            }
        }

        let path = dir.join("config.json");
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;
        write_config_atomic(&path, &content).map_err(|e| format!("Failed to write config: {}", e))
    }

    pub fn model(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    /// Chat completions URL for the configured base.
    pub fn chat_completions_url(&self) -> Result<url::Url, ConfigError> {
        let base = self.api_base_url.as_deref().unwrap_or(DEFAULT_API_BASE_URL);
        let invalid = |message: String| ConfigError::File {
            path: Self::config_location(),
            message,
        };
        let mut parsed =
            url::Url::parse(base).map_err(|e| invalid(format!("api_base_url: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(invalid(format!(
                "api_base_url must be http or https, got {}",
                parsed.scheme()
            )));
        }
        let path = format!("{}/chat/completions", parsed.path().trim_end_matches('/'));
        parsed.set_path(&path);
        Ok(parsed)
    }

    /// API key from the environment, then the keychain.
    pub fn get_api_key(&self) -> Option<String> {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.trim().is_empty() {
                return Some(key);
            }
        }
        match keyring::get_api_key() {
            Ok(key) => key,
            Err(err) => {
                keyring::warn_keychain_error_once("the API key", &err);
                None
            }
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.get_api_key().is_some()
    }

    pub fn validate_api_key_format(key: &str) -> bool {
        key.starts_with("sk-")
    }

    pub fn config_location() -> String {
        Self::config_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "~/.config/branch-fixer/config.json".to_string())
    }
}

/// Interactive prompt to store an API key in the keychain
pub fn setup_api_key_interactive() -> Result<String, String> {
    use std::io;

    println!();
    println!("  branch-fixer asks an OpenRouter-compatible model for fixes.");
    println!("  1. Get an API key at: https://openrouter.ai/keys");
    println!("  2. Paste it below (saved in your system keychain)");
    println!();
    print!("  API Key: ");
    io::stdout().flush().map_err(|e| e.to_string())?;

    let mut key = String::new();
    io::stdin().read_line(&mut key).map_err(|e| e.to_string())?;
    let key = key.trim().to_string();

    if key.is_empty() {
        return Err("No API key provided".to_string());
    }
    if !Config::validate_api_key_format(&key) {
        println!("  Warning: key doesn't look like an OpenRouter key (should start with sk-); saving anyway");
    }

    keyring::set_api_key(&key).map_err(|e| {
        format!(
            "Failed to store API key in system keychain: {}. Set {} instead.",
            e, API_KEY_ENV
        )
    })?;
    println!("  + API key saved to the system keychain");
    Ok(key)
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

fn write_config_atomic(path: &Path, content: &str) -> Result<(), String> {
    use std::fs::OpenOptions;

    let tmp_path = path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)
        .map_err(|e| e.to_string())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = file.set_permissions(fs::Permissions::from_mode(0o600)) {
            warn!("failed to set temp config file permissions: {}", e);
        }
    }

    file.write_all(content.as_bytes())
        .map_err(|e| e.to_string())?;

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.to_string());
    }
    Ok(())
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_initial_temperature() -> f64 {
    DEFAULT_INITIAL_TEMPERATURE
}

fn default_temperature_increment() -> f64 {
    DEFAULT_TEMPERATURE_INCREMENT
}

fn default_generation_timeout() -> u64 {
    DEFAULT_GENERATION_TIMEOUT.as_secs()
}

fn default_verification_timeout() -> u64 {
    DEFAULT_VERIFICATION_TIMEOUT.as_secs()
}

fn default_discovery_timeout() -> u64 {
    1_800
}

fn default_lanes() -> usize {
    1
}

fn default_pytest_program() -> String {
    "pytest".to_string()
}

/// Per-project settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_temperature")]
    pub initial_temperature: f64,
    #[serde(default = "default_temperature_increment")]
    pub temperature_increment: f64,
    #[serde(default = "default_generation_timeout")]
    pub generation_timeout_secs: u64,
    #[serde(default = "default_verification_timeout")]
    pub verification_timeout_secs: u64,
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_secs: u64,
    /// Different-file lanes run at once; forced to 1 with git isolation
    #[serde(default = "default_lanes")]
    pub lanes: usize,
    /// May include words, e.g. `python -m pytest`
    #[serde(default = "default_pytest_program")]
    pub pytest_program: String,
    #[serde(default)]
    pub pytest_args: Vec<String>,
}

impl Default for FixSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_temperature: default_initial_temperature(),
            temperature_increment: default_temperature_increment(),
            generation_timeout_secs: default_generation_timeout(),
            verification_timeout_secs: default_verification_timeout(),
            discovery_timeout_secs: default_discovery_timeout(),
            lanes: default_lanes(),
            pytest_program: default_pytest_program(),
            pytest_args: Vec::new(),
        }
    }
}

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub max_attempts: Option<u32>,
    pub initial_temperature: Option<f64>,
    pub temperature_increment: Option<f64>,
    pub lanes: Option<usize>,
}

impl FixSettings {
    /// Reads `<root>/.branch-fixer.toml`; a missing file gives defaults.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let path = root.join(SETTINGS_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ConfigError::File {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })
            }
        };
        toml::from_str(&content).map_err(|e| ConfigError::File {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    pub fn with_overrides(mut self, overrides: &SettingsOverrides) -> Self {
        if let Some(v) = overrides.max_attempts {
            self.max_attempts = v;
        }
        if let Some(v) = overrides.initial_temperature {
            self.initial_temperature = v;
        }
        if let Some(v) = overrides.temperature_increment {
            self.temperature_increment = v;
        }
        if let Some(v) = overrides.lanes {
            self.lanes = v;
        }
        self
    }

    /// Checks everything up front so nothing fails mid-session.
    pub fn validate(&self) -> Result<RetryPolicy, ConfigError> {
        let policy = self.retry_policy()?;
        if self.generation_timeout_secs == 0 {
            return Err(ConfigError::Timeout("generation"));
        }
        if self.verification_timeout_secs == 0 {
            return Err(ConfigError::Timeout("verification"));
        }
        if self.discovery_timeout_secs == 0 {
            return Err(ConfigError::Timeout("discovery"));
        }
        if self.lanes == 0 {
            return Err(ConfigError::Lanes);
        }
        Ok(policy)
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        RetryPolicy::new(
            self.initial_temperature,
            self.temperature_increment,
            self.max_attempts,
        )
    }

    pub fn step_timeouts(&self) -> StepTimeouts {
        StepTimeouts {
            generation: Duration::from_secs(self.generation_timeout_secs),
            verification: Duration::from_secs(self.verification_timeout_secs),
        }
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_settings_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = FixSettings::load(dir.path()).unwrap();
        assert_eq!(settings, FixSettings::default());
        assert_eq!(settings.max_attempts, 3);
        assert_eq!(settings.initial_temperature, 0.4);
        assert_eq!(settings.temperature_increment, 0.1);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_settings_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join(SETTINGS_FILE),
            "max_attempts = 5\npytest_program = \"python -m pytest\"\npytest_args = [\"-x\"]\n",
        )
        .unwrap();

        let settings = FixSettings::load(dir.path()).unwrap();
        assert_eq!(settings.max_attempts, 5);
        assert_eq!(settings.initial_temperature, 0.4);
        assert_eq!(settings.pytest_program, "python -m pytest");
        assert_eq!(settings.pytest_args, vec!["-x".to_string()]);
    }

    #[test]
    fn test_unknown_or_malformed_settings_are_config_errors() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(SETTINGS_FILE), "max_retries = 5\n").unwrap();
        assert!(matches!(
            FixSettings::load(dir.path()),
            Err(ConfigError::File { .. })
        ));

        fs::write(dir.path().join(SETTINGS_FILE), "max_attempts = \"many\"\n").unwrap();
        assert!(matches!(
            FixSettings::load(dir.path()),
            Err(ConfigError::File { .. })
        ));
    }

    #[test]
    fn test_overrides_win_and_are_validated() {
        let overrides = SettingsOverrides {
            max_attempts: Some(0),
            initial_temperature: Some(0.2),
            ..Default::default()
        };
        let settings = FixSettings::default().with_overrides(&overrides);
        assert_eq!(settings.initial_temperature, 0.2);
        assert_eq!(settings.validate(), Err(ConfigError::MaxAttempts));

        let overrides = SettingsOverrides {
            temperature_increment: Some(-1.0),
            ..Default::default()
        };
        let settings = FixSettings::default().with_overrides(&overrides);
        assert_eq!(settings.validate(), Err(ConfigError::Increment(-1.0)));
    }

    #[test]
    fn test_zero_timeouts_and_lanes_are_rejected() {
        let settings = FixSettings {
            verification_timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(
            settings.validate(),
            Err(ConfigError::Timeout("verification"))
        );

        let settings = FixSettings {
            lanes: 0,
            ..Default::default()
        };
        assert_eq!(settings.validate(), Err(ConfigError::Lanes));
    }

    #[test]
    fn test_chat_completions_url_joins_base() {
        let config = Config::default();
        assert_eq!(
            config.chat_completions_url().unwrap().as_str(),
            "https://openrouter.ai/api/v1/chat/completions"
        );

        let config = Config {
            api_base_url: Some("http://localhost:8080/v1/".to_string()),
            ..Default::default()
        };
        assert_eq!(
            config.chat_completions_url().unwrap().as_str(),
            "http://localhost:8080/v1/chat/completions"
        );

        let config = Config {
            api_base_url: Some("ftp://example.com".to_string()),
            ..Default::default()
        };
        assert!(config.chat_completions_url().is_err());
    }

    #[test]
    fn test_corrupt_config_is_preserved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let config = Config::load_from(&path);
        assert!(config.model.is_none());
        assert!(dir.path().join("config.json.corrupt").exists());
        assert!(!path.exists());
    }

    #[test]
    fn test_save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            model: Some("openai/gpt-4o".to_string()),
            ..Default::default()
        };
        config.save_to(dir.path()).unwrap();

        let loaded = Config::load_from(&dir.path().join("config.json"));
        assert_eq!(loaded.model(), "openai/gpt-4o");
    }
}
