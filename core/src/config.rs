//! Configuration loading and validation.
//!
//! Configuration comes from an optional TOML file, then environment
//! overrides:
//! - `SANDBOX_COMMANDS_ROOT` - storage namespace root inside the sandbox
//! - `SANDBOX_COMMANDS_POLL_MS` - log tail poll interval in milliseconds
//! - `SANDBOX_COMMANDS_BACKGROUND` - `local` or `delegated`

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::store::DEFAULT_ROOT;

/// Environment variable overriding [`Config::root`].
pub const ENV_ROOT: &str = "SANDBOX_COMMANDS_ROOT";
/// Environment variable overriding [`Config::poll_interval_ms`].
pub const ENV_POLL_MS: &str = "SANDBOX_COMMANDS_POLL_MS";
/// Environment variable overriding [`Config::background_mode`].
pub const ENV_BACKGROUND: &str = "SANDBOX_COMMANDS_BACKGROUND";

/// How background commands are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackgroundMode {
    /// Start the process inside the sandbox and reap it in-process.
    #[default]
    Local,
    /// Hand the command to an external task dispatcher.
    Delegated,
}

impl std::str::FromStr for BackgroundMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "delegated" => Ok(Self::Delegated),
            other => Err(Error::Config(format!("unknown background mode '{}'", other))),
        }
    }
}

/// Crate configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Storage namespace root inside the sandbox.
    #[serde(default = "default_root")]
    pub root: String,

    /// Log tail poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Background execution strategy.
    #[serde(default)]
    pub background_mode: BackgroundMode,
}

fn default_root() -> String {
    DEFAULT_ROOT.to_string()
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: default_root(),
            poll_interval_ms: default_poll_interval_ms(),
            background_mode: BackgroundMode::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `path` if given, otherwise defaults, then
    /// applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env()
    }

    /// Parses configuration from TOML.
    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(format!("invalid config: {}", e)))
    }

    /// Applies environment overrides.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(root) = get(ENV_ROOT) {
            self.root = root;
        }
        if let Some(ms) = get(ENV_POLL_MS) {
            self.poll_interval_ms = ms
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("{} must be an integer, got '{}'", ENV_POLL_MS, ms)))?;
        }
        if let Some(mode) = get(ENV_BACKGROUND) {
            self.background_mode = mode.parse()?;
        }
        Ok(self)
    }

    /// Returns the tail poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Errors and warnings collected while validating a [`Config`].
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Fatal issues.
    pub errors: Vec<String>,
    /// Non-fatal issues.
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// No errors were reported.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Records a fatal problem.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Records a non-fatal problem.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Returns the warnings, or a `Config` error joining every error.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Configuration that can check itself before use.
pub trait Validate {
    /// Collects every problem instead of stopping at the first.
    fn validate(&self) -> ValidationResult;
}

impl Validate for Config {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.root.trim().is_empty() {
            result.add_error("root cannot be empty");
        } else if !self.root.starts_with('/') {
            result.add_error(format!("root '{}' must be an absolute path", self.root));
        }

        if self.poll_interval_ms == 0 {
            result.add_error("poll_interval_ms must be greater than zero");
        } else if self.poll_interval_ms < 50 {
            result.add_warning("poll_interval_ms under 50 hammers the sandbox filesystem");
        } else if self.poll_interval_ms > 10_000 {
            result.add_warning("poll_interval_ms over 10s makes log tails feel stalled");
        }

        result
    }
}
