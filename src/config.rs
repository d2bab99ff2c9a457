//! Bridge configuration, loaded from `native-bridge.toml`
//!
//! Every section and key is optional; missing values take their defaults.
//! Environment variables override the file:
//! - `NATIVE_BRIDGE_MAX_ARGS`
//! - `NATIVE_BRIDGE_CIF_CACHE` (capacity, `0` disables caching)
//! - `NATIVE_BRIDGE_SLOTS_PER_CHUNK`
//! - `NATIVE_BRIDGE_RECYCLE_SLOTS`
//! - `NATIVE_BRIDGE_SLOT_QUARANTINE`
//! - the `NATIVE_BRIDGE_LOG_*` variables read by [`crate::logging`]

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::logging::{self, LogConfig};

/// File name searched for by [`BridgeConfig::discover`]
pub const CONFIG_FILE_NAME: &str = "native-bridge.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub callbacks: CallbackConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Upper bound on arguments per native call
    #[serde(default = "default_max_args")]
    pub max_args: usize,

    #[serde(default = "default_true")]
    pub cache_signatures: bool,

    #[serde(default = "default_cif_cache_capacity")]
    pub cif_cache_capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackConfig {
    /// Trampoline slots allocated per arena chunk; one page worth when unset
    #[serde(default)]
    pub slots_per_chunk: Option<usize>,

    /// Reuse idle slots of released callbacks
    #[serde(default = "default_true")]
    pub recycle_released: bool,

    /// Most recently released slots kept out of reuse
    #[serde(default = "default_release_quarantine")]
    pub release_quarantine: usize,

    /// Method invoked on targets registered without an explicit method
    #[serde(default = "default_method_name")]
    pub method_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default = "default_false")]
    pub json: bool,

    #[serde(default)]
    pub file: Option<String>,

    #[serde(default = "default_false")]
    pub spans: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_args: default_max_args(),
            cache_signatures: true,
            cif_cache_capacity: default_cif_cache_capacity(),
        }
    }
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            slots_per_chunk: None,
            recycle_released: true,
            release_quarantine: default_release_quarantine(),
            method_name: default_method_name(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            file: None,
            spans: false,
        }
    }
}

fn default_true() -> bool { true }
fn default_false() -> bool { false }
fn default_max_args() -> usize { 32 }
fn default_cif_cache_capacity() -> usize { 1024 }
fn default_release_quarantine() -> usize { crate::callback::DEFAULT_RELEASE_QUARANTINE }
fn default_method_name() -> String { "callback".to_string() }
fn default_level() -> String { "info".to_string() }

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Find the nearest `native-bridge.toml` from `start` upwards
    pub fn find_file(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .map(|dir| dir.join(CONFIG_FILE_NAME))
            .find(|candidate| candidate.is_file())
    }

    /// Load the nearest config file from the current directory upwards
    ///
    /// Falls back to defaults when there is none or it cannot be read.
    pub fn discover() -> Self {
        let found = std::env::current_dir().ok().and_then(|dir| Self::find_file(&dir));
        match found {
            Some(path) => Self::load(&path).unwrap_or_else(|err| {
                tracing::warn!(event = "config_rejected", path = %path.display(), error = %err, "Using defaults");
                Self::default()
            }),
            None => Self::default(),
        }
    }

    /// Discovered configuration with environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::discover();
        config.apply_env_with(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides looked up through `var`
    pub fn apply_env_with(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(value) = var("NATIVE_BRIDGE_MAX_ARGS") {
            self.dispatch.max_args = parse_number("NATIVE_BRIDGE_MAX_ARGS", &value)?;
        }
        if let Some(value) = var("NATIVE_BRIDGE_CIF_CACHE") {
            let capacity = parse_number("NATIVE_BRIDGE_CIF_CACHE", &value)?;
            self.dispatch.cache_signatures = capacity > 0;
            if capacity > 0 {
                self.dispatch.cif_cache_capacity = capacity;
            }
        }
        if let Some(value) = var("NATIVE_BRIDGE_SLOTS_PER_CHUNK") {
            self.callbacks.slots_per_chunk = Some(parse_number("NATIVE_BRIDGE_SLOTS_PER_CHUNK", &value)?);
        }
        if let Some(value) = var("NATIVE_BRIDGE_RECYCLE_SLOTS") {
            self.callbacks.recycle_released = parse_flag("NATIVE_BRIDGE_RECYCLE_SLOTS", &value)?;
        }
        if let Some(value) = var("NATIVE_BRIDGE_SLOT_QUARANTINE") {
            self.callbacks.release_quarantine = parse_number("NATIVE_BRIDGE_SLOT_QUARANTINE", &value)?;
        }
        if let Some(value) = var("NATIVE_BRIDGE_LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Some(value) = var("NATIVE_BRIDGE_LOG_FILE") {
            self.logging.file = Some(value);
        }
        if var("NATIVE_BRIDGE_LOG_JSON").is_some() {
            self.logging.json = true;
        }
        if var("NATIVE_BRIDGE_LOG_SPANS").is_some() {
            self.logging.spans = true;
        }
        self.validate()
    }

    /// Reject values the bridge cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatch.max_args == 0 {
            return Err(invalid("dispatch.max_args", "0"));
        }
        if self.dispatch.cache_signatures && self.dispatch.cif_cache_capacity == 0 {
            return Err(invalid("dispatch.cif_cache_capacity", "0"));
        }
        if self.callbacks.slots_per_chunk == Some(0) {
            return Err(invalid("callbacks.slots_per_chunk", "0"));
        }
        if self.callbacks.method_name.is_empty() {
            return Err(invalid("callbacks.method_name", "\"\""));
        }
        if logging::parse_level(&self.logging.level).is_none() {
            return Err(invalid("logging.level", &self.logging.level));
        }
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Logging section as a [`LogConfig`]
    pub fn log_config(&self) -> LogConfig {
        let defaults = LogConfig::default();
        LogConfig {
            level: logging::parse_level(&self.logging.level).unwrap_or(defaults.level),
            log_path: self.logging.file.clone(),
            json_format: self.logging.json,
            show_spans: self.logging.spans,
        }
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse().map_err(|_| invalid(key, value))
}

fn parse_flag(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}
