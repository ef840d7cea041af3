use std::env;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::concurrency::Concurrency;

pub const DEFAULT_MAX_DISPATCH_DEPTH: usize = 64;
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Agent tuning. Every field has a default, so an empty TOML file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentConfig {
    /// Maximum nesting of `process` calls on one thread (handlers dispatching
    /// from inside handlers).
    pub max_dispatch_depth: usize,
    /// Policy for on-handlers registered without an explicit one.
    pub default_concurrency: Concurrency,
    /// Buffer size of the lifecycle event channel. Slow receivers lag.
    pub event_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_dispatch_depth: DEFAULT_MAX_DISPATCH_DEPTH,
            default_concurrency: Concurrency::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key} has invalid value `{value}`: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("{key} must be greater than zero")]
    Zero { key: &'static str },
}

impl AgentConfig {
    /// Load overrides from `ACTIONFLOW_*` environment variables on top of
    /// the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Like [`AgentConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(depth) = parse_var(&lookup, "ACTIONFLOW_MAX_DEPTH")? {
            config.max_dispatch_depth = depth;
        }
        if let Some(policy) = parse_var(&lookup, "ACTIONFLOW_DEFAULT_CONCURRENCY")? {
            config.default_concurrency = policy;
        }
        if let Some(capacity) = parse_var(&lookup, "ACTIONFLOW_EVENT_CAPACITY")? {
            config.event_capacity = capacity;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_dispatch_depth == 0 {
            return Err(ConfigError::Zero {
                key: "max_dispatch_depth",
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Zero {
                key: "event_capacity",
            });
        }
        Ok(())
    }

    pub fn with_max_dispatch_depth(mut self, depth: usize) -> Self {
        self.max_dispatch_depth = depth;
        self
    }

    pub fn with_default_concurrency(mut self, policy: Concurrency) -> Self {
        self.default_concurrency = policy;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        })
}

/// Load and validate a TOML agent config file.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: AgentConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config file: {}", path.display()))?;
    Ok(config)
}
