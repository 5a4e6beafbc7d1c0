//! Loading the probe module file and resolving a module by name.

use std::path::PathBuf;

use thiserror::Error;

use super::probe_config::{Config, Module};
use crate::error::ProbeError;

/// Module used when the caller does not name one.
pub const DEFAULT_MODULE: &str = "http_2xx";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("error reading config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("error parsing config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Source of the probe module file. Called once per invocation.
pub trait ConfigLoader: Send + Sync {
    fn load(&self) -> Result<Config, ConfigError>;
}

/// Reads and parses a YAML module file on every call.
#[derive(Debug, Clone)]
pub struct FileConfigLoader {
    path: PathBuf,
}

impl FileConfigLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigLoader for FileConfigLoader {
    fn load(&self) -> Result<Config, ConfigError> {
        let config_str = std::fs::read_to_string(&self.path).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(serde_yaml::from_str(&config_str)?)
    }
}

/// An already parsed module set, handed out as a fresh copy on every call.
impl ConfigLoader for Config {
    fn load(&self) -> Result<Config, ConfigError> {
        Ok(self.clone())
    }
}

/// Looks up `name` in the loaded modules, using [`DEFAULT_MODULE`] when `name` is empty.
pub fn resolve_module(config: &Config, name: &str) -> Result<Module, ProbeError> {
    let name = if name.is_empty() { DEFAULT_MODULE } else { name };
    config
        .modules
        .get(name)
        .cloned()
        .ok_or_else(|| ProbeError::ConfigNotFound(name.to_string()))
}
