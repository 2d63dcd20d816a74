//! Run configuration.
//!
//! A [`Config`] is built once per process by overlaying, in increasing
//! priority, built-in defaults, a config file and command-line overrides.
//! Overlay replaces a key's whole value; nested maps are never merged.
//! Once [`Config::lock`] has been called every write fails with
//! [`ConfigError::Immutable`].
//!
//! # Snapshot Layout
//!
//! ```text
//! {base_work_dir}/localconfig.json   # key-sorted, pretty-printed dump
//! ```

pub mod overrides;
pub mod settings;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub use overrides::{Overrides, parse_value};
pub use settings::{Dirs, LogType, Settings};

/// Key-sorted configuration mapping.
pub type ConfigMap = BTreeMap<String, Value>;

/// Errors raised while building, reading or writing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("missing required config key(s): {}", .0.join(", "))]
  MissingKeys(Vec<String>),

  #[error("config is locked; refusing to set '{key}'")]
  Immutable { key: String },

  #[error("failed to read config file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse config file {path}: {message}")]
  Parse { path: PathBuf, message: String },

  #[error("config file {0} must contain a mapping at the top level")]
  NotAMapping(PathBuf),

  #[error("unsupported config file format: {0}")]
  UnsupportedFormat(PathBuf),

  #[error("failed to write config snapshot {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to serialize config: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("invalid value for '{key}': expected {expected}")]
  InvalidValue { key: String, expected: String },

  #[error("invalid override '{0}': expected KEY=VALUE")]
  InvalidOverride(String),
}

/// The run's parameter set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
  values: ConfigMap,
  locked: bool,
}

impl Config {
  /// Overlay `defaults < file < overrides` and check that every key in
  /// `required` is present afterwards.
  ///
  /// The returned config is still writable; call [`Config::lock`] once any
  /// script-specific adjustments are done.
  pub fn build(
    defaults: ConfigMap,
    file: Option<ConfigMap>,
    overrides: Option<ConfigMap>,
    required: &[&str],
  ) -> Result<Self, ConfigError> {
    let mut values = defaults;
    for layer in [file, overrides].into_iter().flatten() {
      for (key, value) in layer {
        values.insert(key, value);
      }
    }

    let missing: Vec<String> = required
      .iter()
      .filter(|key| !values.contains_key(**key))
      .map(|key| key.to_string())
      .collect();
    if !missing.is_empty() {
      return Err(ConfigError::MissingKeys(missing));
    }

    debug!(keys = values.len(), "built config");
    Ok(Self { values, locked: false })
  }

  /// Build a config straight from a mapping (no required keys).
  pub fn from_map(values: ConfigMap) -> Self {
    Self { values, locked: false }
  }

  /// Freeze the config. Idempotent.
  pub fn lock(&mut self) {
    self.locked = true;
  }

  pub fn is_locked(&self) -> bool {
    self.locked
  }

  /// Set a key. Fails once the config is locked.
  pub fn set(&mut self, key: impl Into<String>, value: Value) -> Result<(), ConfigError> {
    let key = key.into();
    if self.locked {
      return Err(ConfigError::Immutable { key });
    }
    self.values.insert(key, value);
    Ok(())
  }

  pub fn get(&self, key: &str) -> Option<&Value> {
    self.values.get(key)
  }

  pub fn contains(&self, key: &str) -> bool {
    self.values.contains_key(key)
  }

  /// String value of `key`, `None` if absent or null.
  pub fn get_str(&self, key: &str) -> Result<Option<&str>, ConfigError> {
    match self.values.get(key) {
      None | Some(Value::Null) => Ok(None),
      Some(Value::String(s)) => Ok(Some(s)),
      Some(_) => Err(invalid(key, "a string")),
    }
  }

  pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
    match self.values.get(key) {
      None | Some(Value::Null) => Ok(None),
      Some(Value::Bool(b)) => Ok(Some(*b)),
      Some(_) => Err(invalid(key, "a boolean")),
    }
  }

  pub fn get_i64(&self, key: &str) -> Result<Option<i64>, ConfigError> {
    match self.values.get(key) {
      None | Some(Value::Null) => Ok(None),
      Some(Value::Number(n)) => n.as_i64().map(Some).ok_or_else(|| invalid(key, "an integer")),
      Some(_) => Err(invalid(key, "an integer")),
    }
  }

  /// Ordered list of strings. A bare string is treated as a one-element list.
  pub fn get_str_list(&self, key: &str) -> Result<Option<Vec<String>>, ConfigError> {
    match self.values.get(key) {
      None | Some(Value::Null) => Ok(None),
      Some(Value::String(s)) => Ok(Some(vec![s.clone()])),
      Some(Value::Array(items)) => items
        .iter()
        .map(|item| match item {
          Value::String(s) => Ok(s.clone()),
          _ => Err(invalid(key, "a list of strings")),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some),
      Some(_) => Err(invalid(key, "a list of strings")),
    }
  }

  pub fn as_map(&self) -> &ConfigMap {
    &self.values
  }

  /// Pretty, key-sorted JSON rendering of the whole config.
  pub fn to_json_pretty(&self) -> Result<String, ConfigError> {
    Ok(serde_json::to_string_pretty(&self.values)?)
  }

  /// Write the config snapshot to `path`, creating parent directories.
  ///
  /// Callers inside a run log a failure and carry on; the snapshot is a
  /// diagnostic artifact.
  pub fn dump(&self, path: &Path) -> Result<(), ConfigError> {
    let content = self.to_json_pretty()?;
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
      })?;
    }
    fs::write(path, content).map_err(|source| ConfigError::Write {
      path: path.to_path_buf(),
      source,
    })
  }

  /// Reload a snapshot written by [`Config::dump`]. The result is locked.
  pub fn from_snapshot(path: &Path) -> Result<Self, ConfigError> {
    let mut config = Self::from_map(load_file(path)?);
    config.lock();
    Ok(config)
  }
}

fn invalid(key: &str, expected: &str) -> ConfigError {
  ConfigError::InvalidValue {
    key: key.to_string(),
    expected: expected.to_string(),
  }
}

/// Load a JSON (`.json`) or YAML (`.yaml`, `.yml`) config file.
///
/// The document must be a mapping at the top level.
pub fn load_file(path: &Path) -> Result<ConfigMap, ConfigError> {
  let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
    path: path.to_path_buf(),
    source,
  })?;

  let extension = path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase());
  let value: Value = match extension.as_deref() {
    Some("json") => serde_json::from_str(&content).map_err(|e| ConfigError::Parse {
      path: path.to_path_buf(),
      message: e.to_string(),
    })?,
    Some("yaml") | Some("yml") => serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse {
      path: path.to_path_buf(),
      message: e.to_string(),
    })?,
    _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
  };

  match value {
    Value::Object(map) => Ok(map.into_iter().collect()),
    _ => Err(ConfigError::NotAMapping(path.to_path_buf())),
  }
}
