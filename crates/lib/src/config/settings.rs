//! Typed view of the harness keys inside a [`Config`].
//!
//! Only the keys the harness itself interprets live here; everything else
//! stays in the raw map for scripts to read.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Config, ConfigError, ConfigMap};
use crate::severity::Severity;

/// Default name of the config snapshot written at the start of a run.
pub const CONFIG_SNAPSHOT: &str = "localconfig.json";

/// Log file layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
  /// One combined `<log_name>.log`.
  Simple,
  /// One `<log_name>_<level>.log` per level at or above the log level.
  #[default]
  Multi,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
  pub base_work_dir: PathBuf,
  pub work_dir: PathBuf,
  pub log_dir: PathBuf,
  pub upload_dir: PathBuf,
  pub log_name: String,
  pub log_level: Severity,
  pub log_type: LogType,
  pub log_to_console: bool,
  /// `None` means "raw log in multi mode only".
  pub log_to_raw: Option<bool>,
  pub append_to_log: bool,
  pub log_date_format: String,
  pub noop: bool,
  /// FATAL log lines terminate the run.
  pub halt_on_failure: bool,
  pub env: BTreeMap<String, String>,
  /// Seconds before a child process is killed. `None` waits forever.
  pub command_timeout: Option<u64>,
  /// Where captured-output temp files go. Defaults to the system temp dir.
  pub tmp_dir: Option<PathBuf>,
  /// Shell for string commands; must take `-c <script>`. Defaults to `/bin/sh`.
  pub shell: Option<String>,
  pub config_snapshot: String,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      base_work_dir: PathBuf::from("."),
      work_dir: PathBuf::from("build"),
      log_dir: PathBuf::from("logs"),
      upload_dir: PathBuf::from("upload"),
      log_name: "log".to_string(),
      log_level: Severity::Info,
      log_type: LogType::Multi,
      log_to_console: true,
      log_to_raw: None,
      append_to_log: false,
      log_date_format: "%H:%M:%S".to_string(),
      noop: false,
      halt_on_failure: true,
      env: BTreeMap::new(),
      command_timeout: None,
      tmp_dir: None,
      shell: None,
      config_snapshot: CONFIG_SNAPSHOT.to_string(),
    }
  }
}

impl Settings {
  /// Deserialize the harness keys out of `config`. Unknown keys are ignored,
  /// missing keys take their defaults, explicit nulls count as missing.
  pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
    let known: serde_json::Map<String, Value> = config
      .as_map()
      .iter()
      .filter(|(_, value)| !value.is_null())
      .map(|(key, value)| (key.clone(), value.clone()))
      .collect();
    serde_json::from_value(Value::Object(known)).map_err(|e| ConfigError::InvalidValue {
      key: "<settings>".to_string(),
      expected: e.to_string(),
    })
  }

  /// Built-in defaults as a config layer, with `base_work_dir` set to `cwd`.
  pub fn default_layer(cwd: &Path) -> ConfigMap {
    let mut defaults = Self::default();
    defaults.base_work_dir = cwd.to_path_buf();
    match serde_json::to_value(defaults) {
      Ok(Value::Object(map)) => map.into_iter().filter(|(_, v)| !v.is_null()).collect(),
      _ => ConfigMap::new(),
    }
  }

  pub fn raw_log_enabled(&self) -> bool {
    self.log_to_raw.unwrap_or(self.log_type == LogType::Multi)
  }
}

/// Absolute directories derived from [`Settings`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dirs {
  pub abs_base_work_dir: PathBuf,
  pub abs_work_dir: PathBuf,
  pub abs_upload_dir: PathBuf,
  pub abs_log_dir: PathBuf,
}

impl Dirs {
  pub fn from_settings(settings: &Settings) -> Self {
    let base = absolute(&settings.base_work_dir);
    let abs_work_dir = base.join(&settings.work_dir);
    Self {
      abs_upload_dir: abs_work_dir.join(&settings.upload_dir),
      abs_log_dir: base.join(&settings.log_dir),
      abs_work_dir,
      abs_base_work_dir: base,
    }
  }

  /// Where the config snapshot is written.
  pub fn config_snapshot(&self, settings: &Settings) -> PathBuf {
    self.abs_base_work_dir.join(&settings.config_snapshot)
  }
}

fn absolute(path: &Path) -> PathBuf {
  if let Ok(canonical) = dunce::canonicalize(path) {
    return canonical;
  }
  if path.is_absolute() {
    return path.to_path_buf();
  }
  std::env::current_dir().map(|cwd| cwd.join(path)).unwrap_or_else(|_| path.to_path_buf())
}
