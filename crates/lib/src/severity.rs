//! Severity levels shared by the log router, the output classifier and the
//! command runner.
//!
//! Levels are totally ordered `Debug < Info < Warning < Error < Critical < Fatal`.
//! [`Severity::Ignore`] is a sentinel that sorts below everything else but is
//! never written and never counted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Severity of a log line or a classified output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  /// Suppresses both logging and error counting.
  Ignore,
  Debug,
  #[default]
  Info,
  #[serde(alias = "warn")]
  Warning,
  Error,
  Critical,
  /// Written, then the run terminates (unless the router survives fatals).
  Fatal,
}

/// Every loggable level, lowest first. `Ignore` is not included.
pub const LEVELS: [Severity; 6] = [
  Severity::Debug,
  Severity::Info,
  Severity::Warning,
  Severity::Error,
  Severity::Critical,
  Severity::Fatal,
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown severity: {0}")]
pub struct UnknownSeverity(pub String);

impl Severity {
  /// Whether a line at this level counts as an error (ERROR, CRITICAL or FATAL).
  pub fn is_failure(self) -> bool {
    self >= Severity::Error
  }

  /// Upper-case label used in formatted log lines.
  pub fn label(self) -> &'static str {
    match self {
      Severity::Ignore => "IGNORE",
      Severity::Debug => "DEBUG",
      Severity::Info => "INFO",
      Severity::Warning => "WARNING",
      Severity::Error => "ERROR",
      Severity::Critical => "CRITICAL",
      Severity::Fatal => "FATAL",
    }
  }

  /// Lower-case name used in config values and per-level log file names.
  pub fn as_str(self) -> &'static str {
    match self {
      Severity::Ignore => "ignore",
      Severity::Debug => "debug",
      Severity::Info => "info",
      Severity::Warning => "warning",
      Severity::Error => "error",
      Severity::Critical => "critical",
      Severity::Fatal => "fatal",
    }
  }
}

impl fmt::Display for Severity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.label())
  }
}

impl FromStr for Severity {
  type Err = UnknownSeverity;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "ignore" => Ok(Severity::Ignore),
      "debug" => Ok(Severity::Debug),
      "info" => Ok(Severity::Info),
      "warning" | "warn" => Ok(Severity::Warning),
      "error" => Ok(Severity::Error),
      "critical" => Ok(Severity::Critical),
      "fatal" => Ok(Severity::Fatal),
      _ => Err(UnknownSeverity(s.to_string())),
    }
  }
}
