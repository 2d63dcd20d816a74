//! External command execution.
//!
//! Two modes share the same pre-checks:
//!
//! - **streaming** ([`CommandRunner::run`]): stdout and stderr are read line
//!   by line as they arrive and fed through a [`Classifier`], so the log
//!   mirrors the child in real time.
//! - **captured** ([`CommandRunner::get_output`]): stdout and stderr go to
//!   two temp files that are read back after the child exits.
//!
//! Both return a typed result; fatal halts surface as
//! [`CommandError::Terminated`].
//!
//! [`Classifier`]: crate::classify::Classifier

mod capture;
pub mod env;
mod runner;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classify::Rule;
use crate::log::Termination;
use crate::severity::Severity;

pub use capture::{CaptureOptions, CapturedOutput};
pub use env::{EnvError, query_env, substitute};
pub use runner::CommandRunner;

/// Status reported when no real exit code exists: the directory was missing,
/// the spawn failed or the child timed out.
pub const SENTINEL_STATUS: i32 = -1;

/// A command line to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Command {
  /// Run through the shell (`/bin/sh -c` unless overridden).
  Shell(String),
  /// Program and arguments, no shell involved.
  Argv(Vec<String>),
}

impl Command {
  pub fn shell(script: impl Into<String>) -> Self {
    Command::Shell(script.into())
  }

  pub fn argv<I, S>(args: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Command::Argv(args.into_iter().map(Into::into).collect())
  }
}

impl fmt::Display for Command {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Command::Shell(script) => f.write_str(script),
      Command::Argv(args) => {
        let quoted: Vec<String> = args
          .iter()
          .map(|arg| {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
              format!("'{}'", arg)
            } else {
              arg.clone()
            }
          })
          .collect();
        f.write_str(&quoted.join(" "))
      }
    }
  }
}

/// What [`RunResult::value`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnMode {
  /// The child's exit status.
  #[default]
  Status,
  /// The number of output lines classified ERROR or worse.
  #[serde(rename = "errors")]
  ErrorCount,
}

/// Options for a streaming run.
#[derive(Debug, Clone)]
pub struct RunOptions {
  pub cwd: Option<PathBuf>,
  pub rules: Vec<Rule>,
  pub halt_on_failure: bool,
  pub success_codes: Vec<i32>,
  /// Full replacement environment. `None` inherits the parent's.
  pub env: Option<BTreeMap<String, String>>,
  pub return_mode: ReturnMode,
  pub throw_on_failure: bool,
  /// Overrides the runner's default timeout.
  pub timeout: Option<Duration>,
}

impl Default for RunOptions {
  fn default() -> Self {
    Self {
      cwd: None,
      rules: Vec::new(),
      halt_on_failure: false,
      success_codes: vec![0],
      env: None,
      return_mode: ReturnMode::Status,
      throw_on_failure: false,
      timeout: None,
    }
  }
}

impl RunOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
    self.cwd = Some(cwd.into());
    self
  }

  pub fn rules(mut self, rules: Vec<Rule>) -> Self {
    self.rules = rules;
    self
  }

  pub fn halt_on_failure(mut self, halt: bool) -> Self {
    self.halt_on_failure = halt;
    self
  }

  pub fn success_codes(mut self, codes: Vec<i32>) -> Self {
    self.success_codes = codes;
    self
  }

  pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
    self.env = Some(env);
    self
  }

  pub fn return_mode(mut self, mode: ReturnMode) -> Self {
    self.return_mode = mode;
    self
  }

  pub fn throw_on_failure(mut self, throw: bool) -> Self {
    self.throw_on_failure = throw;
    self
  }

  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }
}

/// Outcome of a streaming run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
  /// Exit status, or [`SENTINEL_STATUS`].
  pub status: i32,
  /// Output lines classified ERROR or worse.
  pub error_count: usize,
  /// Highest severity reached, including the return-code line.
  pub severity: Severity,
  pub timed_out: bool,
  pub mode: ReturnMode,
}

impl RunResult {
  pub(crate) fn skipped(status: i32, severity: Severity, mode: ReturnMode) -> Self {
    Self {
      status,
      error_count: 0,
      severity,
      timed_out: false,
      mode,
    }
  }

  /// Status or error count, per [`ReturnMode`].
  pub fn value(&self) -> i64 {
    match self.mode {
      ReturnMode::Status => i64::from(self.status),
      ReturnMode::ErrorCount => self.error_count as i64,
    }
  }

  pub fn is_failure(&self) -> bool {
    self.severity.is_failure()
  }
}

#[derive(Debug, Error)]
pub enum CommandError {
  #[error(transparent)]
  Terminated(#[from] Termination),

  #[error("command failed with exit code {code}: {command}")]
  Failed { command: String, code: i32 },

  #[error("failed to build command environment: {0}")]
  Env(#[from] EnvError),
}

impl CommandError {
  /// The fatal termination, if this error is one.
  pub fn termination(&self) -> Option<&Termination> {
    match self {
      CommandError::Terminated(t) => Some(t),
      CommandError::Failed { .. } | CommandError::Env(_) => None,
    }
  }
}

/// Program and flag that run a [`Command::Shell`] script: the configured
/// shell, which must take `-c <script>`, or the platform shell.
pub(crate) fn shell_invocation(configured: Option<&str>) -> (&str, &'static str) {
  match configured {
    Some(shell) => (shell, "-c"),
    #[cfg(windows)]
    None => ("cmd.exe", "/C"),
    #[cfg(not(windows))]
    None => ("/bin/sh", "-c"),
  }
}

/// Exit code of a finished child; killed-by-signal maps to `-signal`.
pub(crate) fn exit_code(status: std::process::ExitStatus) -> i32 {
  if let Some(code) = status.code() {
    return code;
  }
  #[cfg(unix)]
  {
    use std::os::unix::process::ExitStatusExt;
    if let Some(signal) = status.signal() {
      return -signal;
    }
  }
  SENTINEL_STATUS
}
