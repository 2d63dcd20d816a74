//! Leveled run log.
//!
//! The [`LogRouter`] is built once per run and handed to every collaborator
//! that emits messages. It writes each line to every persistent sink whose
//! threshold admits it and optionally mirrors it on the console.
//!
//! # Log Layout
//!
//! ```text
//! {log_dir}/
//! ├── log.log              # simple mode: everything at or above log_level
//! ├── log_info.log         # multi mode: one file per level >= log_level,
//! ├── log_warning.log      #   each holding its level and above
//! ├── ...
//! └── log_raw.log          # message text only (multi mode default)
//! ```
//!
//! # Fatal Messages
//!
//! Logging at [`Severity::Fatal`] writes the message, then `Exiting <code>`,
//! then returns [`Termination`]. The caller propagates it with `?` until the
//! binary exits. A router built with `halt_on_fatal = false`, or code running
//! inside [`LogRouter::survive_fatal`], writes fatal lines without
//! terminating.

mod sink;
mod termination;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Dirs, LogType, Settings};
use crate::severity::{LEVELS, Severity};

pub use sink::{ConsoleSink, FileSink, LineFormat, format_line};
pub use termination::{DEFAULT_FATAL_CODE, Termination};

#[derive(Debug, Error)]
pub enum LogError {
  #[error("failed to create log directory {path}: {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to open log file {path}: {source}")]
  Open {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

/// Everything the router needs to know about where and how to log.
#[derive(Debug, Clone)]
pub struct LogSettings {
  /// Name used in the "online" banner.
  pub logger_name: String,
  pub log_dir: PathBuf,
  pub log_name: String,
  pub level: Severity,
  pub log_type: LogType,
  pub console: bool,
  pub raw: bool,
  pub append: bool,
  pub date_format: String,
  pub halt_on_fatal: bool,
}

impl LogSettings {
  pub fn from_settings(logger_name: &str, settings: &Settings, dirs: &Dirs) -> Self {
    Self {
      logger_name: logger_name.to_string(),
      log_dir: dirs.abs_log_dir.clone(),
      log_name: settings.log_name.clone(),
      level: settings.log_level,
      log_type: settings.log_type,
      console: settings.log_to_console,
      raw: settings.raw_log_enabled(),
      append: settings.append_to_log,
      date_format: settings.log_date_format.clone(),
      halt_on_fatal: settings.halt_on_failure,
    }
  }

  /// Quiet settings writing into `log_dir`, for tests and embedding.
  pub fn quiet(log_dir: &Path) -> Self {
    Self {
      logger_name: "harness".to_string(),
      log_dir: log_dir.to_path_buf(),
      log_name: "log".to_string(),
      level: Severity::Info,
      log_type: LogType::Simple,
      console: false,
      raw: false,
      append: false,
      date_format: "%H:%M:%S".to_string(),
      halt_on_fatal: true,
    }
  }
}

/// A recorded summary event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryEntry {
  pub message: String,
  pub severity: Severity,
}

/// Routes leveled messages to files and the console.
#[derive(Debug)]
pub struct LogRouter {
  settings: LogSettings,
  sinks: Vec<FileSink>,
  console: Option<ConsoleSink>,
  summary: Vec<SummaryEntry>,
  halt_on_fatal: bool,
}

impl LogRouter {
  /// Create the log directory, open every sink and write the "online" line.
  pub fn new(settings: LogSettings) -> Result<Self, LogError> {
    let mut router = Self {
      halt_on_fatal: settings.halt_on_fatal,
      settings,
      sinks: Vec::new(),
      console: None,
      summary: Vec::new(),
    };
    router.open_sinks()?;
    router.init_message();
    Ok(router)
  }

  /// Close every sink and open them again with `settings`.
  ///
  /// Summary entries survive; handlers are never duplicated.
  pub fn reopen(&mut self, settings: LogSettings) -> Result<(), LogError> {
    self.close();
    self.halt_on_fatal = settings.halt_on_fatal;
    self.settings = settings;
    self.open_sinks()
  }

  fn open_sinks(&mut self) -> Result<(), LogError> {
    create_log_dir(&self.settings.log_dir)?;

    let level = self.settings.level;
    let append = self.settings.append;
    let dir = self.settings.log_dir.clone();
    let name = self.settings.log_name.clone();

    if self.settings.console {
      self.console = Some(ConsoleSink { threshold: level });
    }
    if self.settings.raw {
      self.add_sink("raw", &dir.join(format!("{}_raw.log", name)), level, LineFormat::Raw, append)?;
    }
    match self.settings.log_type {
      LogType::Simple => {
        self.add_sink(
          "default",
          &dir.join(format!("{}.log", name)),
          level,
          LineFormat::Formatted,
          append,
        )?;
      }
      LogType::Multi => {
        for sink_level in LEVELS.into_iter().filter(|l| *l >= level) {
          self.add_sink(
            sink_level.as_str(),
            &dir.join(format!("{}_{}.log", name, sink_level.as_str())),
            sink_level,
            LineFormat::Formatted,
            append,
          )?;
        }
      }
    }
    Ok(())
  }

  fn add_sink(
    &mut self,
    name: &str,
    path: &Path,
    threshold: Severity,
    format: LineFormat,
    append: bool,
  ) -> Result<(), LogError> {
    let sink = FileSink::open(name, path, threshold, format, append).map_err(|source| LogError::Open {
      path: path.to_path_buf(),
      source,
    })?;
    debug!(sink = name, path = %path.display(), threshold = %threshold, "opened log sink");
    self.sinks.push(sink);
    Ok(())
  }

  /// Flush and drop every sink.
  pub fn close(&mut self) {
    for sink in &mut self.sinks {
      if let Err(e) = sink.flush() {
        warn!(path = %sink.path.display(), error = %e, "failed to flush log sink");
      }
    }
    self.sinks.clear();
    self.console = None;
  }

  fn init_message(&mut self) {
    let cwd = std::env::current_dir()
      .map(|p| p.display().to_string())
      .unwrap_or_else(|_| "<unknown>".to_string());
    let message = format!(
      "{} online at {} in {}",
      self.settings.logger_name,
      Local::now().format("%Y%m%d %H:%M:%S"),
      cwd
    );
    self.info(&message);
  }

  pub fn level(&self) -> Severity {
    self.settings.level
  }

  pub fn settings(&self) -> &LogSettings {
    &self.settings
  }

  /// Whether a FATAL message currently terminates the run.
  pub fn halts_on_fatal(&self) -> bool {
    self.halt_on_fatal
  }

  /// Logical sink name to file path for every persistent sink.
  pub fn log_files(&self) -> BTreeMap<String, PathBuf> {
    self
      .sinks
      .iter()
      .map(|sink| (sink.name.clone(), sink.path.clone()))
      .collect()
  }

  /// Write every line of `message` at `severity`, with no fatal handling.
  fn write_lines(&mut self, message: &str, severity: Severity) {
    if severity == Severity::Ignore || severity < self.settings.level {
      return;
    }
    let timestamp = self.timestamp();
    for line in message.lines() {
      for sink in self.sinks.iter_mut().filter(|s| s.accepts(severity)) {
        if let Err(e) = sink.write_line(&timestamp, severity, line) {
          warn!(path = %sink.path.display(), error = %e, "failed to write log line");
        }
      }
      if let Some(console) = self.console.as_ref().filter(|c| c.accepts(severity)) {
        console.write_line(&timestamp, severity, line);
      }
    }
  }

  fn timestamp(&self) -> String {
    let now = Local::now();
    let mut timestamp = String::new();
    if write!(timestamp, "{}", now.format(&self.settings.date_format)).is_err() {
      timestamp = now.format("%H:%M:%S").to_string();
    }
    timestamp
  }

  /// Log `message` at `severity`; a FATAL message terminates with
  /// [`DEFAULT_FATAL_CODE`].
  pub fn log(&mut self, message: &str, severity: Severity) -> Result<(), Termination> {
    self.log_with_code(message, severity, DEFAULT_FATAL_CODE)
  }

  /// Log `message` at `severity`; a FATAL message terminates with `exit_code`.
  pub fn log_with_code(&mut self, message: &str, severity: Severity, exit_code: i32) -> Result<(), Termination> {
    if severity == Severity::Ignore {
      return Ok(());
    }
    self.write_lines(message, severity);
    if severity == Severity::Fatal && self.halt_on_fatal {
      self.write_lines(&format!("Exiting {}", exit_code), Severity::Fatal);
      self.flush();
      return Err(Termination::new(exit_code, message));
    }
    Ok(())
  }

  pub fn debug(&mut self, message: &str) {
    self.write_lines(message, Severity::Debug);
  }

  pub fn info(&mut self, message: &str) {
    self.write_lines(message, Severity::Info);
  }

  pub fn warning(&mut self, message: &str) {
    self.write_lines(message, Severity::Warning);
  }

  pub fn error(&mut self, message: &str) {
    self.write_lines(message, Severity::Error);
  }

  pub fn critical(&mut self, message: &str) {
    self.write_lines(message, Severity::Critical);
  }

  pub fn fatal(&mut self, message: &str, exit_code: i32) -> Result<(), Termination> {
    self.log_with_code(message, Severity::Fatal, exit_code)
  }

  /// Log at ERROR, or FATAL with `exit_code` when `halt` is set.
  pub fn error_or_fatal(&mut self, message: &str, halt: bool, exit_code: i32) -> Result<(), Termination> {
    let severity = if halt { Severity::Fatal } else { Severity::Error };
    self.log_with_code(message, severity, exit_code)
  }

  /// Run `f` with fatal termination disabled.
  ///
  /// Used by checks that expect a would-be-fatal line and treat it as a
  /// result rather than a reason to stop.
  pub fn survive_fatal<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
    let previous = std::mem::replace(&mut self.halt_on_fatal, false);
    let result = f(self);
    self.halt_on_fatal = previous;
    result
  }

  /// Log an error together with its source chain and a backtrace.
  ///
  /// Never terminates, even at FATAL.
  pub fn dump_error(&mut self, message: Option<&str>, error: &dyn std::error::Error, severity: Severity) {
    let mut text = String::new();
    if let Some(message) = message {
      text.push_str(message);
      text.push('\n');
    }
    text.push_str(&error.to_string());
    let mut source = error.source();
    while let Some(cause) = source {
      text.push_str(&format!("\nCaused by: {}", cause));
      source = cause.source();
    }
    let backtrace = std::backtrace::Backtrace::force_capture();
    text.push_str(&format!("\n{}", backtrace));
    self.write_lines(&text, severity);
  }

  /// Three-line banner at INFO.
  pub fn action_message(&mut self, message: &str) {
    self.info("#####");
    self.info(&format!("##### {}", message));
    self.info("#####");
  }

  /// Log `message` and record it for the end-of-run summary.
  pub fn add_summary(&mut self, message: &str, severity: Severity) -> Result<(), Termination> {
    self.record_summary(message, severity);
    self.log(message, severity)
  }

  /// Record a summary entry without logging it.
  pub fn record_summary(&mut self, message: &str, severity: Severity) {
    self.summary.push(SummaryEntry {
      message: message.to_string(),
      severity,
    });
  }

  pub fn summary(&self) -> &[SummaryEntry] {
    &self.summary
  }

  /// Write a banner and every recorded summary entry at its original
  /// severity, in recording order.
  pub fn replay_summary(&mut self, title: &str) {
    self.action_message(title);
    let entries = self.summary.clone();
    for entry in entries {
      self.write_lines(&entry.message, entry.severity);
    }
  }

  pub fn flush(&mut self) {
    for sink in &mut self.sinks {
      if let Err(e) = sink.flush() {
        warn!(path = %sink.path.display(), error = %e, "failed to flush log sink");
      }
    }
  }
}

impl Drop for LogRouter {
  fn drop(&mut self) {
    self.close();
  }
}

/// Create `path` as a directory, replacing a plain file in the way.
fn create_log_dir(path: &Path) -> Result<(), LogError> {
  if path.exists() && !path.is_dir() {
    fs::remove_file(path).map_err(|source| LogError::CreateDir {
      path: path.to_path_buf(),
      source,
    })?;
  }
  fs::create_dir_all(path).map_err(|source| LogError::CreateDir {
    path: path.to_path_buf(),
    source,
  })
}
