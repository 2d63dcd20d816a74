//! Captured-output mode.

use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::process::Command as TokioCommand;
use tokio::time::Instant;
use tracing::debug;

use super::runner::{Exit, check_cwd, halt_code, wait_with_deadline};
use super::{Command, CommandError, CommandRunner, SENTINEL_STATUS};
use crate::log::LogRouter;
use crate::severity::Severity;

#[derive(Debug, Clone, Default)]
pub struct CaptureOptions {
  pub cwd: Option<PathBuf>,
  pub halt_on_failure: bool,
  /// Full replacement environment. `None` inherits the parent's.
  pub env: Option<BTreeMap<String, String>>,
  /// Don't echo stdout into the log.
  pub silent: bool,
  /// Leave the temp files in place and return their paths.
  pub keep_files: bool,
  pub throw_on_failure: bool,
  pub timeout: Option<Duration>,
}

impl CaptureOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
    self.cwd = Some(cwd.into());
    self
  }

  pub fn halt_on_failure(mut self, halt: bool) -> Self {
    self.halt_on_failure = halt;
    self
  }

  pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
    self.env = Some(env);
    self
  }

  pub fn silent(mut self, silent: bool) -> Self {
    self.silent = silent;
    self
  }

  pub fn keep_files(mut self, keep: bool) -> Self {
    self.keep_files = keep;
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

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
  pub status: i32,
  /// Non-blank stdout lines, right-trimmed. `None` when stdout was empty.
  pub output: Option<String>,
  /// `(stdout, stderr)` temp file paths when kept.
  pub files: Option<(PathBuf, PathBuf)>,
  pub severity: Severity,
  pub timed_out: bool,
}

impl CapturedOutput {
  fn skipped(status: i32, severity: Severity) -> Self {
    Self {
      status,
      output: None,
      files: None,
      severity,
      timed_out: false,
    }
  }

  pub fn is_failure(&self) -> bool {
    self.severity.is_failure()
  }
}

impl CommandRunner {
  /// Run `command` with stdout and stderr redirected to temp files, then
  /// log and return what it printed.
  pub fn get_output(
    &self,
    log: &mut LogRouter,
    command: &Command,
    opts: &CaptureOptions,
  ) -> Result<CapturedOutput, CommandError> {
    let text = command.to_string();

    if !check_cwd(log, &text, opts.cwd.as_deref(), opts.halt_on_failure)? {
      return Ok(CapturedOutput::skipped(SENTINEL_STATUS, Severity::Error));
    }
    match &opts.cwd {
      Some(cwd) => log.info(&format!("Getting output from command: {} in {}", text, cwd.display())),
      None => log.info(&format!("Getting output from command: {}", text)),
    }
    if self.noop {
      log.info("(Dry run; skipping)");
      return Ok(CapturedOutput::skipped(0, Severity::Info));
    }

    let (stdout_file, stderr_file) = match self.temp_files() {
      Ok(files) => files,
      Err(e) => {
        log.error_or_fatal(
          &format!("Can't open temp file for writing: {}", e),
          opts.halt_on_failure,
          SENTINEL_STATUS,
        )?;
        return Ok(CapturedOutput::skipped(SENTINEL_STATUS, Severity::Error));
      }
    };
    log.debug(&format!(
      "Temporary files: {} and {}",
      stdout_file.path().display(),
      stderr_file.path().display()
    ));

    let timeout = opts.timeout.or(self.default_timeout);
    let outcome = self
      .build_command(command, opts.cwd.as_deref(), opts.env.as_ref())
      .and_then(|cmd| {
        let stdout = stdout_file.as_file().try_clone()?;
        let stderr = stderr_file.as_file().try_clone()?;
        Ok(self.runtime.block_on(wait_captured(cmd, stdout, stderr, timeout)))
      })
      .and_then(|exit| exit);

    let (status, timed_out) = match outcome {
      Ok(Exit::Code(status)) => (status, false),
      Ok(Exit::TimedOut(limit)) => {
        log.error(&format!("Timed out after {:?} while running {}", limit, text));
        (SENTINEL_STATUS, true)
      }
      Err(e) => {
        log.error_or_fatal(
          &format!("Can't run command {}: {}", text, e),
          opts.halt_on_failure,
          SENTINEL_STATUS,
        )?;
        return Ok(CapturedOutput::skipped(SENTINEL_STATUS, Severity::Error));
      }
    };

    let output = non_blank_lines(&read_lossy(stdout_file.path()));
    let errors = non_blank_lines(&read_lossy(stderr_file.path()));

    if let Some(output) = output.as_deref().filter(|_| !opts.silent) {
      log.info("Output received:");
      for line in output.lines() {
        log.info(&format!(" {}", line));
      }
    }

    let mut severity = Severity::Info;
    if let Some(errors) = &errors {
      severity = Severity::Error;
      log.error("Errors received:");
      for line in errors.lines() {
        log.error(&format!(" {}", line));
      }
    } else if status != 0 {
      severity = Severity::Error;
    }

    let return_level = if severity == Severity::Error { Severity::Error } else { Severity::Debug };
    log.log(&format!("Return code: {}", status), return_level)?;
    debug!(command = %text, status, timed_out, "captured command finished");

    let files = if opts.keep_files {
      match (stdout_file.keep(), stderr_file.keep()) {
        (Ok((_, out)), Ok((_, err))) => Some((out, err)),
        (Err(e), _) | (_, Err(e)) => {
          log.warning(&format!("Can't keep temp files: {}", e));
          None
        }
      }
    } else {
      None
    };

    if status != 0 && opts.throw_on_failure {
      return Err(CommandError::Failed { command: text, code: status });
    }
    if opts.halt_on_failure && severity == Severity::Error {
      log.fatal(&format!("Halting on failure while running {}", text), halt_code(status))?;
    }

    Ok(CapturedOutput {
      status,
      output,
      files,
      severity,
      timed_out,
    })
  }

  fn temp_files(&self) -> io::Result<(NamedTempFile, NamedTempFile)> {
    let dir = self.tmp_dir.clone().unwrap_or_else(std::env::temp_dir);
    std::fs::create_dir_all(&dir)?;
    let stdout = tempfile::Builder::new()
      .prefix("harness_")
      .suffix("_stdout")
      .tempfile_in(&dir)?;
    let stderr = tempfile::Builder::new()
      .prefix("harness_")
      .suffix("_stderr")
      .tempfile_in(&dir)?;
    Ok((stdout, stderr))
  }
}

async fn wait_captured(
  mut cmd: TokioCommand,
  stdout: File,
  stderr: File,
  timeout: Option<Duration>,
) -> io::Result<Exit> {
  cmd.stdout(Stdio::from(stdout)).stderr(Stdio::from(stderr));
  let child = cmd.spawn()?;
  debug!(pid = ?child.id(), "spawned captured child");
  let deadline = timeout.map(|limit| (Instant::now() + limit, limit));
  wait_with_deadline(child, deadline).await
}

fn read_lossy(path: &Path) -> String {
  std::fs::read(path)
    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    .unwrap_or_default()
}

fn non_blank_lines(text: &str) -> Option<String> {
  let lines: Vec<&str> = text
    .lines()
    .map(str::trim_end)
    .filter(|line| !line.trim().is_empty())
    .collect();
  (!lines.is_empty()).then(|| lines.join("\n"))
}
