use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command as TokioCommand};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Command, CommandError, ReturnMode, RunOptions, RunResult, SENTINEL_STATUS, exit_code, shell_invocation};
use crate::classify::Classifier;
use crate::log::{LogRouter, Termination};
use crate::severity::Severity;

/// Runs child processes for the harness.
///
/// Owns a single-threaded tokio runtime; every public call blocks on it, so
/// the pipeline above stays synchronous.
#[derive(Debug)]
pub struct CommandRunner {
  pub(super) runtime: Runtime,
  pub(super) noop: bool,
  pub(super) shell: Option<String>,
  pub(super) default_timeout: Option<Duration>,
  pub(super) tmp_dir: Option<PathBuf>,
}

/// How a child finished.
pub(super) enum Exit {
  Code(i32),
  TimedOut(Duration),
}

enum StreamError {
  Spawn(io::Error),
  Wait(io::Error),
  Terminated(Termination),
}

impl From<Termination> for StreamError {
  fn from(t: Termination) -> Self {
    StreamError::Terminated(t)
  }
}

/// Aborts the output forwarders when the run ends, whatever the path out.
struct Forwarders(Vec<JoinHandle<()>>);

impl Drop for Forwarders {
  fn drop(&mut self) {
    for handle in &self.0 {
      handle.abort();
    }
  }
}

impl CommandRunner {
  pub fn new(noop: bool) -> io::Result<Self> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    Ok(Self {
      runtime,
      noop,
      shell: None,
      default_timeout: None,
      tmp_dir: None,
    })
  }

  /// Timeout applied when a call does not set its own.
  pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
    self.default_timeout = timeout;
    self
  }

  /// Shell used for [`Command::Shell`] instead of `/bin/sh`.
  pub fn with_shell(mut self, shell: Option<String>) -> Self {
    self.shell = shell;
    self
  }

  /// Directory for captured-output temp files.
  pub fn with_tmp_dir(mut self, dir: Option<PathBuf>) -> Self {
    self.tmp_dir = dir;
    self
  }

  pub fn is_noop(&self) -> bool {
    self.noop
  }

  /// Run `command`, classifying its output line by line as it arrives.
  pub fn run(&self, log: &mut LogRouter, command: &Command, opts: &RunOptions) -> Result<RunResult, CommandError> {
    let text = command.to_string();
    let mode = opts.return_mode;

    if !check_cwd(log, &text, opts.cwd.as_deref(), opts.halt_on_failure)? {
      return Ok(RunResult::skipped(SENTINEL_STATUS, Severity::Error, mode));
    }
    match &opts.cwd {
      Some(cwd) => log.info(&format!("Running command: {} in {}", text, cwd.display())),
      None => log.info(&format!("Running command: {}", text)),
    }
    if self.noop {
      log.info("(Dry run; skipping)");
      return Ok(RunResult::skipped(0, Severity::Info, mode));
    }

    let timeout = opts.timeout.or(self.default_timeout);
    let mut classifier = Classifier::new(&opts.rules);
    let outcome = match self.build_command(command, opts.cwd.as_deref(), opts.env.as_ref()) {
      Ok(child) => self.runtime.block_on(stream(child, &mut classifier, log, timeout)),
      Err(e) => Err(StreamError::Spawn(e)),
    };

    let (status, timed_out) = match outcome {
      Ok(Exit::Code(status)) => (status, false),
      Ok(Exit::TimedOut(limit)) => {
        log.error(&format!("Timed out after {:?} while running {}", limit, text));
        (SENTINEL_STATUS, true)
      }
      Err(StreamError::Terminated(t)) => return Err(t.into()),
      Err(StreamError::Spawn(e)) | Err(StreamError::Wait(e)) => {
        log.error_or_fatal(
          &format!("Can't run command {}: {}", text, e),
          opts.halt_on_failure,
          SENTINEL_STATUS,
        )?;
        return Ok(RunResult::skipped(SENTINEL_STATUS, Severity::Error, mode));
      }
    };

    let totals = classifier.totals();
    let success = opts.success_codes.contains(&status);
    let return_level = if success { Severity::Info } else { Severity::Error };
    log.log(&format!("Return code: {}", status), return_level)?;
    debug!(command = %text, status, errors = totals.errors, timed_out, "command finished");

    if !success && opts.throw_on_failure {
      return Err(CommandError::Failed { command: text, code: status });
    }
    if opts.halt_on_failure {
      let halt_with = match mode {
        ReturnMode::ErrorCount if totals.errors > 0 => Some(i32::try_from(totals.errors).unwrap_or(i32::MAX)),
        ReturnMode::Status if !success => Some(halt_code(status)),
        _ => None,
      };
      if let Some(code) = halt_with {
        log.fatal(&format!("Halting on failure while running {}", text), code)?;
      }
    }

    Ok(RunResult {
      status,
      error_count: totals.errors,
      severity: totals.worst.max(return_level),
      timed_out,
      mode,
    })
  }

  pub(super) fn build_command(
    &self,
    command: &Command,
    cwd: Option<&Path>,
    env: Option<&BTreeMap<String, String>>,
  ) -> io::Result<TokioCommand> {
    let mut cmd = match command {
      Command::Shell(script) => {
        let (shell, flag) = shell_invocation(self.shell.as_deref());
        let mut cmd = TokioCommand::new(shell);
        cmd.arg(flag).arg(script);
        cmd
      }
      Command::Argv(argv) => {
        let (program, args) = argv
          .split_first()
          .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
        let mut cmd = TokioCommand::new(program);
        cmd.args(args);
        cmd
      }
    };

    if let Some(cwd) = cwd {
      cmd.current_dir(cwd);
    }
    if let Some(env) = env {
      cmd.env_clear().envs(env);
    }
    cmd.stdin(Stdio::null()).kill_on_drop(true);
    Ok(cmd)
  }
}

/// Log the missing-directory failure. `Ok(false)` means do not spawn.
pub(super) fn check_cwd(log: &mut LogRouter, text: &str, cwd: Option<&Path>, halt: bool) -> Result<bool, Termination> {
  match cwd {
    Some(cwd) if !cwd.is_dir() => {
      log.error_or_fatal(
        &format!("Can't run command {} in non-existent directory {}!", text, cwd.display()),
        halt,
        SENTINEL_STATUS,
      )?;
      Ok(false)
    }
    _ => Ok(true),
  }
}

/// Exit code for a halt; a zero status still has to read as a failure.
pub(super) fn halt_code(status: i32) -> i32 {
  if status == 0 { SENTINEL_STATUS } else { status }
}

/// Wait for `child`, killing it once `deadline` passes.
pub(super) async fn wait_with_deadline(
  mut child: Child,
  deadline: Option<(Instant, Duration)>,
) -> io::Result<Exit> {
  let status = match deadline {
    Some((at, limit)) => match tokio::time::timeout_at(at, child.wait()).await {
      Ok(status) => status?,
      Err(_) => return kill(child, limit).await,
    },
    None => child.wait().await?,
  };
  Ok(Exit::Code(exit_code(status)))
}

async fn kill(mut child: Child, limit: Duration) -> io::Result<Exit> {
  debug!(pid = ?child.id(), limit = ?limit, "killing timed out child");
  if let Err(e) = child.kill().await {
    warn!(error = %e, "failed to kill timed out child");
  }
  Ok(Exit::TimedOut(limit))
}

async fn stream(
  cmd: TokioCommand,
  classifier: &mut Classifier<'_>,
  log: &mut LogRouter,
  timeout: Option<Duration>,
) -> Result<Exit, StreamError> {
  let (tx, mut rx) = mpsc::unbounded_channel::<String>();
  let (child, _forwarders) = spawn_combined(cmd, tx).map_err(StreamError::Spawn)?;
  debug!(pid = ?child.id(), "spawned child");

  let deadline = timeout.map(|limit| (Instant::now() + limit, limit));
  loop {
    let line = match deadline {
      Some((at, limit)) => match tokio::time::timeout_at(at, rx.recv()).await {
        Ok(line) => line,
        Err(_) => return kill(child, limit).await.map_err(StreamError::Wait),
      },
      None => rx.recv().await,
    };
    match line {
      Some(line) => {
        classifier.feed(&line, log)?;
      }
      None => break,
    }
  }

  wait_with_deadline(child, deadline).await.map_err(StreamError::Wait)
}

/// Spawn with stdout and stderr sharing one pipe, so lines are read in the
/// order the child wrote them.
#[cfg(unix)]
fn spawn_combined(mut cmd: TokioCommand, tx: mpsc::UnboundedSender<String>) -> io::Result<(Child, Forwarders)> {
  use std::os::fd::OwnedFd;
  use tokio::net::unix::pipe;

  let (reader, writer) = std::io::pipe()?;
  cmd.stdout(writer.try_clone()?).stderr(writer);
  let child = cmd.spawn()?;
  // The command holds our copies of the write end; EOF needs them closed.
  drop(cmd);

  let reader = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;
  Ok((child, Forwarders(vec![tokio::spawn(forward_lines(reader, tx))])))
}

/// Without a shared pipe, both streams are forwarded as they arrive; lines
/// from different streams may be reordered.
#[cfg(not(unix))]
fn spawn_combined(mut cmd: TokioCommand, tx: mpsc::UnboundedSender<String>) -> io::Result<(Child, Forwarders)> {
  cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
  let mut child = cmd.spawn()?;

  let mut forwarders = Forwarders(Vec::with_capacity(2));
  if let Some(stdout) = child.stdout.take() {
    forwarders.0.push(tokio::spawn(forward_lines(stdout, tx.clone())));
  }
  if let Some(stderr) = child.stderr.take() {
    forwarders.0.push(tokio::spawn(forward_lines(stderr, tx)));
  }
  Ok((child, forwarders))
}

async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
  R: AsyncRead + Unpin,
{
  let mut reader = BufReader::new(reader);
  let mut buf = Vec::new();
  loop {
    buf.clear();
    match reader.read_until(b'\n', &mut buf).await {
      Ok(0) => break,
      Ok(_) => {
        if tx.send(String::from_utf8_lossy(&buf).into_owned()).is_err() {
          break;
        }
      }
      Err(e) => {
        warn!(error = %e, "failed to read child output");
        break;
      }
    }
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use crate::classify::{Rule, rules};
  use crate::log::LogSettings;
  use tempfile::TempDir;
  use tracing_test::traced_test;

  fn router(dir: &Path) -> LogRouter {
    LogRouter::new(LogSettings::quiet(dir)).unwrap()
  }

  fn non_halting(dir: &Path) -> LogRouter {
    LogRouter::new(LogSettings {
      halt_on_fatal: false,
      ..LogSettings::quiet(dir)
    })
    .unwrap()
  }

  fn content(dir: &Path) -> String {
    std::fs::read_to_string(dir.join("log.log")).unwrap()
  }

  fn runner() -> CommandRunner {
    CommandRunner::new(false).unwrap()
  }

  #[test]
  fn successful_command_logs_output_and_return_code() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());

    let result = runner()
      .run(&mut log, &Command::shell("echo hello; echo world"), &RunOptions::new())
      .unwrap();

    assert_eq!(result.status, 0);
    assert_eq!(result.severity, Severity::Info);
    assert!(!result.is_failure());
    let content = content(temp.path());
    assert!(content.contains("Running command: echo hello; echo world"));
    assert!(content.contains("    INFO -  hello"));
    assert!(content.contains("    INFO -  world"));
    assert!(content.contains("    INFO - Return code: 0"));
  }

  #[test]
  fn stderr_lines_are_classified_too() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());
    let opts = RunOptions::new().rules(rules::makefile());

    let result = runner()
      .run(&mut log, &Command::shell("echo 'foo.c:3: error: oops' >&2"), &opts)
      .unwrap();

    assert_eq!(result.status, 0);
    assert_eq!(result.error_count, 1);
    assert_eq!(result.severity, Severity::Error);
    assert!(content(temp.path()).contains("   ERROR -  foo.c:3: error: oops"));
  }

  #[test]
  fn interleaved_stdout_and_stderr_keep_their_order() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());
    let script = "i=0; while [ $i -lt 200 ]; do echo out$i; echo err$i >&2; i=$((i+1)); done";

    runner().run(&mut log, &Command::shell(script), &RunOptions::new()).unwrap();

    let content = content(temp.path());
    let seen: Vec<&str> = content
      .lines()
      .filter_map(|line| line.split_once(" -  ").map(|(_, text)| text))
      .filter(|text| text.starts_with("out") || text.starts_with("err"))
      .collect();
    let expected: Vec<String> = (0..200).flat_map(|i| [format!("out{i}"), format!("err{i}")]).collect();
    assert_eq!(seen, expected);
  }

  #[test]
  fn nonzero_exit_logs_error_return_code() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());

    let result = runner().run(&mut log, &Command::shell("exit 3"), &RunOptions::new()).unwrap();

    assert_eq!(result.status, 3);
    assert_eq!(result.value(), 3);
    assert_eq!(result.severity, Severity::Error);
    assert!(content(temp.path()).contains("   ERROR - Return code: 3"));
  }

  #[test]
  fn custom_success_codes() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());
    let opts = RunOptions::new().success_codes(vec![0, 1]).halt_on_failure(true);

    let result = runner().run(&mut log, &Command::shell("exit 1"), &opts).unwrap();

    assert_eq!(result.status, 1);
    assert_eq!(result.severity, Severity::Info);
  }

  #[test]
  fn halt_on_failure_terminates_with_exit_status() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());
    let opts = RunOptions::new().halt_on_failure(true);

    let err = runner().run(&mut log, &Command::shell("exit 2"), &opts).unwrap_err();

    assert_eq!(err.termination().map(|t| t.code), Some(2));
    let content = content(temp.path());
    assert!(content.contains("   FATAL - Halting on failure while running exit 2"));
    assert!(content.contains("   FATAL - Exiting 2"));
  }

  #[test]
  fn error_count_mode_halts_with_error_count() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());
    let opts = RunOptions::new()
      .rules(vec![Rule::substr("boom", Severity::Error)])
      .return_mode(ReturnMode::ErrorCount)
      .halt_on_failure(true);

    let err = runner()
      .run(&mut log, &Command::shell("echo boom; echo boom; echo fine"), &opts)
      .unwrap_err();

    assert_eq!(err.termination().map(|t| t.code), Some(2));
  }

  #[test]
  fn error_count_mode_reports_count_as_value() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());
    let opts = RunOptions::new()
      .rules(vec![Rule::substr("boom", Severity::Error)])
      .return_mode(ReturnMode::ErrorCount);

    let result = runner().run(&mut log, &Command::shell("echo boom"), &opts).unwrap();

    assert_eq!(result.status, 0);
    assert_eq!(result.value(), 1);
  }

  #[test]
  fn throw_on_failure_returns_failed() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());
    let opts = RunOptions::new().throw_on_failure(true);

    let err = runner().run(&mut log, &Command::shell("exit 4"), &opts).unwrap_err();

    assert!(matches!(err, CommandError::Failed { code: 4, .. }));
  }

  #[test]
  fn fatal_output_line_stops_the_run() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());
    let opts = RunOptions::new().rules(vec![Rule::substr("PANIC", Severity::Fatal)]);

    let err = runner()
      .run(&mut log, &Command::shell("echo PANIC; echo after"), &opts)
      .unwrap_err();

    assert!(err.termination().is_some());
    assert!(!content(temp.path()).contains("Return code"));
  }

  #[test]
  fn missing_cwd_is_not_spawned() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());
    let missing = temp.path().join("nope");
    let opts = RunOptions::new().cwd(&missing);

    let result = runner().run(&mut log, &Command::shell("echo hi"), &opts).unwrap();

    assert_eq!(result.status, SENTINEL_STATUS);
    let content = content(temp.path());
    assert!(content.contains(&format!(
      "   ERROR - Can't run command echo hi in non-existent directory {}!",
      missing.display()
    )));
    assert!(!content.contains("Running command"));
  }

  #[test]
  fn missing_cwd_with_halt_is_fatal() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());
    let opts = RunOptions::new().cwd(temp.path().join("nope")).halt_on_failure(true);

    let err = runner().run(&mut log, &Command::shell("echo hi"), &opts).unwrap_err();

    assert_eq!(err.termination().map(|t| t.code), Some(SENTINEL_STATUS));
  }

  #[test]
  fn runs_in_cwd() {
    let temp = TempDir::new().unwrap();
    let work = temp.path().join("work");
    std::fs::create_dir(&work).unwrap();
    std::fs::write(work.join("marker.txt"), "").unwrap();
    let mut log = router(temp.path());

    runner()
      .run(&mut log, &Command::argv(["ls"]), &RunOptions::new().cwd(&work))
      .unwrap();

    let content = content(temp.path());
    assert!(content.contains(&format!("Running command: ls in {}", work.display())));
    assert!(content.contains(" marker.txt"));
  }

  #[test]
  fn noop_skips_execution() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());
    let marker = temp.path().join("created");

    let result = CommandRunner::new(true)
      .unwrap()
      .run(
        &mut log,
        &Command::shell(format!("touch {}", marker.display())),
        &RunOptions::new(),
      )
      .unwrap();

    assert_eq!(result.status, 0);
    assert!(!marker.exists());
    assert!(content(temp.path()).contains("(Dry run; skipping)"));
  }

  #[test]
  fn spawn_failure_returns_sentinel() {
    let temp = TempDir::new().unwrap();
    let mut log = non_halting(temp.path());

    let result = runner()
      .run(&mut log, &Command::argv(["/nonexistent/harness-tool"]), &RunOptions::new())
      .unwrap();

    assert_eq!(result.status, SENTINEL_STATUS);
    assert!(content(temp.path()).contains("Can't run command /nonexistent/harness-tool"));
  }

  #[test]
  fn empty_argv_is_a_spawn_failure() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());

    let err = runner()
      .run(&mut log, &Command::Argv(vec![]), &RunOptions::new().halt_on_failure(true))
      .unwrap_err();

    assert!(err.termination().is_some());
  }

  #[test]
  fn replacement_env_is_used() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());
    let env = BTreeMap::from([
      ("PATH".to_string(), "/usr/bin:/bin".to_string()),
      ("HARNESS_GREETING".to_string(), "hola".to_string()),
    ]);

    runner()
      .run(&mut log, &Command::shell("echo $HARNESS_GREETING"), &RunOptions::new().env(env))
      .unwrap();

    assert!(content(temp.path()).contains("    INFO -  hola"));
  }

  #[test]
  fn timeout_kills_child() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());
    let opts = RunOptions::new().timeout(Duration::from_millis(200));

    let started = std::time::Instant::now();
    let result = runner().run(&mut log, &Command::shell("exec sleep 5"), &opts).unwrap();

    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(result.timed_out);
    assert_eq!(result.status, SENTINEL_STATUS);
    assert_eq!(result.severity, Severity::Error);
    let content = content(temp.path());
    assert!(content.contains("Timed out after 200ms while running exec sleep 5"));
    assert!(content.contains("   ERROR - Return code: -1"));
  }

  #[test]
  fn default_timeout_applies_with_halt() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());
    let runner = runner().with_timeout(Some(Duration::from_millis(100)));

    let err = runner
      .run(&mut log, &Command::shell("exec sleep 5"), &RunOptions::new().halt_on_failure(true))
      .unwrap_err();

    assert_eq!(err.termination().map(|t| t.code), Some(SENTINEL_STATUS));
  }

  #[test]
  fn killed_by_signal_reports_negative_signal() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());

    let result = runner()
      .run(&mut log, &Command::shell("kill -9 $$"), &RunOptions::new())
      .unwrap();

    assert_eq!(result.status, -9);
  }

  #[test]
  #[traced_test]
  fn emits_finished_diagnostic() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());

    runner().run(&mut log, &Command::shell("true"), &RunOptions::new()).unwrap();

    assert!(logs_contain("command finished"));
  }
}
