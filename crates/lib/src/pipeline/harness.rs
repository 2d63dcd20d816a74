//! The per-run context handed to every action hook.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::command::{
  CaptureOptions, CapturedOutput, Command, CommandError, CommandRunner, EnvError, RunOptions, RunResult, query_env,
};
use crate::config::{Config, ConfigError, Dirs, Settings};
use crate::fs::{ArtifactTransfer, FileOps, UploadDir};
use crate::log::{LogError, LogRouter, LogSettings, Termination};
use crate::severity::Severity;

#[derive(Debug, Error)]
pub enum HarnessError {
  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error(transparent)]
  Log(#[from] LogError),

  #[error("failed to start command runtime: {0}")]
  Runtime(#[source] io::Error),
}

/// Everything a run shares: the locked config, the log, the command runner
/// and the filesystem collaborators, plus the accumulated return code.
#[derive(Debug)]
pub struct Harness {
  name: String,
  config: Config,
  settings: Settings,
  dirs: Dirs,
  log: LogRouter,
  runner: CommandRunner,
  files: FileOps,
  transfer: Box<dyn ArtifactTransfer>,
  return_code: i32,
  env: Option<BTreeMap<String, String>>,
}

impl Harness {
  /// Lock `config`, derive the settings and directories, open the log.
  pub fn new(name: &str, mut config: Config) -> Result<Self, HarnessError> {
    config.lock();
    let settings = Settings::from_config(&config)?;
    let dirs = Dirs::from_settings(&settings);
    let log = LogRouter::new(LogSettings::from_settings(name, &settings, &dirs))?;
    let runner = CommandRunner::new(settings.noop)
      .map_err(HarnessError::Runtime)?
      .with_timeout(settings.command_timeout.map(Duration::from_secs))
      .with_shell(settings.shell.clone())
      .with_tmp_dir(settings.tmp_dir.clone());

    Ok(Self {
      name: name.to_string(),
      transfer: Box::new(UploadDir::new(&dirs.abs_upload_dir, settings.noop)),
      files: FileOps::new(settings.noop),
      config,
      settings,
      dirs,
      log,
      runner,
      return_code: 0,
      env: None,
    })
  }

  /// Replace the artifact-transfer collaborator.
  pub fn with_transfer(mut self, transfer: Box<dyn ArtifactTransfer>) -> Self {
    self.transfer = transfer;
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  pub fn dirs(&self) -> &Dirs {
    &self.dirs
  }

  pub fn router(&mut self) -> &mut LogRouter {
    &mut self.log
  }

  pub fn files(&self) -> FileOps {
    self.files
  }

  pub fn return_code(&self) -> i32 {
    self.return_code
  }

  /// Count one more failed step in the run's return code.
  pub fn record_failure(&mut self) {
    self.return_code += 1;
  }

  pub fn log(&mut self, message: &str, severity: Severity) -> Result<(), Termination> {
    self.log.log(message, severity)
  }

  pub fn fatal(&mut self, message: &str, exit_code: i32) -> Result<(), Termination> {
    self.log.fatal(message, exit_code)
  }

  pub fn add_summary(&mut self, message: &str, severity: Severity) -> Result<(), Termination> {
    self.log.add_summary(message, severity)
  }

  /// Child environment built from the `env` setting, resolved once per run.
  ///
  /// Besides the process environment, values may reference the absolute
  /// directories as `%(abs_work_dir)s` and friends.
  pub fn query_env(&mut self) -> Result<BTreeMap<String, String>, EnvError> {
    if let Some(env) = &self.env {
      return Ok(env.clone());
    }
    let replacements = BTreeMap::from([
      ("abs_base_work_dir".to_string(), self.dirs.abs_base_work_dir.display().to_string()),
      ("abs_work_dir".to_string(), self.dirs.abs_work_dir.display().to_string()),
      ("abs_upload_dir".to_string(), self.dirs.abs_upload_dir.display().to_string()),
      ("abs_log_dir".to_string(), self.dirs.abs_log_dir.display().to_string()),
    ]);
    let env = query_env(&self.settings.env, &replacements)?;
    self.env = Some(env.clone());
    Ok(env)
  }

  fn default_env(&mut self, explicit: &mut Option<BTreeMap<String, String>>) -> Result<(), EnvError> {
    if explicit.is_none() && !self.settings.env.is_empty() {
      *explicit = Some(self.query_env()?);
    }
    Ok(())
  }

  /// Streaming run. Without an explicit environment the configured `env`
  /// applies.
  pub fn run_command(&mut self, command: &Command, mut opts: RunOptions) -> Result<RunResult, CommandError> {
    self.default_env(&mut opts.env)?;
    self.runner.run(&mut self.log, command, &opts)
  }

  /// Captured run. Without an explicit environment the configured `env`
  /// applies.
  pub fn get_output(&mut self, command: &Command, mut opts: CaptureOptions) -> Result<CapturedOutput, CommandError> {
    self.default_env(&mut opts.env)?;
    self.runner.get_output(&mut self.log, command, &opts)
  }

  /// Write the config snapshot. Failure is logged and the run continues.
  pub fn dump_config(&mut self) {
    let path = self.dirs.config_snapshot(&self.settings);
    self.log.info(&format!("Dumping config to {}.", path.display()));
    if let Err(e) = self.config.dump(&path) {
      self.log.error(&format!("Can't dump config to {}: {}", path.display(), e));
    }
  }

  /// Replay the summary channel under a `<name> summary:` banner.
  pub fn summary(&mut self) {
    let title = format!("{} summary:", self.name);
    self.log.replay_summary(&title);
  }

  /// Copy every log file under `logs/` and the config snapshot to the root
  /// of the upload area, rotating earlier copies.
  pub fn copy_logs_to_upload_dir(&mut self) -> Result<(), Termination> {
    self.log.info("Copying logs to upload dir...");
    self.log.flush();
    for target in self.log.log_files().into_values() {
      self.transfer.copy_to_upload_dir(&mut self.log, &target, Some("logs/"), true)?;
    }
    let snapshot = self.dirs.config_snapshot(&self.settings);
    self.transfer.copy_to_upload_dir(&mut self.log, &snapshot, None, true)?;
    Ok(())
  }

  pub fn copy_to_upload_dir(
    &mut self,
    target: &Path,
    dest: Option<&str>,
    rotate: bool,
  ) -> Result<Option<PathBuf>, Termination> {
    self.transfer.copy_to_upload_dir(&mut self.log, target, dest, rotate)
  }
}
