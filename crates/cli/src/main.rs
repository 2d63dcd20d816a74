mod cmd;
mod output;
mod recipe;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use harness_lib::config::Overrides;
use harness_lib::severity::Severity;

/// Run build/release actions declared in a recipe config
#[derive(Parser, Debug)]
#[command(name = "harness")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
  /// Config file (JSON or YAML); repeat to layer several, later files win
  #[arg(short = 'c', long = "config-file", value_name = "FILE")]
  pub config_files: Vec<PathBuf>,

  /// Run only this action (repeatable)
  #[arg(long = "action", value_name = "ACTION")]
  pub actions: Vec<String>,

  /// Run this action in addition to the defaults (repeatable)
  #[arg(long = "add-action", value_name = "ACTION")]
  pub add_actions: Vec<String>,

  /// Skip this action (repeatable)
  #[arg(long = "no-action", value_name = "ACTION")]
  pub no_actions: Vec<String>,

  /// Print every action, marking the selected ones, and exit
  #[arg(long)]
  pub list_actions: bool,

  /// Set a config key; VALUE is parsed as JSON when possible
  #[arg(long = "set", value_name = "KEY=VALUE")]
  pub set: Vec<String>,

  /// Append VALUE to the list in a config key
  #[arg(long = "append", value_name = "KEY=VALUE")]
  pub append: Vec<String>,

  /// Set a boolean config key to true
  #[arg(long, value_name = "KEY")]
  pub enable: Vec<String>,

  /// Set a boolean config key to false
  #[arg(long, value_name = "KEY")]
  pub disable: Vec<String>,

  /// Minimum level written to the logs
  #[arg(long, value_name = "LEVEL")]
  pub log_level: Option<Severity>,

  /// Log layout
  #[arg(long, value_parser = ["simple", "multi"])]
  pub log_type: Option<String>,

  /// Work dir, relative to the base work dir
  #[arg(long, value_name = "DIR")]
  pub work_dir: Option<PathBuf>,

  /// Base work dir (default: current directory)
  #[arg(long, value_name = "DIR")]
  pub base_work_dir: Option<PathBuf>,

  /// Log commands without running them
  #[arg(short = 'n', long)]
  pub noop: bool,

  /// Kill commands running longer than this (whole seconds, e.g. "90s", "15m")
  #[arg(long, value_parser = parse_timeout, value_name = "DURATION")]
  pub command_timeout: Option<Duration>,

  /// Don't mirror the run log on the console
  #[arg(long)]
  pub no_console: bool,
}

impl Cli {
  /// The command-line config layer.
  pub fn overrides(&self) -> Result<Overrides> {
    let mut overrides = Overrides::new();
    if !self.actions.is_empty() {
      overrides.extend("actions", self.actions.iter().cloned());
    }
    if !self.add_actions.is_empty() {
      overrides.extend("add_actions", self.add_actions.iter().cloned());
    }
    if !self.no_actions.is_empty() {
      overrides.extend("exclude_actions", self.no_actions.iter().cloned());
    }
    for assignment in &self.set {
      overrides.store_assignment(assignment)?;
    }
    for assignment in &self.append {
      overrides.extend_assignment(assignment)?;
    }
    for key in &self.enable {
      overrides.store_true(key.as_str());
    }
    for key in &self.disable {
      overrides.store_false(key.as_str());
    }
    if let Some(level) = self.log_level {
      overrides.store("log_level", Value::String(level.as_str().to_string()));
    }
    if let Some(log_type) = &self.log_type {
      overrides.store("log_type", Value::String(log_type.clone()));
    }
    if let Some(dir) = &self.work_dir {
      overrides.store("work_dir", Value::String(dir.display().to_string()));
    }
    if let Some(dir) = &self.base_work_dir {
      overrides.store("base_work_dir", Value::String(dir.display().to_string()));
    }
    if self.noop {
      overrides.store_true("noop");
    }
    if let Some(timeout) = self.command_timeout {
      overrides.store("command_timeout", Value::from(timeout.as_secs()));
    }
    if self.no_console {
      overrides.store_false("log_to_console");
    }
    Ok(overrides)
  }
}

/// The `command_timeout` setting counts whole seconds; anything finer is
/// rejected rather than rounded.
fn parse_timeout(raw: &str) -> Result<Duration, String> {
  let timeout = humantime::parse_duration(raw).map_err(|e| e.to_string())?;
  if timeout.is_zero() || timeout.subsec_nanos() != 0 {
    return Err(format!("'{}' is not a positive whole number of seconds", raw));
  }
  Ok(timeout)
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let cli = Cli::parse();

  if cli.list_actions {
    return cmd::cmd_list_actions(&cli);
  }
  let code = cmd::cmd_run(&cli)?;
  std::process::exit(code);
}
