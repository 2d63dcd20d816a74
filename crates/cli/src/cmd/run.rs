//! `harness`: run the selected actions of a recipe.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use harness_lib::command::{CaptureOptions, CommandError, RunOptions, substitute};
use harness_lib::log::{DEFAULT_FATAL_CODE, Termination};
use harness_lib::pipeline::{ActionHooks, ActionSelection, Harness, Pipeline};
use harness_lib::severity::Severity;

use super::load_config;
use crate::Cli;
use crate::output::{print_error, print_success};
use crate::recipe::{ActionBody, CLOBBER, PreparedStep, Recipe};

/// Run the pipeline and return the process exit code.
pub fn cmd_run(cli: &Cli) -> Result<i32> {
  let config = load_config(cli)?;
  let recipe = Recipe::from_config(&config)?;
  let selected = ActionSelection::from_config(&config)?.resolve(&recipe.all_actions, &recipe.default_actions)?;
  debug!(actions = ?selected, "resolved action selection");

  let mut pipeline = Pipeline::new(recipe.all_actions.clone(), selected)?;
  for action in &recipe.all_actions {
    let body = recipe.bodies.get(action).cloned().unwrap_or_default();
    pipeline.register(action, hooks_for(action, body))?;
  }

  let mut harness = Harness::new(&recipe.name, config).context("Failed to start run")?;
  match pipeline.run(&mut harness, &mut ()) {
    Ok(0) => {
      print_success(&format!("{} finished", recipe.name));
      Ok(0)
    }
    Ok(code) => {
      print_error(&format!("{} finished with {} failed step(s)", recipe.name, code));
      Ok(code)
    }
    Err(termination) => {
      print_error(&termination.to_string());
      Ok(termination.exit_code())
    }
  }
}

fn hooks_for(action: &str, body: ActionBody) -> ActionHooks<()> {
  let mut hooks = ActionHooks::none();
  if !body.preflight.is_empty() {
    hooks.pre = Some(Box::new(steps_hook(action, body.preflight)));
  }
  if !body.run.is_empty() {
    hooks.main = Some(Box::new(steps_hook(action, body.run)));
  } else if action == CLOBBER {
    hooks.main = Some(Box::new(|h: &mut Harness, _: &mut ()| {
      let work_dir = h.dirs().abs_work_dir.clone();
      let files = h.files();
      files.rmtree(h.router(), &work_dir, Severity::Error)?;
      Ok(())
    }));
  }
  if !body.postflight.is_empty() {
    hooks.post = Some(Box::new(steps_hook(action, body.postflight)));
  }
  hooks
}

fn steps_hook(
  action: &str,
  steps: Vec<PreparedStep>,
) -> impl FnMut(&mut Harness, &mut ()) -> Result<(), Termination> + 'static {
  let action = action.to_string();
  move |h: &mut Harness, _: &mut ()| {
    for step in &steps {
      run_step(h, &action, step)?;
    }
    Ok(())
  }
}

/// Run one step. A failed step is summarized and counted; only a
/// termination stops the action.
fn run_step(h: &mut Harness, action: &str, prepared: &PreparedStep) -> Result<(), Termination> {
  let step = &prepared.step;
  let cwd = step.cwd.as_ref().map(|dir| h.dirs().abs_work_dir.join(dir));
  let timeout = step.timeout_secs.map(Duration::from_secs);

  let env = match step_env(h, &step.env) {
    Ok(env) => env,
    Err(e) => {
      h.router().error_or_fatal(
        &format!("Can't build the environment for {}: {}", step.command, e),
        step.halt_on_failure,
        DEFAULT_FATAL_CODE,
      )?;
      return fail(h, action, prepared);
    }
  };

  let failed = if step.capture {
    let opts = CaptureOptions {
      cwd,
      halt_on_failure: step.halt_on_failure,
      env,
      timeout,
      ..CaptureOptions::default()
    };
    match h.get_output(&step.command, opts) {
      Ok(captured) => captured.is_failure(),
      Err(e) => settle(h, e, step.halt_on_failure)?,
    }
  } else {
    let opts = RunOptions {
      cwd,
      rules: prepared.rules.clone(),
      halt_on_failure: step.halt_on_failure,
      success_codes: step.success_codes.clone(),
      env,
      return_mode: step.return_type,
      throw_on_failure: false,
      timeout,
    };
    match h.run_command(&step.command, opts) {
      Ok(result) => result.is_failure(),
      Err(e) => settle(h, e, step.halt_on_failure)?,
    }
  };

  if failed {
    return fail(h, action, prepared);
  }
  if let Some(summary) = &step.summary {
    h.add_summary(summary, Severity::Info)?;
  }
  Ok(())
}

fn fail(h: &mut Harness, action: &str, prepared: &PreparedStep) -> Result<(), Termination> {
  h.add_summary(
    &format!("{} failed: {}", action, prepared.step.command),
    Severity::Error,
  )?;
  h.record_failure();
  Ok(())
}

/// Terminations propagate; anything else is logged and counts as a failure.
fn settle(h: &mut Harness, error: CommandError, halt: bool) -> Result<bool, Termination> {
  match error {
    CommandError::Terminated(t) => Err(t),
    other => {
      h.router().error_or_fatal(&other.to_string(), halt, DEFAULT_FATAL_CODE)?;
      Ok(true)
    }
  }
}

/// Configured environment with the step's own variables on top. `None`
/// when the step adds nothing, so the configured environment applies.
///
/// Step values may reference the absolute directories and any variable of
/// the configured environment.
fn step_env(
  h: &mut Harness,
  extra: &BTreeMap<String, String>,
) -> Result<Option<BTreeMap<String, String>>, CommandError> {
  if extra.is_empty() {
    return Ok(None);
  }
  let dirs = h.dirs().clone();
  let base = h.query_env()?;
  let lookup = |name: &str| {
    let dir = match name {
      "abs_base_work_dir" => &dirs.abs_base_work_dir,
      "abs_work_dir" => &dirs.abs_work_dir,
      "abs_upload_dir" => &dirs.abs_upload_dir,
      "abs_log_dir" => &dirs.abs_log_dir,
      _ => return base.get(name).cloned(),
    };
    Some(dir.display().to_string())
  };

  let mut env = base.clone();
  for (key, template) in extra {
    env.insert(key.clone(), substitute(template, lookup)?);
  }
  Ok(Some(env))
}
