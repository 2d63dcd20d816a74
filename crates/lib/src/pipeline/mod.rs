//! Ordered action pipeline.
//!
//! A script declares every action it knows in a fixed order, selects a
//! subset, and registers hooks per action. Running walks the full list in
//! order so the log shows what was skipped as well as what ran.
//!
//! # Run Sequence
//!
//! ```text
//! dump config snapshot
//! for action in all_actions:
//!     not selected  -> "Skipping <action> step."
//!     selected      -> "Running <action> step."  pre -> main -> post
//! replay summary
//! copy logs + snapshot to the upload dir
//! ```
//!
//! A [`Termination`] from any hook ends the run on the spot: no later hook,
//! action, summary or upload runs.

mod harness;
mod selection;

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

use crate::log::Termination;

pub use harness::{Harness, HarnessError};
pub use selection::ActionSelection;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
  #[error("unknown action: {0}")]
  UnknownAction(String),

  #[error("action listed twice: {0}")]
  DuplicateAction(String),
}

/// One action hook. `S` is the script's own state.
pub type Hook<S> = Box<dyn FnMut(&mut Harness, &mut S) -> Result<(), Termination>>;

/// The hooks of one action.
pub struct ActionHooks<S> {
  pub pre: Option<Hook<S>>,
  pub main: Option<Hook<S>>,
  pub post: Option<Hook<S>>,
}

impl<S> ActionHooks<S> {
  pub fn new(main: impl FnMut(&mut Harness, &mut S) -> Result<(), Termination> + 'static) -> Self {
    Self {
      pre: None,
      main: Some(Box::new(main)),
      post: None,
    }
  }

  /// No hooks at all, not even a main one.
  pub fn none() -> Self {
    Self {
      pre: None,
      main: None,
      post: None,
    }
  }

  pub fn pre(mut self, hook: impl FnMut(&mut Harness, &mut S) -> Result<(), Termination> + 'static) -> Self {
    self.pre = Some(Box::new(hook));
    self
  }

  pub fn post(mut self, hook: impl FnMut(&mut Harness, &mut S) -> Result<(), Termination> + 'static) -> Self {
    self.post = Some(Box::new(hook));
    self
  }
}

impl<S> Default for ActionHooks<S> {
  fn default() -> Self {
    Self::none()
  }
}

impl<S> std::fmt::Debug for ActionHooks<S> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ActionHooks")
      .field("pre", &self.pre.is_some())
      .field("main", &self.main.is_some())
      .field("post", &self.post.is_some())
      .finish()
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
  NotStarted,
  Running(String),
  Completed,
  Terminated,
}

#[derive(Debug)]
pub struct Pipeline<S> {
  all_actions: Vec<String>,
  selected: Vec<String>,
  hooks: BTreeMap<String, ActionHooks<S>>,
  state: PipelineState,
}

impl<S> Pipeline<S> {
  /// `selected` must be a subset of `all_actions`, which must not repeat.
  pub fn new(all_actions: Vec<String>, selected: Vec<String>) -> Result<Self, PipelineError> {
    selection::check_unique(&all_actions)?;
    if let Some(unknown) = selected.iter().find(|a| !all_actions.contains(a)) {
      return Err(PipelineError::UnknownAction(unknown.clone()));
    }
    Ok(Self {
      all_actions,
      selected,
      hooks: BTreeMap::new(),
      state: PipelineState::NotStarted,
    })
  }

  /// Register the hooks for `action`, replacing earlier ones.
  pub fn register(&mut self, action: &str, hooks: ActionHooks<S>) -> Result<&mut Self, PipelineError> {
    if !self.all_actions.iter().any(|a| a == action) {
      return Err(PipelineError::UnknownAction(action.to_string()));
    }
    self.hooks.insert(action.to_string(), hooks);
    Ok(self)
  }

  pub fn all_actions(&self) -> &[String] {
    &self.all_actions
  }

  pub fn selected(&self) -> &[String] {
    &self.selected
  }

  pub fn is_selected(&self, action: &str) -> bool {
    self.selected.iter().any(|a| a == action)
  }

  pub fn state(&self) -> &PipelineState {
    &self.state
  }

  /// Run every selected action and return the accumulated return code.
  pub fn run(&mut self, harness: &mut Harness, state: &mut S) -> Result<i32, Termination> {
    match self.run_actions(harness, state) {
      Ok(()) => {
        self.state = PipelineState::Completed;
        Ok(harness.return_code())
      }
      Err(termination) => {
        debug!(code = termination.code, state = ?self.state, "pipeline terminated");
        self.state = PipelineState::Terminated;
        Err(termination)
      }
    }
  }

  fn run_actions(&mut self, harness: &mut Harness, state: &mut S) -> Result<(), Termination> {
    harness.dump_config();

    for action in &self.all_actions {
      if !self.selected.contains(action) {
        harness.router().action_message(&format!("Skipping {} step.", action));
        continue;
      }
      self.state = PipelineState::Running(action.clone());
      harness.router().action_message(&format!("Running {} step.", action));

      let hooks = self.hooks.entry(action.clone()).or_default();
      if let Some(pre) = hooks.pre.as_mut() {
        pre(harness, state)?;
      }
      match hooks.main.as_mut() {
        Some(main) => main(harness, state)?,
        None => {
          harness.router().error(&format!("No main hook registered for action {}!", action));
          harness.record_failure();
        }
      }
      if let Some(post) = hooks.post.as_mut() {
        post(harness, state)?;
      }
    }

    harness.summary();
    harness.copy_logs_to_upload_dir()
  }
}
