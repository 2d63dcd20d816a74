//! Which actions a run executes.

use std::collections::HashSet;

use super::PipelineError;
use crate::config::{Config, ConfigError};

/// Action selection as given on the command line or in config.
///
/// `only` replaces the default list outright; otherwise the defaults are
/// extended with `add`. `exclude` always wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionSelection {
  pub only: Option<Vec<String>>,
  pub add: Vec<String>,
  pub exclude: Vec<String>,
}

impl ActionSelection {
  /// Read the `actions`, `add_actions` and `exclude_actions` keys.
  pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
    Ok(Self {
      only: config.get_str_list("actions")?.filter(|list| !list.is_empty()),
      add: config.get_str_list("add_actions")?.unwrap_or_default(),
      exclude: config.get_str_list("exclude_actions")?.unwrap_or_default(),
    })
  }

  /// Resolve against the full action list and the default selection.
  ///
  /// The result follows `all` order. Every name anywhere in the selection
  /// must be a known action.
  pub fn resolve(&self, all: &[String], defaults: &[String]) -> Result<Vec<String>, PipelineError> {
    check_unique(all)?;
    let known: HashSet<&str> = all.iter().map(String::as_str).collect();
    let names = self
      .only
      .iter()
      .flatten()
      .chain(&self.add)
      .chain(&self.exclude)
      .chain(defaults);
    for name in names {
      if !known.contains(name.as_str()) {
        return Err(PipelineError::UnknownAction(name.clone()));
      }
    }

    let mut wanted: HashSet<&str> = match &self.only {
      Some(only) => only.iter().map(String::as_str).collect(),
      None => defaults.iter().chain(&self.add).map(String::as_str).collect(),
    };
    for name in &self.exclude {
      wanted.remove(name.as_str());
    }

    Ok(all.iter().filter(|a| wanted.contains(a.as_str())).cloned().collect())
  }
}

pub(super) fn check_unique(all: &[String]) -> Result<(), PipelineError> {
  let mut seen = HashSet::new();
  for name in all {
    if !seen.insert(name.as_str()) {
      return Err(PipelineError::DuplicateAction(name.clone()));
    }
  }
  Ok(())
}
