//! Recipe: the action bodies a config file declares.
//!
//! ```yaml
//! name: firefox-build
//! all_actions: [clobber, pull, build, package, upload]
//! default_actions: [pull, build, package]
//! steps:
//!   build:
//!     run:
//!       - command: make -j4
//!         cwd: src
//!         rules: [makefile]
//!         halt_on_failure: true
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use harness_lib::classify::{Rule, RuleSpec, rules};
use harness_lib::command::{Command, ReturnMode};
use harness_lib::config::Config;

/// Name used in banners and the summary title when the config has none.
pub const DEFAULT_NAME: &str = "harness";

/// The built-in action that removes the work dir unless it has run steps.
pub const CLOBBER: &str = "clobber";

/// One command in an action body.
#[derive(Debug, Clone, Deserialize)]
pub struct Step {
  pub command: Command,
  /// Relative to the work dir.
  #[serde(default)]
  pub cwd: Option<PathBuf>,
  /// Built-in rule lists, e.g. `makefile`, `python`.
  #[serde(default)]
  pub rules: Vec<String>,
  /// Rules checked before the named lists.
  #[serde(default)]
  pub extra_rules: Vec<RuleSpec>,
  #[serde(default)]
  pub halt_on_failure: bool,
  #[serde(default = "default_success_codes")]
  pub success_codes: Vec<i32>,
  #[serde(default)]
  pub return_type: ReturnMode,
  /// Use captured mode instead of streaming.
  #[serde(default)]
  pub capture: bool,
  #[serde(default)]
  pub env: BTreeMap<String, String>,
  #[serde(default)]
  pub timeout_secs: Option<u64>,
  /// Summary line recorded when the step succeeds.
  #[serde(default)]
  pub summary: Option<String>,
}

fn default_success_codes() -> Vec<i32> {
  vec![0]
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ActionSteps {
  preflight: Vec<Step>,
  run: Vec<Step>,
  postflight: Vec<Step>,
}

/// A step with its rule list compiled.
#[derive(Debug, Clone)]
pub struct PreparedStep {
  pub step: Step,
  pub rules: Vec<Rule>,
}

impl PreparedStep {
  fn prepare(step: Step) -> Result<Self> {
    let mut compiled = rules::compile(&step.extra_rules)?;
    for name in &step.rules {
      compiled.extend(rules::named(name)?);
    }
    Ok(Self { step, rules: compiled })
  }
}

#[derive(Debug, Clone, Default)]
pub struct ActionBody {
  pub preflight: Vec<PreparedStep>,
  pub run: Vec<PreparedStep>,
  pub postflight: Vec<PreparedStep>,
}

#[derive(Debug, Clone)]
pub struct Recipe {
  pub name: String,
  pub all_actions: Vec<String>,
  pub default_actions: Vec<String>,
  pub bodies: BTreeMap<String, ActionBody>,
}

impl Recipe {
  pub fn from_config(config: &Config) -> Result<Self> {
    let name = config.get_str("name")?.unwrap_or(DEFAULT_NAME).to_string();
    let all_actions = config.get_str_list("all_actions")?.unwrap_or_default();
    if all_actions.is_empty() {
      bail!("'all_actions' must list at least one action");
    }
    let default_actions = config
      .get_str_list("default_actions")?
      .unwrap_or_else(|| all_actions.clone());

    let steps: BTreeMap<String, ActionSteps> = match config.get("steps") {
      None | Some(serde_json::Value::Null) => BTreeMap::new(),
      Some(value) => serde_json::from_value(value.clone()).context("Invalid 'steps' section")?,
    };

    let mut bodies = BTreeMap::new();
    for (action, steps) in steps {
      if !all_actions.contains(&action) {
        bail!("'steps' names an action missing from 'all_actions': {}", action);
      }
      let prepare = |list: Vec<Step>| -> Result<Vec<PreparedStep>> {
        list.into_iter().map(PreparedStep::prepare).collect()
      };
      let body = ActionBody {
        preflight: prepare(steps.preflight).with_context(|| format!("Invalid preflight step in {}", action))?,
        run: prepare(steps.run).with_context(|| format!("Invalid run step in {}", action))?,
        postflight: prepare(steps.postflight).with_context(|| format!("Invalid postflight step in {}", action))?,
      };
      bodies.insert(action, body);
    }

    Ok(Self {
      name,
      all_actions,
      default_actions,
      bodies,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use harness_lib::severity::Severity;
  use serde_json::json;

  fn config(value: serde_json::Value) -> Config {
    match value {
      serde_json::Value::Object(map) => Config::from_map(map.into_iter().collect()),
      _ => panic!("not an object"),
    }
  }

  #[test]
  fn parses_steps_with_defaults() {
    let recipe = Recipe::from_config(&config(json!({
      "all_actions": ["pull", "build"],
      "steps": {
        "build": {"run": [{"command": "make", "rules": ["makefile"]}]}
      }
    })))
    .unwrap();

    assert_eq!(recipe.name, DEFAULT_NAME);
    assert_eq!(recipe.default_actions, vec!["pull", "build"]);
    let step = &recipe.bodies["build"].run[0];
    assert_eq!(step.step.command, Command::shell("make"));
    assert_eq!(step.step.success_codes, vec![0]);
    assert_eq!(step.step.return_type, ReturnMode::Status);
    assert!(!step.rules.is_empty());
  }

  #[test]
  fn extra_rules_come_before_named_lists() {
    let recipe = Recipe::from_config(&config(json!({
      "all_actions": ["build"],
      "steps": {"build": {"run": [{
        "command": ["make", "all"],
        "rules": ["base"],
        "extra_rules": [{"substr": "command not found", "level": "warning"}]
      }]}}
    })))
    .unwrap();

    let rules = &recipe.bodies["build"].run[0].rules;
    assert_eq!(rules.len(), 2);
    assert_eq!(rules[0].severity, Severity::Warning);
  }

  #[test]
  fn rejects_bad_recipes() {
    assert!(Recipe::from_config(&config(json!({}))).is_err());
    assert!(
      Recipe::from_config(&config(json!({
        "all_actions": ["build"],
        "steps": {"deploy": {"run": [{"command": "true"}]}}
      })))
      .is_err()
    );
    assert!(
      Recipe::from_config(&config(json!({
        "all_actions": ["build"],
        "steps": {"build": {"run": [{"command": "true", "rules": ["cobol"]}]}}
      })))
      .is_err()
    );
  }
}
