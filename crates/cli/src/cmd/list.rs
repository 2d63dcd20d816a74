//! `harness --list-actions`: show the resolved action selection.

use anyhow::Result;

use harness_lib::pipeline::ActionSelection;

use super::load_config;
use crate::Cli;
use crate::output::{print_action, print_info};
use crate::recipe::Recipe;

pub fn cmd_list_actions(cli: &Cli) -> Result<()> {
  let config = load_config(cli)?;
  let recipe = Recipe::from_config(&config)?;
  let selected = ActionSelection::from_config(&config)?.resolve(&recipe.all_actions, &recipe.default_actions)?;

  print_info(&format!("Actions available for {}:", recipe.name));
  for action in &recipe.all_actions {
    print_action(action, selected.contains(action));
  }
  Ok(())
}
