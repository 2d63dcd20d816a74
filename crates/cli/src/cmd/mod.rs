mod list;
mod run;

use anyhow::{Context, Result};

use harness_lib::config::{Config, ConfigMap, Settings, load_file};

use crate::Cli;

pub use list::cmd_list_actions;
pub use run::cmd_run;

/// Keys every recipe config must define.
const REQUIRED_KEYS: &[&str] = &["all_actions"];

/// Overlay built-in defaults, the config files in order, then the flags.
pub fn load_config(cli: &Cli) -> Result<Config> {
  let cwd = std::env::current_dir().context("Failed to read current directory")?;
  let defaults = Settings::default_layer(&cwd);

  let mut file_layer: Option<ConfigMap> = None;
  for path in &cli.config_files {
    let layer = load_file(path).with_context(|| format!("Failed to load config file: {}", path.display()))?;
    file_layer.get_or_insert_with(ConfigMap::new).extend(layer);
  }

  let overrides = cli.overrides()?.into_map();
  Config::build(defaults, file_layer, Some(overrides), REQUIRED_KEYS).context("Invalid configuration")
}
