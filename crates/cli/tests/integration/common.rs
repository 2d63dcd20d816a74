//! Shared test helpers for CLI integration tests.

use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Isolated test environment.
///
/// Each test gets its own temporary base work dir; the recipe lives at
/// `recipe.yaml` inside it.
pub struct TestEnv {
  pub temp: TempDir,
  pub config_path: PathBuf,
}

impl TestEnv {
  /// Create from recipe YAML.
  pub fn with_recipe(recipe: &str) -> Self {
    let temp = TempDir::new().unwrap();
    let config_path = temp.path().join("recipe.yaml");
    std::fs::write(&config_path, recipe).unwrap();
    Self { temp, config_path }
  }

  /// Write a file relative to the temp directory.
  pub fn write_file(&self, relative_path: &str, content: &str) -> PathBuf {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    path
  }

  pub fn base_path(&self) -> PathBuf {
    dunce::canonicalize(self.temp.path()).unwrap_or_else(|_| self.temp.path().to_path_buf())
  }

  pub fn work_path(&self) -> PathBuf {
    self.base_path().join("build")
  }

  pub fn log_path(&self, name: &str) -> PathBuf {
    self.base_path().join("logs").join(name)
  }

  pub fn read_log(&self, name: &str) -> String {
    std::fs::read_to_string(self.log_path(name)).unwrap_or_else(|e| panic!("Failed to read log {}: {}", name, e))
  }

  pub fn upload_path(&self) -> PathBuf {
    self.work_path().join("upload")
  }

  /// A `harness` invocation rooted in the temp dir with the recipe loaded.
  pub fn harness_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("harness");
    cmd.current_dir(self.temp.path());
    cmd.arg("-c").arg(&self.config_path);
    cmd.env_remove("RUST_LOG");
    cmd
  }
}
