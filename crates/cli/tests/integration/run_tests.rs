//! End-to-end runs of the `harness` binary.

use predicates::prelude::*;

use super::common::TestEnv;

const SIMPLE_RECIPE: &str = r#"
name: simple
all_actions: [clobber, build, package]
default_actions: [build, package]
steps:
  build:
    run:
      - command: echo compiling
        summary: build finished
  package:
    run:
      - command: [echo, packaging]
"#;

#[test]
fn successful_run_exits_zero_and_writes_logs() {
  let env = TestEnv::with_recipe(SIMPLE_RECIPE);

  env
    .harness_cmd()
    .assert()
    .success()
    .stderr(predicate::str::contains("Running build step."))
    .stderr(predicate::str::contains("simple summary:"));

  let info = env.read_log("log_info.log");
  assert!(info.contains("Skipping clobber step."));
  assert!(info.contains("Running package step."));
  assert!(info.contains("compiling"));
  assert!(info.contains("build finished"));
  assert!(env.log_path("log_raw.log").exists());
  assert!(env.base_path().join("localconfig.json").exists());
}

#[test]
fn logs_and_snapshot_are_uploaded() {
  let env = TestEnv::with_recipe(SIMPLE_RECIPE);

  env.harness_cmd().assert().success();

  let upload = env.upload_path();
  assert!(upload.join("logs/log_info.log").exists());
  assert!(upload.join("localconfig.json").exists());
}

#[test]
fn classified_error_continues_and_fails_the_run() {
  let env = TestEnv::with_recipe(
    r#"
all_actions: [build, package]
steps:
  build:
    run:
      - command: "echo 'make[1]: *** [all] Error 1'"
        rules: [makefile]
  package:
    run:
      - command: echo packaged
"#,
  );

  env.harness_cmd().assert().code(1);

  let info = env.read_log("log_info.log");
  assert!(info.contains("packaged"));
  let errors = env.read_log("log_error.log");
  assert!(errors.contains("make[1]: *** [all] Error 1"));
  assert!(errors.contains("build failed: "));
}

#[test]
fn halt_on_failure_exits_with_the_child_status() {
  let env = TestEnv::with_recipe(
    r#"
all_actions: [build, package]
steps:
  build:
    run:
      - command: exit 3
        halt_on_failure: true
  package:
    run:
      - command: echo packaged
"#,
  );

  env
    .harness_cmd()
    .assert()
    .code(3)
    .stderr(predicate::str::contains("Halting on failure while running exit 3"));

  let info = env.read_log("log_info.log");
  assert!(!info.contains("Running package step."));
  assert!(env.read_log("log_fatal.log").contains("Exiting 3"));
}

#[test]
fn action_flags_narrow_the_selection() {
  let env = TestEnv::with_recipe(SIMPLE_RECIPE);

  env.harness_cmd().args(["--action", "package"]).assert().success();

  let info = env.read_log("log_info.log");
  assert!(info.contains("Skipping build step."));
  assert!(!info.contains("compiling"));
  assert!(info.contains("packaging"));
}

#[test]
fn unknown_action_is_rejected() {
  let env = TestEnv::with_recipe(SIMPLE_RECIPE);

  env
    .harness_cmd()
    .args(["--action", "deploy"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("deploy"));
}

#[test]
fn list_actions_marks_the_selection() {
  let env = TestEnv::with_recipe(SIMPLE_RECIPE);

  env
    .harness_cmd()
    .args(["--list-actions", "--add-action", "clobber", "--no-action", "package"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Actions available for simple:"))
    .stdout(predicate::str::contains("  * clobber"))
    .stdout(predicate::str::contains("  * build"))
    .stdout(predicate::str::contains("    package"));

  assert!(!env.log_path("log_info.log").exists());
}

#[test]
fn noop_logs_commands_without_running_them() {
  let env = TestEnv::with_recipe(
    r#"
all_actions: [build]
steps:
  build:
    run:
      - command: touch marker
"#,
  );

  env.harness_cmd().arg("-n").assert().success();

  let info = env.read_log("log_info.log");
  assert!(info.contains("Running command: touch marker"));
  assert!(info.contains("(Dry run; skipping)"));
  assert!(!env.base_path().join("marker").exists());
}

#[test]
fn command_timeout_kills_and_fails_the_step() {
  let env = TestEnv::with_recipe(
    r#"
all_actions: [build]
steps:
  build:
    run:
      - command: sleep 30
"#,
  );

  env.harness_cmd().args(["--command-timeout", "1s"]).assert().code(1);

  assert!(env.read_log("log_error.log").contains("Timed out after 1s while running sleep 30"));
}

#[test]
fn builtin_clobber_removes_the_work_dir() {
  let env = TestEnv::with_recipe(SIMPLE_RECIPE);
  let stale = env.write_file("build/stale.o", "old");

  env.harness_cmd().args(["--add-action", "clobber"]).assert().success();

  assert!(!stale.exists());
  assert!(env.read_log("log_info.log").contains("Running clobber step."));
}

#[test]
fn step_env_expands_directories() {
  let env = TestEnv::with_recipe(
    r#"
all_actions: [build]
steps:
  build:
    run:
      - command: echo "uploads go to $UPLOADS"
        env:
          UPLOADS: "%(abs_upload_dir)s"
"#,
  );

  env.harness_cmd().assert().success();

  let expected = format!("uploads go to {}", env.upload_path().display());
  assert!(env.read_log("log_info.log").contains(&expected));
}

#[test]
fn set_override_reaches_settings() {
  let env = TestEnv::with_recipe(SIMPLE_RECIPE);

  env
    .harness_cmd()
    .args(["--set", "log_name=nightly", "--log-type", "simple", "--no-console"])
    .assert()
    .success()
    .stderr(predicate::str::contains("Running build step.").not());

  assert!(env.read_log("nightly.log").contains("Running build step."));
}

#[test]
fn layered_config_files_later_wins() {
  let env = TestEnv::with_recipe(SIMPLE_RECIPE);
  let second = env.write_file("override.json", r#"{"default_actions": ["package"]}"#);

  env.harness_cmd().arg("-c").arg(&second).assert().success();

  let info = env.read_log("log_info.log");
  assert!(info.contains("Skipping build step."));
  assert!(info.contains("packaging"));
}
