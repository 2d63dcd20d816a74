//! harness-lib: the core of a build/release automation harness.
//!
//! A run is a sequence of named actions over one locked configuration:
//! - `config`: layered configuration, frozen before any action runs
//! - `log`: the leveled run log with its summary channel
//! - `classify`: pattern rules that turn child output into severities
//! - `command`: streaming and captured execution of child processes
//! - `pipeline`: action selection, hooks, and the per-run `Harness`
//! - `fs`: file operations and artifact upload

pub mod classify;
pub mod command;
pub mod config;
pub mod fs;
pub mod log;
pub mod pipeline;
pub mod severity;

pub use classify::{Classified, Classifier, Rule, RuleSpec, classify};
pub use command::{CaptureOptions, CapturedOutput, Command, CommandError, CommandRunner, ReturnMode, RunOptions, RunResult};
pub use config::{Config, ConfigError, Dirs, Overrides, Settings};
pub use log::{DEFAULT_FATAL_CODE, LogRouter, LogSettings, Termination};
pub use pipeline::{ActionHooks, ActionSelection, Harness, HarnessError, Pipeline, PipelineError, PipelineState};
pub use severity::Severity;
