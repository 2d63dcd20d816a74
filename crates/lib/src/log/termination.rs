use thiserror::Error;

/// Exit code used when a fatal message does not carry one.
pub const DEFAULT_FATAL_CODE: i32 = -1;

/// The run must end now with `code`.
///
/// Produced by the log router after a FATAL message has been written and the
/// `Exiting <code>` line emitted. Every layer propagates it untouched with
/// `?`; only the binary turns it into a process exit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("run terminated with exit code {code}: {message}")]
pub struct Termination {
  pub code: i32,
  pub message: String,
}

impl Termination {
  pub fn new(code: i32, message: impl Into<String>) -> Self {
    Self {
      code,
      message: message.into(),
    }
  }

  /// Exit code to hand to `std::process::exit`.
  pub fn exit_code(&self) -> i32 {
    self.code
  }
}
