//! CLI output formatting utilities.
//!
//! The run log has its own console sink; these helpers cover what the binary
//! prints outside a run: action listings and startup errors.

use owo_colors::{OwoColorize, Stream};

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const INFO: &str = "•";
  pub const SELECTED: &str = "*";
}

/// One line of an action listing; selected actions carry a marker.
pub fn action_line(action: &str, selected: bool) -> String {
  let marker = if selected { symbols::SELECTED } else { " " };
  format!("  {} {}", marker, action)
}

pub fn print_action(action: &str, selected: bool) {
  let line = action_line(action, selected);
  if selected {
    println!("{}", line.if_supports_color(Stream::Stdout, |s| s.green()));
  } else {
    println!("{}", line.if_supports_color(Stream::Stdout, |s| s.dimmed()));
  }
}

pub fn print_success(message: &str) {
  eprintln!(
    "{} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stderr, |s| s.green()),
    message
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_info(message: &str) {
  println!(
    "{} {}",
    symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
    message
  );
}
