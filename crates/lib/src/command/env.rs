//! Child-process environment.
//!
//! Configured `env` values may reference the outer environment with
//! `%(NAME)s` placeholders, e.g. `"PATH": "/opt/tools/bin:%(PATH)s"`.
//!
//! # Placeholder Formats
//!
//! - `%(NAME)s` - value of `NAME` from the replacement map, else the process env
//! - `%%` - a literal `%`
//!
//! Any other `%` passes through unchanged.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
  #[error("unresolved environment placeholder %({0})s")]
  Unresolved(String),

  #[error("unclosed environment placeholder at position {0}")]
  Unclosed(usize),

  #[error("placeholder %({0}) must end with 's'")]
  BadConversion(String),
}

/// Substitute `%(NAME)s` placeholders in `template` using `lookup`.
pub fn substitute(template: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<String, EnvError> {
  let mut out = String::with_capacity(template.len());
  let mut chars = template.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    if ch != '%' {
      out.push(ch);
      continue;
    }
    match chars.peek() {
      Some((_, '%')) => {
        chars.next();
        out.push('%');
      }
      Some((_, '(')) => {
        chars.next();
        let mut name = String::new();
        let mut closed = false;
        for (_, c) in chars.by_ref() {
          if c == ')' {
            closed = true;
            break;
          }
          name.push(c);
        }
        if !closed {
          return Err(EnvError::Unclosed(pos));
        }
        match chars.next() {
          Some((_, 's')) => {}
          _ => return Err(EnvError::BadConversion(name)),
        }
        let value = lookup(&name).ok_or_else(|| EnvError::Unresolved(name.clone()))?;
        out.push_str(&value);
      }
      _ => out.push('%'),
    }
  }

  Ok(out)
}

/// Build a full child environment.
///
/// Starts from the current process environment and overlays `partial`,
/// substituting each value against `replacements` first and the real
/// process environment second. `PATH` always resolves to the real `PATH`
/// unless `replacements` overrides it.
pub fn query_env(
  partial: &BTreeMap<String, String>,
  replacements: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, EnvError> {
  let outer: BTreeMap<String, String> = std::env::vars_os()
    .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
    .collect();

  let lookup = |name: &str| {
    replacements
      .get(name)
      .or_else(|| outer.get(name))
      .cloned()
      .or_else(|| (name == "PATH").then(String::new))
  };

  let mut env = outer.clone();
  for (key, template) in partial {
    let value = substitute(template, lookup)?;
    debug!(key = %key, value = %value, "child env override");
    env.insert(key.clone(), value);
  }
  Ok(env)
}
