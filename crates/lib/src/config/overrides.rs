//! Command-line override layer.
//!
//! Mirrors the four option behaviours a script's flags can have: `store`
//! replaces a key, `extend` appends to the list accumulated for that key on
//! the command line, and `store_true`/`store_false` set a boolean. The
//! resulting map is the highest-priority layer passed to
//! [`Config::build`](super::Config::build).

use serde_json::Value;

use super::{ConfigError, ConfigMap};

/// Accumulates override values in command-line order.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
  values: ConfigMap,
}

impl Overrides {
  pub fn new() -> Self {
    Self::default()
  }

  /// Replace `key` with `value`.
  pub fn store(&mut self, key: impl Into<String>, value: Value) -> &mut Self {
    self.values.insert(key.into(), value);
    self
  }

  /// Append `items` to the list for `key`.
  ///
  /// A key not yet set on the command line starts empty; a non-list value
  /// stored earlier becomes the first element.
  pub fn extend<I, S>(&mut self, key: impl Into<String>, items: I) -> &mut Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let entry = self.values.entry(key.into()).or_insert_with(|| Value::Array(Vec::new()));
    if !entry.is_array() {
      let previous = entry.take();
      *entry = Value::Array(vec![previous]);
    }
    if let Value::Array(list) = entry {
      list.extend(items.into_iter().map(|s| Value::String(s.into())));
    }
    self
  }

  pub fn store_true(&mut self, key: impl Into<String>) -> &mut Self {
    self.store(key, Value::Bool(true))
  }

  pub fn store_false(&mut self, key: impl Into<String>) -> &mut Self {
    self.store(key, Value::Bool(false))
  }

  /// Parse `KEY=VALUE` and store it (see [`parse_value`]).
  pub fn store_assignment(&mut self, assignment: &str) -> Result<&mut Self, ConfigError> {
    let (key, raw) = split_assignment(assignment)?;
    Ok(self.store(key, parse_value(raw)))
  }

  /// Parse `KEY=VALUE` and append `VALUE` to the list for `KEY`.
  pub fn extend_assignment(&mut self, assignment: &str) -> Result<&mut Self, ConfigError> {
    let (key, raw) = split_assignment(assignment)?;
    Ok(self.extend(key, [raw]))
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  pub fn into_map(self) -> ConfigMap {
    self.values
  }
}

fn split_assignment(assignment: &str) -> Result<(&str, &str), ConfigError> {
  match assignment.split_once('=') {
    Some((key, value)) if !key.trim().is_empty() => Ok((key.trim(), value)),
    _ => Err(ConfigError::InvalidOverride(assignment.to_string())),
  }
}

/// Interpret a command-line string as JSON when it is a valid JSON literal
/// (`true`, `42`, `["a"]`, `{"k": 1}`), otherwise keep it as a string.
pub fn parse_value(raw: &str) -> Value {
  serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
