//! Output classification rules.
//!
//! A rule list is evaluated top to bottom and the first match wins, so call
//! sites put their specific rules before the shared generic ones. Every
//! built-in list below ends with [`base`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::severity::Severity;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
  #[error("invalid pattern '{pattern}': {message}")]
  InvalidPattern { pattern: String, message: String },

  #[error("rule needs exactly one of 'substr' or 'regex'")]
  MissingMatcher,

  #[error("unknown rule list: {0}")]
  UnknownList(String),
}

/// What a rule looks for in a line.
#[derive(Debug, Clone)]
pub enum Matcher {
  /// Literal substring anywhere in the line.
  Substring(String),
  /// Regular expression matching anywhere in the line.
  Pattern(Regex),
}

impl Matcher {
  pub fn is_match(&self, line: &str) -> bool {
    match self {
      Matcher::Substring(text) => line.contains(text.as_str()),
      Matcher::Pattern(regex) => regex.is_match(line),
    }
  }
}

/// One pattern-to-severity mapping.
#[derive(Debug, Clone)]
pub struct Rule {
  pub matcher: Matcher,
  pub severity: Severity,
  /// Logged as a second line at the same severity.
  pub explanation: Option<String>,
  /// Also record the line in the run summary.
  pub summary: bool,
}

impl Rule {
  pub fn substr(text: impl Into<String>, severity: Severity) -> Self {
    Self {
      matcher: Matcher::Substring(text.into()),
      severity,
      explanation: None,
      summary: false,
    }
  }

  pub fn regex(pattern: &str, severity: Severity) -> Result<Self, RuleError> {
    let regex = Regex::new(pattern).map_err(|e| RuleError::InvalidPattern {
      pattern: pattern.to_string(),
      message: e.to_string(),
    })?;
    Ok(Self {
      matcher: Matcher::Pattern(regex),
      severity,
      explanation: None,
      summary: false,
    })
  }

  pub fn explained(mut self, explanation: impl Into<String>) -> Self {
    self.explanation = Some(explanation.into());
    self
  }

  pub fn summarized(mut self) -> Self {
    self.summary = true;
    self
  }

  pub fn is_match(&self, line: &str) -> bool {
    self.matcher.is_match(line)
  }
}

/// Serialized form of a rule, as written in config files:
/// `{"substr": "...", "level": "error", "explanation": "...", "summary": true}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub substr: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub regex: Option<String>,
  #[serde(default)]
  pub level: Severity,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub explanation: Option<String>,
  #[serde(default)]
  pub summary: bool,
}

impl TryFrom<&RuleSpec> for Rule {
  type Error = RuleError;

  fn try_from(spec: &RuleSpec) -> Result<Self, Self::Error> {
    let mut rule = match (&spec.substr, &spec.regex) {
      (Some(text), None) => Rule::substr(text.clone(), spec.level),
      (None, Some(pattern)) => Rule::regex(pattern, spec.level)?,
      _ => return Err(RuleError::MissingMatcher),
    };
    rule.explanation = spec.explanation.clone();
    rule.summary = spec.summary;
    Ok(rule)
  }
}

/// Compile a list of rule specs, stopping at the first bad one.
pub fn compile(specs: &[RuleSpec]) -> Result<Vec<Rule>, RuleError> {
  specs.iter().map(Rule::try_from).collect()
}

fn builtin(pattern: &str, severity: Severity) -> Rule {
  Rule::regex(pattern, severity).expect("built-in rule pattern is valid")
}

/// Generic rules every list ends with.
pub fn base() -> Vec<Rule> {
  vec![Rule::substr("command not found", Severity::Error)]
}

/// ssh, scp and rsync over ssh.
pub fn ssh() -> Vec<Rule> {
  let mut rules = vec![
    Rule::substr("Name or service not known", Severity::Error),
    Rule::substr("Could not resolve hostname", Severity::Error),
    Rule::substr("POSSIBLE BREAK-IN ATTEMPT", Severity::Warning),
    Rule::substr("Network error:", Severity::Error),
    Rule::substr("Access denied", Severity::Error),
    Rule::substr("Authentication refused", Severity::Error),
    Rule::substr("Out of memory", Severity::Error),
    Rule::substr("Connection reset by peer", Severity::Warning),
    Rule::substr("Host key verification failed", Severity::Error),
    Rule::substr("WARNING:", Severity::Warning),
    Rule::substr("rsync error:", Severity::Error),
    Rule::substr("Broken pipe:", Severity::Error),
    Rule::substr("connection unexpectedly closed:", Severity::Error),
  ];
  rules.extend(base());
  rules
}

/// Mercurial.
pub fn hg() -> Vec<Rule> {
  let mut rules = vec![
    builtin(r"^abort:", Severity::Error),
    Rule::substr("unknown exception encountered", Severity::Error),
  ];
  rules.extend(base());
  rules
}

/// Python tracebacks and uncaught raises.
pub fn python() -> Vec<Rule> {
  let mut rules = vec![
    Rule::substr("Traceback (most recent call last)", Severity::Error),
    Rule::substr("SyntaxError: ", Severity::Error),
    Rule::substr("TypeError: ", Severity::Error),
    Rule::substr("NameError: ", Severity::Error),
    Rule::substr("ZeroDivisionError: ", Severity::Error),
    builtin(r"raise \w*Exception: ", Severity::Critical),
    builtin(r"raise \w*Error: ", Severity::Critical),
  ];
  rules.extend(base());
  rules
}

/// make and compiler diagnostics.
pub fn makefile() -> Vec<Rule> {
  let mut rules = vec![
    Rule::substr("No rule to make target ", Severity::Error),
    builtin(r"akefile.*was not found\.", Severity::Error),
    builtin(r"Stop\.$", Severity::Error),
    builtin(r":\d+: error:", Severity::Error),
    builtin(r"make\[\d+\]: \*\*\* \[.*\] Error \d+", Severity::Error),
    builtin(r":\d+: warning:", Severity::Warning),
    Rule::substr("Warning: ", Severity::Warning),
  ];
  rules.extend(base());
  rules
}

/// Android Debug Bridge.
pub fn adb() -> Vec<Rule> {
  let mut rules = vec![
    Rule::substr("INSTALL_FAILED_INSUFFICIENT_STORAGE", Severity::Error),
    Rule::substr("Android Debug Bridge version", Severity::Error),
    Rule::substr("error: protocol fault", Severity::Error),
  ];
  rules.extend(base());
  rules
}

/// Look up a built-in list by name.
pub fn named(name: &str) -> Result<Vec<Rule>, RuleError> {
  match name {
    "base" => Ok(base()),
    "ssh" => Ok(ssh()),
    "hg" => Ok(hg()),
    "python" => Ok(python()),
    "makefile" | "make" => Ok(makefile()),
    "adb" => Ok(adb()),
    _ => Err(RuleError::UnknownList(name.to_string())),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn every_builtin_list_compiles_and_ends_with_base() {
    for name in ["base", "ssh", "hg", "python", "makefile", "adb"] {
      let rules = named(name).unwrap();
      let last = rules.last().unwrap();
      assert!(last.is_match("sh: foo: command not found"), "{name} should end with base");
    }
  }

  #[test]
  fn substring_and_pattern_matching() {
    let rules = makefile();

    assert!(rules[0].is_match("make: *** No rule to make target `all'.  Stop."));
    assert!(rules.iter().any(|r| r.is_match("foo.c:12: error: expected ';'")));
    assert!(!hg()[0].is_match("note: abort: later in line"));
    assert!(hg()[0].is_match("abort: repository not found"));
  }

  #[test]
  fn spec_compiles_with_defaults() {
    let spec: RuleSpec = serde_json::from_str(r#"{"substr": "out of disk"}"#).unwrap();
    let rule = Rule::try_from(&spec).unwrap();

    assert_eq!(rule.severity, Severity::Info);
    assert!(rule.is_match("we are out of disk now"));
    assert!(!rule.summary);
  }

  #[test]
  fn spec_with_explanation_and_summary() {
    let spec: RuleSpec = serde_json::from_str(
      r#"{"regex": "^fatal: (.*)$", "level": "fatal", "explanation": "VCS gave up", "summary": true}"#,
    )
    .unwrap();
    let rule = Rule::try_from(&spec).unwrap();

    assert_eq!(rule.severity, Severity::Fatal);
    assert_eq!(rule.explanation.as_deref(), Some("VCS gave up"));
    assert!(rule.summary);
  }

  #[test]
  fn spec_errors() {
    let neither = RuleSpec {
      substr: None,
      regex: None,
      level: Severity::Error,
      explanation: None,
      summary: false,
    };
    assert_eq!(Rule::try_from(&neither).unwrap_err(), RuleError::MissingMatcher);

    let both = RuleSpec {
      substr: Some("a".into()),
      regex: Some("b".into()),
      ..neither.clone()
    };
    assert_eq!(Rule::try_from(&both).unwrap_err(), RuleError::MissingMatcher);

    let bad = RuleSpec {
      regex: Some("(unclosed".into()),
      ..neither
    };
    assert!(matches!(compile(&[bad]), Err(RuleError::InvalidPattern { .. })));
  }

  #[test]
  fn unknown_list_name() {
    assert_eq!(named("cobol").unwrap_err(), RuleError::UnknownList("cobol".into()));
  }
}
