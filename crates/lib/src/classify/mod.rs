//! Output classification.
//!
//! Each non-blank line is matched against an ordered rule list. The first
//! matching rule decides its severity; unmatched lines are INFO. Lines at
//! ERROR or above are counted, IGNORE lines are dropped entirely.

pub mod rules;

use crate::log::{LogRouter, Termination};
use crate::severity::Severity;

pub use rules::{Matcher, Rule, RuleError, RuleSpec};

/// Totals for a classified stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Classified {
  /// Lines written to the log (IGNORE and blank lines excluded).
  pub logged: usize,
  /// Lines classified ERROR, CRITICAL or FATAL.
  pub errors: usize,
  /// Highest severity seen, `Ignore` if nothing was classified.
  pub worst: Severity,
}

impl Classified {
  fn empty() -> Self {
    Self {
      logged: 0,
      errors: 0,
      worst: Severity::Ignore,
    }
  }
}

/// Incremental classifier, fed one line at a time while a process runs.
#[derive(Debug)]
pub struct Classifier<'r> {
  rules: &'r [Rule],
  totals: Classified,
}

impl<'r> Classifier<'r> {
  pub fn new(rules: &'r [Rule]) -> Self {
    Self {
      rules,
      totals: Classified::empty(),
    }
  }

  /// Severity the first matching rule assigns to `line`, INFO if none match.
  pub fn severity_of(&self, line: &str) -> (Severity, Option<&'r Rule>) {
    match self.rules.iter().find(|rule| rule.is_match(line)) {
      Some(rule) => (rule.severity, Some(rule)),
      None => (Severity::Info, None),
    }
  }

  /// Classify and log one line.
  ///
  /// A FATAL classification returns the router's [`Termination`].
  pub fn feed(&mut self, line: &str, log: &mut LogRouter) -> Result<Severity, Termination> {
    let line = line.trim_end();
    if line.trim().is_empty() {
      return Ok(Severity::Ignore);
    }

    let (severity, rule) = self.severity_of(line);
    if severity == Severity::Ignore {
      return Ok(severity);
    }

    self.totals.logged += 1;
    self.totals.worst = self.totals.worst.max(severity);
    if severity.is_failure() {
      self.totals.errors += 1;
    }

    let mut message = format!(" {}", line);
    if let Some(rule) = rule {
      if rule.summary {
        log.record_summary(line, severity);
      }
      // One message so a fatal rule still writes its explanation first.
      if let Some(explanation) = &rule.explanation {
        message.push_str(&format!("\n {}", explanation));
      }
    }
    log.log(&message, severity)?;
    Ok(severity)
  }

  pub fn totals(&self) -> Classified {
    self.totals
  }
}

/// Classify every line of `lines` with `rules`, logging through `log`.
pub fn classify<'a, I>(lines: I, rules: &[Rule], log: &mut LogRouter) -> Result<Classified, Termination>
where
  I: IntoIterator<Item = &'a str>,
{
  let mut classifier = Classifier::new(rules);
  for line in lines {
    classifier.feed(line, log)?;
  }
  Ok(classifier.totals())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::log::LogSettings;
  use std::path::Path;
  use tempfile::TempDir;

  fn router(dir: &Path) -> LogRouter {
    LogRouter::new(LogSettings::quiet(dir)).unwrap()
  }

  fn log_content(dir: &Path) -> String {
    std::fs::read_to_string(dir.join("log.log")).unwrap()
  }

  #[test]
  fn first_matching_rule_wins() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());
    let rules = vec![
      Rule::substr("Error: LOL J/K", Severity::Ignore),
      Rule::substr("Error:", Severity::Error),
      Rule::substr("Error", Severity::Warning),
    ];

    let totals = classify(["Error: LOL J/K", "Error: real", "Error without colon"], &rules, &mut log).unwrap();

    assert_eq!(totals.logged, 2);
    assert_eq!(totals.errors, 1);
    assert_eq!(totals.worst, Severity::Error);
    let content = log_content(temp.path());
    assert!(!content.contains("LOL"));
    assert!(content.contains("   ERROR -  Error: real"));
    assert!(content.contains(" WARNING -  Error without colon"));
  }

  #[test]
  fn unmatched_lines_are_info_and_not_counted() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());

    let totals = classify(["compiling foo.c"], &rules::makefile(), &mut log).unwrap();

    assert_eq!(totals, Classified {
      logged: 1,
      errors: 0,
      worst: Severity::Info
    });
    assert!(log_content(temp.path()).contains("    INFO -  compiling foo.c"));
  }

  #[test]
  fn blank_lines_are_skipped() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());

    let totals = classify(["", "   ", "\t\r"], &rules::base(), &mut log).unwrap();

    assert_eq!(totals.logged, 0);
    assert_eq!(totals.worst, Severity::Ignore);
  }

  #[test]
  fn critical_counts_as_error() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());

    let totals = classify(["    raise ValueError: nope"], &rules::python(), &mut log).unwrap();

    assert_eq!(totals.errors, 1);
    assert_eq!(totals.worst, Severity::Critical);
  }

  #[test]
  fn explanation_is_logged_as_second_line() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());
    let rules = vec![Rule::substr("unhelpful error message", Severity::Error).explained("We ran out of disk.")];

    classify(["unhelpful error message!!!111"], &rules, &mut log).unwrap();

    let content = log_content(temp.path());
    let first = content.find("unhelpful error message").unwrap();
    let second = content.find("We ran out of disk.").unwrap();
    assert!(first < second);
    assert_eq!(content.matches("   ERROR - ").count(), 2);
  }

  #[test]
  fn summary_rules_record_summary_entries() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());
    let rules = vec![Rule::substr("revision:", Severity::Info).summarized()];

    classify(["revision: abc123", "other"], &rules, &mut log).unwrap();

    assert_eq!(log.summary().len(), 1);
    assert_eq!(log.summary()[0].message, "revision: abc123");
    assert_eq!(log.summary()[0].severity, Severity::Info);
  }

  #[test]
  fn fatal_line_terminates_after_logging() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());
    let rules = vec![Rule::substr("THE WORLD IS ENDING", Severity::Fatal)];

    let err = classify(["ok", "THE WORLD IS ENDING", "never seen"], &rules, &mut log).unwrap_err();

    assert_eq!(err.code, crate::log::DEFAULT_FATAL_CODE);
    let content = log_content(temp.path());
    assert!(content.contains("THE WORLD IS ENDING"));
    assert!(content.contains("Exiting -1"));
    assert!(!content.contains("never seen"));
  }

  #[test]
  fn fatal_line_with_explanation_logs_both_before_terminating() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());
    let rules = vec![Rule::substr("bad key", Severity::Fatal).explained("Check the keystore passphrase.")];

    assert!(classify(["bad key"], &rules, &mut log).is_err());

    let content = log_content(temp.path());
    assert!(content.contains("bad key"));
    assert!(content.contains("Check the keystore passphrase."));
  }

  #[test]
  fn fatal_line_inside_survive_fatal_is_counted_only() {
    let temp = TempDir::new().unwrap();
    let mut log = router(temp.path());
    let rules = vec![Rule::substr("bad passphrase", Severity::Fatal)];

    let totals = log
      .survive_fatal(|log| classify(["bad passphrase"], &rules, log))
      .unwrap();

    assert_eq!(totals.errors, 1);
    assert_eq!(totals.worst, Severity::Fatal);
  }
}
