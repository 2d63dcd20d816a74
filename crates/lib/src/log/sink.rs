//! Log destinations.

use std::fs::{File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};

use owo_colors::{OwoColorize, Stream};

use crate::severity::Severity;

/// How a sink renders a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFormat {
  /// `<time> <LEVEL> - <message>`
  Formatted,
  /// The message alone.
  Raw,
}

/// A persistent log file with its own minimum severity.
#[derive(Debug)]
pub struct FileSink {
  pub name: String,
  pub path: PathBuf,
  pub threshold: Severity,
  pub format: LineFormat,
  writer: LineWriter<File>,
}

impl FileSink {
  /// Open `path`, truncating it unless `append` is set.
  pub fn open(
    name: impl Into<String>,
    path: &Path,
    threshold: Severity,
    format: LineFormat,
    append: bool,
  ) -> io::Result<Self> {
    let file = OpenOptions::new()
      .create(true)
      .write(true)
      .append(append)
      .truncate(!append)
      .open(path)?;
    Ok(Self {
      name: name.into(),
      path: path.to_path_buf(),
      threshold,
      format,
      writer: LineWriter::new(file),
    })
  }

  pub fn accepts(&self, severity: Severity) -> bool {
    severity >= self.threshold
  }

  pub fn write_line(&mut self, timestamp: &str, severity: Severity, line: &str) -> io::Result<()> {
    match self.format {
      LineFormat::Formatted => writeln!(self.writer, "{}", format_line(timestamp, severity, line)),
      LineFormat::Raw => writeln!(self.writer, "{}", line),
    }
  }

  pub fn flush(&mut self) -> io::Result<()> {
    self.writer.flush()
  }
}

/// Console mirror on stderr, colorized when the terminal supports it.
#[derive(Debug, Clone)]
pub struct ConsoleSink {
  pub threshold: Severity,
}

impl ConsoleSink {
  pub fn accepts(&self, severity: Severity) -> bool {
    severity >= self.threshold
  }

  pub fn write_line(&self, timestamp: &str, severity: Severity, line: &str) {
    let label = format!("{:>8}", severity.label());
    let label = match severity {
      Severity::Debug => label.if_supports_color(Stream::Stderr, |s| s.dimmed()).to_string(),
      Severity::Warning => label.if_supports_color(Stream::Stderr, |s| s.yellow()).to_string(),
      Severity::Error => label.if_supports_color(Stream::Stderr, |s| s.red()).to_string(),
      Severity::Critical | Severity::Fatal => label
        .if_supports_color(Stream::Stderr, |s| s.bright_red())
        .to_string(),
      Severity::Info | Severity::Ignore => label,
    };
    eprintln!("{} {} - {}", timestamp, label, line);
  }
}

pub fn format_line(timestamp: &str, severity: Severity, line: &str) -> String {
  format!("{} {:>8} - {}", timestamp, severity.label(), line)
}
