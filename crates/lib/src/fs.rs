//! Filesystem collaborators.
//!
//! Every operation logs what it does through the [`LogRouter`], honors dry
//! runs, and reports failures at a caller-chosen severity instead of
//! returning an error. A FATAL severity terminates the run the usual way.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::log::{LogRouter, Termination};
use crate::severity::Severity;

/// Backups kept when rotating an existing upload.
pub const MAX_BACKUPS: usize = 10;

/// Report `error` at `level`. Always yields `false` unless it terminates.
fn fail(log: &mut LogRouter, level: Severity, message: &str, error: &io::Error) -> Result<bool, Termination> {
  log.log(&format!("{}: {}", message, error), level)?;
  Ok(false)
}

/// Plain file operations. Each returns `Ok(true)` on success, `Ok(false)`
/// when the failure was logged at a non-fatal level.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileOps {
  pub noop: bool,
}

impl FileOps {
  pub fn new(noop: bool) -> Self {
    Self { noop }
  }

  pub fn mkdir_p(&self, log: &mut LogRouter, path: &Path, error_level: Severity) -> Result<bool, Termination> {
    if path.is_dir() {
      return Ok(true);
    }
    log.info(&format!("mkdir: {}", path.display()));
    if self.noop {
      return Ok(true);
    }
    match fs::create_dir_all(path) {
      Ok(()) => Ok(true),
      Err(e) => fail(log, error_level, &format!("Can't create directory {}", path.display()), &e),
    }
  }

  /// Remove a file or a whole directory tree. A missing path is not an error.
  pub fn rmtree(&self, log: &mut LogRouter, path: &Path, error_level: Severity) -> Result<bool, Termination> {
    log.info(&format!("rmtree: {}", path.display()));
    let Ok(meta) = fs::symlink_metadata(path) else {
      log.debug(&format!("{} doesn't exist.", path.display()));
      return Ok(true);
    };
    if self.noop {
      return Ok(true);
    }
    let removed = if meta.is_dir() {
      fs::remove_dir_all(path)
    } else {
      fs::remove_file(path)
    };
    match removed {
      Ok(()) => Ok(true),
      Err(e) => fail(log, error_level, &format!("Can't remove {}", path.display()), &e),
    }
  }

  pub fn copyfile(&self, log: &mut LogRouter, src: &Path, dest: &Path, error_level: Severity) -> Result<bool, Termination> {
    log.info(&format!("Copying {} to {}", src.display(), dest.display()));
    if self.noop {
      return Ok(true);
    }
    match fs::copy(src, dest) {
      Ok(bytes) => {
        debug!(src = %src.display(), dest = %dest.display(), bytes, "copied file");
        Ok(true)
      }
      Err(e) => fail(
        log,
        error_level,
        &format!("Can't copy {} to {}", src.display(), dest.display()),
        &e,
      ),
    }
  }

  pub fn move_path(&self, log: &mut LogRouter, src: &Path, dest: &Path, error_level: Severity) -> Result<bool, Termination> {
    log.info(&format!("Moving {} to {}", src.display(), dest.display()));
    if self.noop {
      return Ok(true);
    }
    match fs::rename(src, dest) {
      Ok(()) => Ok(true),
      Err(e) => fail(
        log,
        error_level,
        &format!("Can't move {} to {}", src.display(), dest.display()),
        &e,
      ),
    }
  }
}

/// Hands finished artifacts (logs, config snapshot, build products) over to
/// wherever uploads are collected.
pub trait ArtifactTransfer: std::fmt::Debug {
  /// Copy `target` into the upload area.
  ///
  /// `dest` is relative to the upload area; ending in `/` names a directory
  /// that keeps the target's file name, `None` uses the file name at the
  /// top. An existing destination is rotated when `rotate` is set and
  /// replaced otherwise. Returns the destination path, or `None` when the
  /// copy did not happen.
  fn copy_to_upload_dir(
    &self,
    log: &mut LogRouter,
    target: &Path,
    dest: Option<&str>,
    rotate: bool,
  ) -> Result<Option<PathBuf>, Termination>;
}

/// Upload area on the local filesystem.
#[derive(Debug, Clone)]
pub struct UploadDir {
  pub root: PathBuf,
  pub max_backups: usize,
  pub error_level: Severity,
  ops: FileOps,
}

impl UploadDir {
  pub fn new(root: impl Into<PathBuf>, noop: bool) -> Self {
    Self {
      root: root.into(),
      max_backups: MAX_BACKUPS,
      error_level: Severity::Error,
      ops: FileOps::new(noop),
    }
  }

  fn destination(&self, target: &Path, dest: Option<&str>) -> Option<PathBuf> {
    let file_name = target.file_name()?;
    Some(match dest {
      None => self.root.join(file_name),
      Some(dir) if dir.ends_with('/') => self.root.join(dir).join(file_name),
      Some(path) => self.root.join(path),
    })
  }

  /// Shift `dest.N-1` to `dest.N` down to `dest` itself becoming `dest.1`,
  /// dropping whatever would land past `max_backups`.
  fn rotate(&self, log: &mut LogRouter, dest: &Path) -> Result<bool, Termination> {
    let backup = |n: usize| {
      let mut name = dest.as_os_str().to_os_string();
      name.push(format!(".{}", n));
      PathBuf::from(name)
    };
    if self.max_backups == 0 {
      return self.ops.rmtree(log, dest, self.error_level);
    }

    let oldest = backup(self.max_backups);
    if oldest.exists() && !self.ops.rmtree(log, &oldest, self.error_level)? {
      return Ok(false);
    }
    for n in (1..self.max_backups).rev() {
      let from = backup(n);
      if from.exists() && !self.ops.move_path(log, &from, &backup(n + 1), self.error_level)? {
        return Ok(false);
      }
    }
    self.ops.move_path(log, dest, &backup(1), self.error_level)
  }
}

impl ArtifactTransfer for UploadDir {
  fn copy_to_upload_dir(
    &self,
    log: &mut LogRouter,
    target: &Path,
    dest: Option<&str>,
    rotate: bool,
  ) -> Result<Option<PathBuf>, Termination> {
    log.debug(&format!("Copying {} to upload dir", target.display()));
    if !target.exists() {
      log.log(&format!("{} doesn't exist!", target.display()), self.error_level)?;
      return Ok(None);
    }
    let Some(dest) = self.destination(target, dest) else {
      log.log(&format!("{} has no file name!", target.display()), self.error_level)?;
      return Ok(None);
    };
    if let Some(parent) = dest.parent() {
      if !self.ops.mkdir_p(log, parent, self.error_level)? {
        return Ok(None);
      }
    }

    if dest.exists() {
      if dest.is_dir() {
        log.log(&format!("{} exists and is a directory!", dest.display()), self.error_level)?;
        return Ok(None);
      }
      let cleared = if rotate {
        self.rotate(log, &dest)?
      } else {
        self.ops.rmtree(log, &dest, self.error_level)?
      };
      if !cleared {
        return Ok(None);
      }
    }

    if !self.ops.copyfile(log, target, &dest, self.error_level)? {
      return Ok(None);
    }
    Ok(Some(dest))
  }
}
