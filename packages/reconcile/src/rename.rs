//! Renaming artifacts with bounded retry on file-lock contention.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Moves a file within a directory. Injectable so tests can simulate
/// locked files.
pub trait ArtifactRenamer {
    /// Renames `from` to `to`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
}

/// Renames through [`std::fs::rename`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FsRenamer;

impl ArtifactRenamer for FsRenamer {
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }
}

/// Retry limits for a contended rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenameRetry {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl Default for RenameRetry {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

/// The artifact stayed locked for every attempt.
#[derive(Debug, Error)]
#[error(
    "{} still locked after {attempts} attempt(s): {source}",
    .from.display()
)]
pub struct RenameContentionError {
    pub from: PathBuf,
    pub to: PathBuf,
    pub attempts: u32,
    pub source: io::Error,
}

/// Why an artifact could not be renamed.
#[derive(Debug, Error)]
pub enum RenameError {
    #[error(transparent)]
    Contention(#[from] RenameContentionError),

    /// A non-contention failure. Not retried.
    #[error("Failed to rename {} to {}: {source}", .from.display(), .to.display())]
    Io {
        from: PathBuf,
        to: PathBuf,
        source: io::Error,
    },
}

impl RenameError {
    /// The artifact that was not renamed.
    #[must_use]
    pub fn artifact(&self) -> &Path {
        match self {
            Self::Contention(e) => &e.from,
            Self::Io { from, .. } => from,
        }
    }
}

/// Whether an error means another process holds the file.
///
/// Covers permission denied and resource busy everywhere, plus the Windows
/// sharing (32) and lock (33) violations.
#[must_use]
pub fn is_contention(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::ResourceBusy
    ) || (cfg!(windows) && matches!(e.raw_os_error(), Some(32 | 33)))
}

/// Renames `from` to `to`, retrying contention errors per `retry`.
///
/// Sleeps the calling thread between attempts.
///
/// # Errors
///
/// * [`RenameError::Contention`] if every attempt hit contention
/// * [`RenameError::Io`] on the first non-contention error
pub fn rename_with_retry(
    renamer: &dyn ArtifactRenamer,
    from: &Path,
    to: &Path,
    retry: RenameRetry,
) -> Result<(), RenameError> {
    let attempts = retry.attempts.max(1);
    let mut attempt = 1;

    loop {
        match renamer.rename(from, to) {
            Ok(()) => return Ok(()),
            Err(source) if !is_contention(&source) => {
                return Err(RenameError::Io {
                    from: from.to_path_buf(),
                    to: to.to_path_buf(),
                    source,
                });
            }
            Err(source) if attempt >= attempts => {
                return Err(RenameContentionError {
                    from: from.to_path_buf(),
                    to: to.to_path_buf(),
                    attempts,
                    source,
                }
                .into());
            }
            Err(source) => {
                log::warn!(
                    "  {} is locked ({source}), attempt {attempt}/{attempts}, retrying in {:?}",
                    from.display(),
                    retry.delay
                );
                std::thread::sleep(retry.delay);
                attempt += 1;
            }
        }
    }
}
