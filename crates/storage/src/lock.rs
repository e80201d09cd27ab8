//! Named interprocess lock.
//!
//! Serializes durable-store writes across processes that share one identity.
//! The lock is an advisory exclusive `flock` on a file whose name is derived
//! from the alias:
//!
//! ```text
//! <scope>/mtls-<first 32 hex chars of sha256(lowercase(trim(alias)))>.lock
//! ```
//!
//! Acquisition tries a system-wide scope first (shared temp directory) and
//! falls back to a per-user scope when the shared one is not accessible.
//! Waiting is bounded: on timeout the caller gets
//! [`StorageError::LockTimeout`] (or [`LockOutcome::NotAcquired`]) and is
//! expected to skip its best-effort work.
//!
//! # Abandoned locks
//!
//! The kernel drops an `flock` when the holding process exits, including on a
//! crash, so a lock abandoned by a dead holder is simply acquired by the next
//! caller. No stale-lock detection is needed.

use std::{
    fs::{File, OpenOptions},
    future::Future,
    path::{Path, PathBuf},
    time::Duration,
};

use fs2::FileExt;
use sha2::{Digest, Sha256};

use crate::error::{StorageError, StorageResult};

/// Timeout applied to durable-store writes. Not configurable.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(300);

/// Interval between acquisition attempts while the lock is held elsewhere.
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(25);

const LOCK_NAME_HEX_LEN: usize = 32;

/// Result of [`InterprocessLock::with_lock`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum LockOutcome<T> {
    /// The lock was held while `action` ran.
    Acquired(T),
    /// The lock was not obtained; `action` did not run.
    NotAcquired,
}

impl<T> LockOutcome<T> {
    /// Returns the action's output, if it ran.
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Acquired(value) => Some(value),
            Self::NotAcquired => None,
        }
    }
}

/// Factory for alias-scoped exclusive file locks.
#[derive(Debug, Clone)]
pub struct InterprocessLock {
    scopes: Vec<PathBuf>,
    poll_interval: Duration,
}

impl Default for InterprocessLock {
    fn default() -> Self {
        Self::with_scopes(default_scopes())
    }
}

impl InterprocessLock {
    /// Uses the default scopes, optionally replacing the per-user fallback
    /// with `local_dir`.
    #[must_use]
    pub fn new(local_dir: Option<PathBuf>) -> Self {
        match local_dir {
            Some(local) => Self::with_scopes(vec![global_scope(), local]),
            None => Self::default(),
        }
    }

    /// Uses exactly the given scope directories, tried in order.
    #[must_use]
    pub fn with_scopes(scopes: Vec<PathBuf>) -> Self {
        Self { scopes, poll_interval: LOCK_POLL_INTERVAL }
    }

    /// Scope directories in the order they are tried.
    #[must_use]
    pub fn scopes(&self) -> &[PathBuf] {
        &self.scopes
    }

    /// Acquires the lock for `alias`, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// - [`StorageError::LockTimeout`] if another holder kept the lock for the
    ///   whole timeout
    /// - [`StorageError::PermissionDenied`] or [`StorageError::Io`] if no scope
    ///   directory could host the lock file
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self, alias: &str, timeout: Duration) -> StorageResult<LockGuard> {
        let name = lock_name(alias);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut last_error = StorageError::unsupported("no lock scope configured");

        for scope in &self.scopes {
            let path = scope.join(&name);
            let file = match open_lock_file(scope, &path) {
                Ok(file) => file,
                Err(e) => {
                    tracing::debug!(scope = %scope.display(), error = %e, "lock scope unavailable");
                    last_error = e;
                    continue;
                },
            };

            loop {
                if FileExt::try_lock_exclusive(&file).is_ok() {
                    tracing::debug!(lock = %name, scope = %scope.display(), "lock acquired");
                    return Ok(LockGuard { file, path });
                }
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    tracing::debug!(lock = %name, "lock wait timed out");
                    return Err(StorageError::lock_timeout(name));
                }
                tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
            }
        }
        Err(last_error)
    }

    /// Runs `action` while holding the lock for `alias`.
    ///
    /// Never fails: if the lock cannot be obtained within `timeout` for any
    /// reason, returns [`LockOutcome::NotAcquired`] without running `action`.
    pub async fn with_lock<T, F, Fut>(&self, alias: &str, timeout: Duration, action: F) -> LockOutcome<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        match self.acquire(alias, timeout).await {
            Ok(guard) => {
                let output = action().await;
                drop(guard);
                LockOutcome::Acquired(output)
            },
            Err(e) => {
                tracing::debug!(error = %e, "skipping work guarded by interprocess lock");
                LockOutcome::NotAcquired
            },
        }
    }
}

/// Holds an interprocess lock; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release lock");
        }
    }
}

/// Derives the lock file name for `alias`.
#[must_use]
pub fn lock_name(alias: &str) -> String {
    let canonical = alias.trim().to_lowercase();
    let digest = hex::encode(Sha256::digest(canonical.as_bytes()));
    format!("mtls-{}.lock", &digest[..LOCK_NAME_HEX_LEN])
}

fn open_lock_file(scope: &Path, path: &Path) -> StorageResult<File> {
    std::fs::create_dir_all(scope)
        .map_err(|e| StorageError::io(format!("create lock scope {}", scope.display()), e))?;
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| StorageError::io(format!("open lock {}", path.display()), e))
}

fn global_scope() -> PathBuf {
    std::env::temp_dir().join("mtls-binding-locks")
}

fn local_scope() -> PathBuf {
    std::env::var_os("XDG_RUNTIME_DIR")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME")
                .filter(|v| !v.is_empty())
                .map(|home| PathBuf::from(home).join(".cache"))
        })
        .unwrap_or_else(std::env::temp_dir)
        .join("mtls-binding")
        .join("locks")
}

/// System-wide scope first, then the per-user fallback.
#[must_use]
pub fn default_scopes() -> Vec<PathBuf> {
    vec![global_scope(), local_scope()]
}
