//! Durable file tier for attestation tokens.
//!
//! One JSON file holds a map from cache key to [`TokenRecord`]:
//!
//! ```json
//! { "<key>": { "Token": "...", "ExpiresOnUtc": "2030-01-01T08:00:00Z", "CachedOnUtc": "2030-01-01T00:00:00Z" } }
//! ```
//!
//! Writes happen under the interprocess lock for the file and go through a
//! temporary file plus atomic rename. A missing, empty or corrupt file reads as
//! an empty cache. Like the credential store, nothing here surfaces errors.

use std::{
    collections::BTreeMap,
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    clock::Clock,
    error::{StorageError, StorageResult},
    file_store::write_private_file,
    lock::{DEFAULT_LOCK_TIMEOUT, InterprocessLock, LockOutcome},
};

/// A cached attestation token.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TokenRecord {
    /// Opaque token value.
    pub token: String,
    /// When the token stops being valid.
    pub expires_on_utc: DateTime<Utc>,
    /// When the token was stored.
    pub cached_on_utc: DateTime<Utc>,
}

impl fmt::Debug for TokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenRecord")
            .field("token", &"<redacted>")
            .field("expires_on_utc", &self.expires_on_utc)
            .field("cached_on_utc", &self.cached_on_utc)
            .finish()
    }
}

type TokenMap = BTreeMap<String, TokenRecord>;

/// File-backed token cache shared by all processes using the same path.
#[derive(Debug, Clone)]
pub struct FileTokenCache {
    path: PathBuf,
    lock: InterprocessLock,
    clock: Arc<dyn Clock>,
}

impl FileTokenCache {
    /// Creates a cache over the file at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, lock: InterprocessLock, clock: Arc<dyn Clock>) -> Self {
        Self { path: path.into(), lock, clock }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the unexpired record for `key`, if any.
    #[tracing::instrument(skip(self))]
    pub async fn read(&self, key: &str) -> Option<TokenRecord> {
        let now = self.clock.now();
        let record = self.load().await.remove(key).filter(|record| record.expires_on_utc > now);
        tracing::debug!(cache = "file", hit = record.is_some(), "attestation file tier lookup");
        record
    }

    /// Stores `record` under `key`, dropping expired entries. Returns whether
    /// the file was updated.
    #[tracing::instrument(skip(self, record))]
    pub async fn write(&self, key: &str, record: TokenRecord) -> bool {
        self.update(|map, now| {
            map.retain(|_, existing| existing.expires_on_utc > now);
            map.insert(key.to_owned(), record);
        })
        .await
    }

    /// Removes `key`. Returns whether the file was updated.
    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, key: &str) -> bool {
        self.update(|map, _| {
            map.remove(key);
        })
        .await
    }

    async fn update(&self, apply: impl FnOnce(&mut TokenMap, DateTime<Utc>)) -> bool {
        let lock_alias = format!("token-file:{}", self.path.display());
        let outcome = self
            .lock
            .with_lock(&lock_alias, DEFAULT_LOCK_TIMEOUT, || async {
                let mut map = self.load().await;
                apply(&mut map, self.clock.now());
                self.store(&map).await
            })
            .await;

        match outcome {
            LockOutcome::Acquired(Ok(())) => true,
            LockOutcome::Acquired(Err(e)) => {
                tracing::warn!(path = %self.path.display(), error = %e, "attestation file tier write failed");
                false
            },
            LockOutcome::NotAcquired => {
                tracing::debug!(path = %self.path.display(), "attestation file tier write skipped: lock unavailable");
                false
            },
        }
    }

    async fn load(&self) -> TokenMap {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return TokenMap::new(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "attestation file tier unreadable");
                return TokenMap::new();
            },
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return TokenMap::new();
        }
        serde_json::from_slice(&bytes).unwrap_or_else(|e| {
            tracing::warn!(path = %self.path.display(), error = %e, "attestation file tier corrupt, treating as empty");
            TokenMap::new()
        })
    }

    async fn store(&self, map: &TokenMap) -> StorageResult<()> {
        let body = serde_json::to_vec_pretty(map)
            .map_err(|e| StorageError::serialization_with_source("encode token cache", e))?;
        write_private_file(&self.path, &body).await
    }
}
