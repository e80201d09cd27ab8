//! Platform credential store capability.
//!
//! A [`CredentialStore`] is the process-external place where certificates and
//! their private keys survive restarts. The durable layer in
//! [`crate::durable`] only ever talks to this trait, so the platform-specific
//! backend is chosen once at startup by [`default_credential_store`]:
//!
//! | Backend | Use case |
//! |---------|----------|
//! | [`FileCredentialStore`](crate::file_store::FileCredentialStore) | Unix-like hosts (default) |
//! | [`MemoryCredentialStore`] | Tests |
//! | [`NoopCredentialStore`] | Unsupported platforms, or durable storage disabled |

use std::{collections::BTreeMap, fmt, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use fail::fail_point;
use parking_lot::RwLock;

use crate::{
    certificate::ClientCertificate,
    error::{StorageError, StorageResult},
};

/// A record as returned by [`CredentialStore::enumerate`].
#[derive(Debug, Clone)]
pub struct StoredCredential {
    /// Backend-assigned identifier, used for [`CredentialStore::remove`].
    pub id: String,
    /// Raw tag the record was written with.
    pub tag: String,
    /// The certificate, with its private key attached when the backend could
    /// load one.
    pub certificate: ClientCertificate,
}

/// Persistence capability for tagged client certificates.
///
/// Implementations make no policy decisions: selection, freshness checks and
/// pruning all live in [`DurableCredentialStore`](crate::durable::DurableCredentialStore).
#[async_trait]
pub trait CredentialStore: Send + Sync + fmt::Debug {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Lists every record in the store, including records written by other
    /// processes and records with foreign tags.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read at all. Individual
    /// unreadable records are skipped rather than failing the listing.
    async fn enumerate(&self) -> StorageResult<Vec<StoredCredential>>;

    /// Adds a certificate (with its private key) under `tag`.
    ///
    /// Returns the new record's identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::KeyUnusable`] if the private key is missing or
    /// cannot be exported, or a backend error if the write fails.
    async fn add(&self, tag: &str, certificate: &ClientCertificate) -> StorageResult<String>;

    /// Removes the record with the given identifier.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if no such record exists.
    async fn remove(&self, id: &str) -> StorageResult<()>;
}

/// In-memory credential store for tests.
///
/// Records keep their private key handle as-is, so a key disabled after the
/// write is observed as unusable on the next read.
#[derive(Debug, Default, Clone)]
pub struct MemoryCredentialStore {
    records: Arc<RwLock<BTreeMap<String, (String, ClientCertificate)>>>,
}

impl MemoryCredentialStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Inserts a record without the private-key check, for seeding tests with
    /// records a real backend would refuse.
    pub fn insert_raw(&self, tag: &str, certificate: ClientCertificate) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.records.write().insert(id.clone(), (tag.to_owned(), certificate));
        id
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn enumerate(&self) -> StorageResult<Vec<StoredCredential>> {
        fail_point!("credential-store-enumerate", |_| {
            Err(StorageError::internal("injected enumerate failure"))
        });
        let records = self.records.read();
        Ok(records
            .iter()
            .map(|(id, (tag, certificate))| StoredCredential {
                id: id.clone(),
                tag: tag.clone(),
                certificate: certificate.clone(),
            })
            .collect())
    }

    async fn add(&self, tag: &str, certificate: &ClientCertificate) -> StorageResult<String> {
        fail_point!("credential-store-add", |_| {
            Err(StorageError::internal("injected add failure"))
        });
        if certificate.private_key().is_none() {
            return Err(StorageError::key_unusable("certificate has no private key"));
        }
        Ok(self.insert_raw(tag, certificate.clone()))
    }

    async fn remove(&self, id: &str) -> StorageResult<()> {
        match self.records.write().remove(id) {
            Some(_) => Ok(()),
            None => Err(StorageError::not_found(id)),
        }
    }
}

/// Store for platforms without durable credential storage.
///
/// Reads are always empty and writes always fail with
/// [`StorageError::Unsupported`], which the durable layer treats as a skipped
/// best-effort write.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCredentialStore;

#[async_trait]
impl CredentialStore for NoopCredentialStore {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn enumerate(&self) -> StorageResult<Vec<StoredCredential>> {
        Ok(Vec::new())
    }

    async fn add(&self, _tag: &str, _certificate: &ClientCertificate) -> StorageResult<String> {
        Err(StorageError::unsupported("no durable credential store on this platform"))
    }

    async fn remove(&self, id: &str) -> StorageResult<()> {
        Err(StorageError::not_found(id))
    }
}

/// Selects the credential store backend for this platform.
///
/// Returns [`NoopCredentialStore`] when `enabled` is false or the platform
/// has no supported backend. On Unix-like hosts the default is a
/// [`FileCredentialStore`](crate::file_store::FileCredentialStore) rooted at
/// `dir`, or at [`default_store_dir`] when `dir` is `None`.
#[must_use]
pub fn default_credential_store(dir: Option<PathBuf>, enabled: bool) -> Arc<dyn CredentialStore> {
    if !enabled {
        tracing::debug!("durable credential store disabled");
        return Arc::new(NoopCredentialStore);
    }
    platform_store(dir)
}

#[cfg(unix)]
fn platform_store(dir: Option<PathBuf>) -> Arc<dyn CredentialStore> {
    let dir = dir.unwrap_or_else(default_store_dir);
    Arc::new(crate::file_store::FileCredentialStore::new(dir))
}

#[cfg(not(unix))]
fn platform_store(_dir: Option<PathBuf>) -> Arc<dyn CredentialStore> {
    tracing::debug!("no durable credential store backend for this platform");
    Arc::new(NoopCredentialStore)
}

/// Default directory for persisted credentials.
///
/// `$XDG_DATA_HOME/mtls-binding/credentials`, else
/// `$HOME/.local/share/mtls-binding/credentials`, else a directory under the
/// system temp dir.
#[must_use]
pub fn default_store_dir() -> PathBuf {
    let base = std::env::var_os("XDG_DATA_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME")
                .filter(|v| !v.is_empty())
                .map(|home| PathBuf::from(home).join(".local").join("share"))
        })
        .unwrap_or_else(std::env::temp_dir);
    base.join("mtls-binding").join("credentials")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::testutil::{test_certificate, test_epoch};

    fn cert() -> ClientCertificate {
        test_certificate(test_epoch(), test_epoch() + Duration::hours(48))
    }

    #[tokio::test]
    async fn test_memory_add_enumerate_remove() {
        let store = MemoryCredentialStore::new();
        let id = store.add("MSAL|alias=a|ep=https://x", &cert()).await.unwrap();

        let listed = store.enumerate().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].tag, "MSAL|alias=a|ep=https://x");
        assert!(listed[0].certificate.has_usable_private_key());

        store.remove(&id).await.unwrap();
        assert!(store.is_empty());
        assert!(matches!(store.remove(&id).await, Err(StorageError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_memory_rejects_keyless_certificate() {
        let store = MemoryCredentialStore::new();
        let der = cert().der().to_vec();
        let bare = ClientCertificate::from_der(&der).unwrap();
        let result = store.add("tag", &bare).await;
        assert!(matches!(result, Err(StorageError::KeyUnusable { .. })));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_noop_store_is_empty_and_refuses_writes() {
        let store = NoopCredentialStore;
        assert!(store.enumerate().await.unwrap().is_empty());
        assert!(matches!(store.add("tag", &cert()).await, Err(StorageError::Unsupported { .. })));
    }

    #[test]
    fn test_disabled_selects_noop() {
        let store = default_credential_store(None, false);
        assert_eq!(store.name(), "noop");
    }

    #[cfg(unix)]
    #[test]
    fn test_enabled_selects_file_store_on_unix() {
        let dir = tempfile::tempdir().unwrap();
        let store = default_credential_store(Some(dir.path().to_path_buf()), true);
        assert_eq!(store.name(), "file");
    }
}
