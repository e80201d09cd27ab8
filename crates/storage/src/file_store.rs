//! File-backed credential store.
//!
//! Each record is one JSON document `<id>.json` in a user-private directory:
//!
//! ```json
//! { "tag": "MSAL|alias=...|ep=...", "certificate": "<base64 DER>", "private_key": "<base64 PKCS#8>" }
//! ```
//!
//! Files are written to a uniquely named temporary file and renamed into
//! place, so readers in other processes never observe a partial record.
//! On Unix the directory is created `0700` and record files `0600`.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use fail::fail_point;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use zeroize::Zeroizing;

use crate::{
    certificate::ClientCertificate,
    credential_store::{CredentialStore, StoredCredential},
    error::{StorageError, StorageResult},
    key::RsaKeyHandle,
};

const RECORD_EXTENSION: &str = "json";

#[derive(Serialize, Deserialize)]
struct FileRecord {
    tag: String,
    certificate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private_key: Option<String>,
}

impl Drop for FileRecord {
    fn drop(&mut self) {
        if let Some(key) = self.private_key.take() {
            drop(Zeroizing::new(key));
        }
    }
}

/// Credential store keeping one JSON file per record in a directory.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    /// Creates a store rooted at `dir`. The directory is created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the record files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{RECORD_EXTENSION}"))
    }

    async fn load(&self, path: &Path) -> StorageResult<StoredCredential> {
        let bytes = Zeroizing::new(
            tokio::fs::read(path)
                .await
                .map_err(|e| StorageError::io(format!("read {}", path.display()), e))?,
        );
        let record: FileRecord = serde_json::from_slice(&bytes)
            .map_err(|e| StorageError::serialization_with_source("corrupt credential record", e))?;

        let der = STANDARD
            .decode(&record.certificate)
            .map_err(|e| StorageError::serialization_with_source("certificate base64", e))?;
        let mut certificate = ClientCertificate::from_der(&der)?;

        if let Some(encoded) = &record.private_key {
            match STANDARD.decode(encoded).map(Zeroizing::new) {
                Ok(pkcs8) => match RsaKeyHandle::from_pkcs8_der(&pkcs8) {
                    Ok(key) => certificate = certificate.with_private_key(Arc::new(key)),
                    Err(e) => {
                        tracing::debug!(path = %path.display(), error = %e, "stored key unusable");
                    },
                },
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "stored key not base64");
                },
            }
        }

        let id = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(str::to_owned)
            .ok_or_else(|| StorageError::internal("record file name is not UTF-8"))?;
        Ok(StoredCredential { id, tag: record.tag.clone(), certificate })
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    fn name(&self) -> &'static str {
        "file"
    }

    #[tracing::instrument(skip(self), fields(dir = %self.dir.display()))]
    async fn enumerate(&self) -> StorageResult<Vec<StoredCredential>> {
        fail_point!("credential-store-enumerate", |_| {
            Err(StorageError::internal("injected enumerate failure"))
        });

        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io("list credential directory", e)),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io("list credential directory", e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            match self.load(&path).await {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable credential record");
                },
            }
        }
        Ok(records)
    }

    #[tracing::instrument(skip(self, certificate), fields(thumbprint = certificate.thumbprint()))]
    async fn add(&self, tag: &str, certificate: &ClientCertificate) -> StorageResult<String> {
        fail_point!("credential-store-add", |_| {
            Err(StorageError::internal("injected add failure"))
        });

        let key = certificate
            .private_key()
            .ok_or_else(|| StorageError::key_unusable("certificate has no private key"))?;
        let pkcs8 = key
            .export_pkcs8()
            .ok_or_else(|| StorageError::key_unusable("private key is not exportable"))?;

        let record = FileRecord {
            tag: tag.to_owned(),
            certificate: STANDARD.encode(certificate.der()),
            private_key: Some(STANDARD.encode(pkcs8.as_slice())),
        };
        let body = Zeroizing::new(
            serde_json::to_vec(&record)
                .map_err(|e| StorageError::serialization_with_source("encode credential record", e))?,
        );

        let id = uuid::Uuid::new_v4().simple().to_string();
        write_private_file(&self.record_path(&id), &body).await?;
        Ok(id)
    }

    #[tracing::instrument(skip(self))]
    async fn remove(&self, id: &str) -> StorageResult<()> {
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(StorageError::not_found(id));
        }
        match tokio::fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::not_found(id)),
            Err(e) => Err(StorageError::io(format!("remove record {id}"), e)),
        }
    }
}

/// Writes `bytes` to `path` via a temporary sibling file and an atomic rename.
///
/// The parent directory is created if missing. On Unix the directory is
/// restricted to the owner and the file is created `0600`.
pub(crate) async fn write_private_file(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StorageError::internal(format!("{} has no parent", path.display())))?;
    create_private_dir(parent).await?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| StorageError::internal(format!("{} has no file name", path.display())))?;
    let tmp = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));

    let result = async {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options
            .open(&tmp)
            .await
            .map_err(|e| StorageError::io(format!("create {}", tmp.display()), e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| StorageError::io(format!("write {}", tmp.display()), e))?;
        file.sync_all()
            .await
            .map_err(|e| StorageError::io(format!("sync {}", tmp.display()), e))?;
        drop(file);

        fail_point!("file-write-before-rename", |_| {
            Err(StorageError::internal("injected failure before rename"))
        });

        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| StorageError::io(format!("rename into {}", path.display()), e))
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

async fn create_private_dir(dir: &Path) -> StorageResult<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder
        .create(dir)
        .await
        .map_err(|e| StorageError::io(format!("create directory {}", dir.display()), e))
}
