//! Client certificate model.
//!
//! [`ClientCertificate`] is an immutable snapshot of an issued X.509
//! certificate plus, optionally, the private key it was issued for. Validity
//! bounds and subject common name are extracted once at construction so that
//! cache decisions never re-parse DER.

use std::{fmt, sync::Arc};

use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::{
    error::{StorageError, StorageResult},
    key::PrivateKeyHandle,
};

const PEM_LINE_WIDTH: usize = 64;

/// An issued client certificate and its (optional) private key.
///
/// Cloning is cheap. Clones share the private key handle; the key material is
/// released when the last clone is dropped.
#[derive(Clone)]
pub struct ClientCertificate {
    der: Arc<[u8]>,
    thumbprint: String,
    subject_common_name: Option<String>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    private_key: Option<Arc<dyn PrivateKeyHandle>>,
}

impl ClientCertificate {
    /// Parses a DER-encoded X.509 certificate.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`] if the bytes are not a valid
    /// certificate or carry out-of-range validity timestamps.
    pub fn from_der(der: &[u8]) -> StorageResult<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| StorageError::serialization(format!("invalid certificate DER: {e}")))?;

        let validity = cert.validity();
        let not_before = timestamp(validity.not_before.timestamp())?;
        let not_after = timestamp(validity.not_after.timestamp())?;
        let subject_common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_owned);

        Ok(Self {
            der: Arc::from(der),
            thumbprint: hex::encode(Sha256::digest(der)),
            subject_common_name,
            not_before,
            not_after,
            private_key: None,
        })
    }

    /// Parses a certificate given either as PEM or as base64-encoded DER.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Serialization`] if neither encoding yields a
    /// valid certificate.
    pub fn from_encoded(encoded: &str) -> StorageResult<Self> {
        let trimmed = encoded.trim();
        if trimmed.starts_with("-----BEGIN") {
            let (_, pem) = x509_parser::pem::parse_x509_pem(trimmed.as_bytes())
                .map_err(|e| StorageError::serialization(format!("invalid certificate PEM: {e}")))?;
            return Self::from_der(&pem.contents);
        }

        let compact: String = trimmed.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        let der = STANDARD
            .decode(compact)
            .map_err(|e| StorageError::serialization_with_source("invalid certificate base64", e))?;
        Self::from_der(&der)
    }

    /// Attaches the private key this certificate was issued for.
    #[must_use]
    pub fn with_private_key(mut self, key: Arc<dyn PrivateKeyHandle>) -> Self {
        self.private_key = Some(key);
        self
    }

    /// DER encoding of the certificate.
    #[must_use]
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// PEM encoding of the certificate.
    #[must_use]
    pub fn to_pem(&self) -> String {
        pem_encode("CERTIFICATE", &self.der)
    }

    /// Lowercase hex SHA-256 of the DER encoding.
    #[must_use]
    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    /// Subject common name, if present and printable.
    #[must_use]
    pub fn subject_common_name(&self) -> Option<&str> {
        self.subject_common_name.as_deref()
    }

    /// Start of the validity window.
    #[must_use]
    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    /// End of the validity window.
    #[must_use]
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Time left until `not_after`, negative once expired.
    #[must_use]
    pub fn remaining_lifetime(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.not_after - now
    }

    /// Whether `now` is at or past `not_after`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }

    /// The attached private key handle, if any.
    #[must_use]
    pub fn private_key(&self) -> Option<&Arc<dyn PrivateKeyHandle>> {
        self.private_key.as_ref()
    }

    /// Checks that a private key is attached and can still sign.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::KeyUnusable`] when no key is attached or the
    /// probe signature fails.
    pub fn check_private_key(&self) -> StorageResult<()> {
        match &self.private_key {
            Some(key) => key.sign_probe(),
            None => Err(StorageError::key_unusable("certificate has no private key")),
        }
    }

    /// Convenience wrapper around [`check_private_key`](Self::check_private_key).
    #[must_use]
    pub fn has_usable_private_key(&self) -> bool {
        self.check_private_key().is_ok()
    }
}

impl fmt::Debug for ClientCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertificate")
            .field("thumbprint", &self.thumbprint)
            .field("subject_common_name", &self.subject_common_name)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("has_private_key", &self.private_key.is_some())
            .finish()
    }
}

/// Wraps DER bytes in a PEM block with the given label.
#[must_use]
pub fn pem_encode(label: &str, der: &[u8]) -> String {
    let body = STANDARD.encode(der);
    let mut pem = String::with_capacity(body.len() + body.len() / PEM_LINE_WIDTH + 64);
    pem.push_str(&format!("-----BEGIN {label}-----\n"));
    for line in body.as_bytes().chunks(PEM_LINE_WIDTH) {
        // base64 output is ASCII
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str(&format!("-----END {label}-----\n"));
    pem
}

fn timestamp(secs: i64) -> StorageResult<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| {
        StorageError::serialization(format!("certificate timestamp {secs} out of range"))
    })
}
