//! Private key handles attached to client certificates.
//!
//! A certificate is only worth caching or persisting while its private key can
//! still sign. Platform key stores can lose access to a key (for example after
//! a reboot invalidates a hardware-bound key guard), so usability is checked by
//! performing a trivial signature rather than by inspecting metadata.

use std::fmt;

use rsa::{
    Pkcs1v15Sign, RsaPrivateKey,
    pkcs8::{DecodePrivateKey, EncodePrivateKey},
    traits::PublicKeyParts,
};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{StorageError, StorageResult};

const PROBE_PAYLOAD: &[u8] = b"mtls-binding key probe";

/// A private key that a certificate binding can use for mTLS.
pub trait PrivateKeyHandle: Send + Sync + fmt::Debug {
    /// Signs a fixed payload to prove the key is still usable.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::KeyUnusable`] if the key cannot sign.
    fn sign_probe(&self) -> StorageResult<()>;

    /// Exports the key as PKCS#8 DER for durable persistence.
    ///
    /// Returns `None` for keys that are not exportable.
    fn export_pkcs8(&self) -> Option<Zeroizing<Vec<u8>>>;
}

/// In-process RSA private key. The key material is zeroized on drop.
pub struct RsaKeyHandle {
    key: RsaPrivateKey,
}

impl RsaKeyHandle {
    /// Wraps an RSA private key.
    #[must_use]
    pub fn new(key: RsaPrivateKey) -> Self {
        Self { key }
    }

    /// Loads a key from PKCS#8 DER.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::KeyUnusable`] if the bytes are not a valid RSA
    /// PKCS#8 document.
    pub fn from_pkcs8_der(der: &[u8]) -> StorageResult<Self> {
        RsaPrivateKey::from_pkcs8_der(der)
            .map(Self::new)
            .map_err(|e| StorageError::key_unusable(format!("invalid PKCS#8 key: {e}")))
    }

    /// Returns the wrapped key.
    #[must_use]
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.key
    }

    /// Modulus size in bits.
    #[must_use]
    pub fn bits(&self) -> usize {
        self.key.size() * 8
    }
}

impl fmt::Debug for RsaKeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaKeyHandle").field("bits", &self.bits()).finish_non_exhaustive()
    }
}

impl PrivateKeyHandle for RsaKeyHandle {
    fn sign_probe(&self) -> StorageResult<()> {
        let digest = Sha256::digest(PROBE_PAYLOAD);
        self.key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map(|_| ())
            .map_err(|e| StorageError::key_unusable_with_source("probe signature failed", e))
    }

    fn export_pkcs8(&self) -> Option<Zeroizing<Vec<u8>>> {
        match self.key.to_pkcs8_der() {
            Ok(doc) => Some(Zeroizing::new(doc.as_bytes().to_vec())),
            Err(e) => {
                tracing::debug!(error = %e, "RSA key export failed");
                None
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::testutil::test_rsa_key;

    #[test]
    fn test_rsa_probe_succeeds() {
        let handle = RsaKeyHandle::new(test_rsa_key());
        assert!(handle.sign_probe().is_ok());
        assert_eq!(handle.bits(), 2048);
    }

    #[test]
    fn test_pkcs8_round_trip_keeps_key_usable() {
        let handle = RsaKeyHandle::new(test_rsa_key());
        let exported = handle.export_pkcs8().expect("exportable");
        let reloaded = RsaKeyHandle::from_pkcs8_der(&exported).expect("reload");
        assert!(reloaded.sign_probe().is_ok());
        assert_eq!(reloaded.private_key(), handle.private_key());
    }

    #[test]
    fn test_garbage_pkcs8_rejected() {
        let result = RsaKeyHandle::from_pkcs8_der(b"not a key");
        assert!(matches!(result, Err(StorageError::KeyUnusable { .. })));
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let handle = RsaKeyHandle::new(test_rsa_key());
        let rendered = format!("{handle:?}");
        assert!(rendered.contains("bits: 2048"));
        assert!(!rendered.contains("primes"));
    }
}
