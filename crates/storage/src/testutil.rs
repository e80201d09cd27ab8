//! Shared test utilities for credential persistence testing.
//!
//! Helpers for building RSA keys, self-signed certificates with chosen
//! validity windows, key handles whose signing can be switched off, and a
//! manually advanced clock. Feature-gated behind `testutil` so none of it
//! reaches production builds.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! mtls-binding-storage = { path = "../storage", features = ["testutil"] }
//! ```
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use mtls_binding_storage::testutil::{ManualClock, test_certificate};
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rsa::{RsaPrivateKey, pkcs8::DecodePrivateKey};
use zeroize::Zeroizing;

use crate::{
    certificate::ClientCertificate,
    clock::Clock,
    error::{StorageError, StorageResult},
    key::{PrivateKeyHandle, RsaKeyHandle},
};

const RSA_2048_PEM: &str = include_str!("../testdata/rsa2048_pkcs8.pem");
const RSA_2048_ALT_PEM: &str = include_str!("../testdata/rsa2048_alt_pkcs8.pem");
const RSA_1024_PEM: &str = include_str!("../testdata/rsa1024_pkcs8.pem");

/// Canonical client id used as subject CN in test certificates.
pub const TEST_CLIENT_ID: &str = "6f1c2a9e-58e3-4b4a-9d35-1b8e3f1d2c11";

/// Returns a fixed 2048-bit RSA key.
///
/// Key generation is slow in debug builds, so every test shares one
/// pre-generated key.
///
/// # Panics
///
/// Panics if the bundled PEM fixture is corrupt.
pub fn test_rsa_key() -> RsaPrivateKey {
    RsaPrivateKey::from_pkcs8_pem(RSA_2048_PEM).expect("bundled 2048-bit test key")
}

/// Returns a second fixed 2048-bit RSA key, distinct from [`test_rsa_key`].
///
/// # Panics
///
/// Panics if the bundled PEM fixture is corrupt.
pub fn test_rsa_key_alt() -> RsaPrivateKey {
    RsaPrivateKey::from_pkcs8_pem(RSA_2048_ALT_PEM).expect("bundled alternate 2048-bit test key")
}

/// Returns a fixed 1024-bit RSA key, too small for signing requests.
///
/// # Panics
///
/// Panics if the bundled PEM fixture is corrupt.
pub fn test_rsa_key_1024() -> RsaPrivateKey {
    RsaPrivateKey::from_pkcs8_pem(RSA_1024_PEM).expect("bundled 1024-bit test key")
}

/// Start of the manual clock's timeline: 2030-01-01T00:00:00Z.
///
/// # Panics
///
/// Never in practice; the date is a valid constant.
pub fn test_epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).single().expect("valid epoch")
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Creates a clock fixed at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    /// Creates a clock fixed at [`test_epoch`].
    pub fn at_epoch() -> Arc<Self> {
        Arc::new(Self::new(test_epoch()))
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock() += by;
    }

    /// Jumps the clock to `at`.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// An RSA key handle whose probe signature can be made to fail.
///
/// Simulates a platform key that becomes inaccessible (for example a
/// hardware-bound key after reboot) while the certificate itself is intact.
#[derive(Debug)]
pub struct TestKeyHandle {
    inner: RsaKeyHandle,
    usable: AtomicBool,
}

impl TestKeyHandle {
    /// Creates a usable handle over [`test_rsa_key`].
    pub fn usable() -> Self {
        Self { inner: RsaKeyHandle::new(test_rsa_key()), usable: AtomicBool::new(true) }
    }

    /// Creates a handle whose probe already fails.
    pub fn unusable() -> Self {
        let handle = Self::usable();
        handle.set_usable(false);
        handle
    }

    /// Switches probe signing on or off.
    pub fn set_usable(&self, usable: bool) {
        self.usable.store(usable, Ordering::SeqCst);
    }
}

impl PrivateKeyHandle for TestKeyHandle {
    fn sign_probe(&self) -> StorageResult<()> {
        if !self.usable.load(Ordering::SeqCst) {
            return Err(StorageError::key_unusable("test key disabled"));
        }
        self.inner.sign_probe()
    }

    fn export_pkcs8(&self) -> Option<Zeroizing<Vec<u8>>> {
        self.inner.export_pkcs8()
    }
}

/// Builds a self-signed certificate DER with subject CN `cn` valid over
/// `[not_before, not_after]` (second precision).
///
/// # Panics
///
/// Panics if `rcgen` rejects the parameters.
pub fn self_signed_der(cn: &str, not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Vec<u8> {
    let mut params =
        rcgen::CertificateParams::new(Vec::<String>::new()).expect("certificate params");
    let mut name = rcgen::DistinguishedName::new();
    name.push(rcgen::DnType::CommonName, cn);
    params.distinguished_name = name;
    params.not_before = to_offset(not_before);
    params.not_after = to_offset(not_after);

    let signer = rcgen::KeyPair::generate().expect("ephemeral signer");
    let cert = params.self_signed(&signer).expect("self-signed certificate");
    cert.der().to_vec()
}

/// Builds a certificate for [`TEST_CLIENT_ID`] with a usable key attached.
pub fn test_certificate(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> ClientCertificate {
    test_certificate_with_key(TEST_CLIENT_ID, not_before, not_after, Arc::new(TestKeyHandle::usable()))
}

/// Builds a certificate with the given subject and key handle.
///
/// # Panics
///
/// Panics if the generated certificate cannot be parsed back.
pub fn test_certificate_with_key(
    cn: &str,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    key: Arc<dyn PrivateKeyHandle>,
) -> ClientCertificate {
    let der = self_signed_der(cn, not_before, not_after);
    ClientCertificate::from_der(&der).expect("parse generated certificate").with_private_key(key)
}

fn to_offset(at: DateTime<Utc>) -> time::OffsetDateTime {
    time::OffsetDateTime::from_unix_timestamp(at.timestamp()).expect("timestamp in range")
}
