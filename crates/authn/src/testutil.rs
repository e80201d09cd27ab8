//! Shared test utilities for the binding and attestation caches.
//!
//! Fakes for the issuer and attestation transports, counting mint functions,
//! and a polling helper for background work. Feature-gated behind `testutil`
//! so none of it reaches production builds.
//!
//! # Usage
//!
//! ```toml
//! [dev-dependencies]
//! mtls-binding-authn = { path = "../authn", features = ["testutil"] }
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use mtls_binding_storage::{
    Clock, RsaKeyHandle,
    testutil::{TEST_CLIENT_ID, self_signed_der, test_rsa_key, test_rsa_key_alt},
};
use parking_lot::Mutex;

use crate::{
    attestation::{AttestationTokenCache, MintTokenFn, mint_token_fn},
    config::AttestationCacheConfig,
    csr::{CsrSubject, CuId},
    error::{AuthError, Result},
    issuance::{
        AttestationProvider, CertificateIssuer, CertificateMinter, IssuanceRequest, IssuedCertificate,
        KeyFactory,
    },
};

/// Tenant used by [`test_minter`].
pub const TEST_TENANT_ID: &str = "72f988bf-86f1-41af-91ab-2d7cd011db47";

/// Endpoint returned by [`FakeIssuer`].
pub const TEST_ENDPOINT: &str = "https://mtls.example.net";

/// Polls `condition` until it holds.
///
/// # Panics
///
/// Panics if the condition does not hold within five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "condition not reached within 5s");
}

/// Attestation token mint that counts its calls and returns `token-<n>`.
#[derive(Debug, Clone, Default)]
pub struct CountingTokenMint {
    calls: Arc<AtomicUsize>,
    failures_left: Arc<AtomicUsize>,
}

impl CountingTokenMint {
    /// Creates a mint with no queued failures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` calls fail with [`AuthError::AttestationFailed`].
    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Number of calls so far, failed ones included.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The mint as a [`MintTokenFn`].
    pub fn as_fn(&self) -> MintTokenFn {
        let calls = Arc::clone(&self.calls);
        let failures_left = Arc::clone(&self.failures_left);
        mint_token_fn(move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            let fail = take_failure(&failures_left);
            async move {
                if fail {
                    Err(AuthError::attestation_failed(format!("injected failure on call {n}")))
                } else {
                    Ok(format!("token-{n}"))
                }
            }
        })
    }
}

fn take_failure(failures_left: &AtomicUsize) -> bool {
    failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1)).is_ok()
}

/// Issuer that signs nothing: it returns a self-signed certificate for
/// [`TEST_CLIENT_ID`] valid for a fixed lifetime from the clock's now.
#[derive(Debug)]
pub struct FakeIssuer {
    clock: Arc<dyn Clock>,
    lifetime: chrono::Duration,
    reported_client_id: String,
    calls: AtomicUsize,
    fail_status: Mutex<Option<u16>>,
    last_request: Mutex<Option<IssuanceRequest>>,
}

impl FakeIssuer {
    /// Issuer name reported in errors.
    pub const NAME: &'static str = "fake-issuer";
    /// Endpoint returned with every certificate.
    pub const ENDPOINT: &'static str = TEST_ENDPOINT;

    /// Creates an issuer of certificates valid for `lifetime`.
    pub fn new(clock: Arc<dyn Clock>, lifetime: chrono::Duration) -> Self {
        Self {
            clock,
            lifetime,
            reported_client_id: TEST_CLIENT_ID.into(),
            calls: AtomicUsize::new(0),
            fail_status: Mutex::new(None),
            last_request: Mutex::new(None),
        }
    }

    /// Reports `client_id` in the response while the certificate keeps
    /// [`TEST_CLIENT_ID`] as its subject.
    #[must_use]
    pub fn with_reported_client_id(mut self, client_id: &str) -> Self {
        self.reported_client_id = client_id.into();
        self
    }

    /// Makes every following call fail with `status`.
    pub fn fail_with_status(&self, status: u16) {
        *self.fail_status.lock() = Some(status);
    }

    /// Number of calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The most recent request.
    pub fn last_request(&self) -> Option<IssuanceRequest> {
        self.last_request.lock().clone()
    }
}

#[async_trait]
impl CertificateIssuer for FakeIssuer {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn issue(&self, request: IssuanceRequest) -> Result<IssuedCertificate> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock() = Some(request);
        if let Some(status) = *self.fail_status.lock() {
            return Err(AuthError::issuance_failed(Self::NAME, Some(status), "injected failure"));
        }

        let now = self.clock.now();
        let der = self_signed_der(TEST_CLIENT_ID, now, now + self.lifetime);
        Ok(IssuedCertificate {
            certificate: STANDARD.encode(der),
            client_id: self.reported_client_id.clone(),
            tenant_id: TEST_TENANT_ID.into(),
            endpoint: Self::ENDPOINT.into(),
            expires_in: self.lifetime.num_seconds(),
            refresh_in: self.lifetime.num_seconds() / 2,
        })
    }
}

/// Attestation provider returning `attestation-<n>`.
#[derive(Debug, Default)]
pub struct FakeAttestationProvider {
    calls: AtomicUsize,
}

impl FakeAttestationProvider {
    /// Creates a provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AttestationProvider for FakeAttestationProvider {
    async fn attest(&self, key: &RsaKeyHandle) -> Result<String> {
        if key.bits() < crate::csr::MIN_RSA_KEY_BITS {
            return Err(AuthError::attestation_failed("key too small"));
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("attestation-{n}"))
    }
}

/// A minter for [`TEST_CLIENT_ID`] that always signs with the bundled test
/// key instead of generating one.
pub fn test_minter(
    issuer: Arc<dyn CertificateIssuer>,
    clock: Arc<dyn Clock>,
    attestation: Option<Arc<dyn AttestationProvider>>,
) -> CertificateMinter {
    CertificateMinter::builder()
        .issuer(issuer)
        .subject(CsrSubject { client_id: TEST_CLIENT_ID.into(), tenant_id: TEST_TENANT_ID.into() })
        .cuid(CuId { vm_id: "vm-test".into(), vmss_id: None })
        .maybe_attestation(attestation)
        .attestation_cache(AttestationTokenCache::new(AttestationCacheConfig::default(), Arc::clone(&clock)))
        .key_factory(Arc::new(|| Ok::<_, AuthError>(test_rsa_key())))
        .clock(clock)
        .build()
}

/// Key factory alternating between the two bundled 2048-bit keys, so
/// consecutive mints sign with different keys.
pub fn alternating_key_factory() -> KeyFactory {
    let next = Arc::new(AtomicUsize::new(0));
    Arc::new(move || {
        let key = if next.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
            test_rsa_key()
        } else {
            test_rsa_key_alt()
        };
        Ok::<_, AuthError>(key)
    })
}

/// Asserts that a `Result` is an `Err` with the given [`AuthError`] variant.
///
/// Works with both tuple variants and struct variants.
///
/// # Examples
///
/// ```ignore
/// use mtls_binding_authn::{AuthError, assert_auth_error};
///
/// let result: Result<(), AuthError> = Err(AuthError::Cancelled);
/// assert_auth_error!(result, Cancelled);
/// ```
#[macro_export]
macro_rules! assert_auth_error {
    ($result:expr, $variant:ident) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "expected AuthError::{}, got: {:?}",
            stringify!($variant),
            $result,
        );
    };
    ($result:expr, $variant:ident, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::AuthError::$variant { .. })),
            "{}: expected AuthError::{}, got: {:?}",
            $msg,
            stringify!($variant),
            $result,
        );
    };
}
