//! Certificate mint pipeline.
//!
//! [`CertificateMinter::mint`] is the function handed to
//! [`BindingCache::get_or_create`](crate::BindingCache::get_or_create) on a
//! miss. It generates a key, obtains an attestation token for it, builds the
//! signing request, has the injected [`CertificateIssuer`] issue a
//! certificate and validates the answer:
//!
//! ```text
//! RSA-2048 keygen ──► attestation token (cached by key thumbprint)
//!        │                        │
//!        ▼                        ▼
//!  signing request ─────► CertificateIssuer::issue ──► validate ──► CertificateBinding
//! ```
//!
//! Each mint uses a fresh key, so the minter retires the previous key's
//! attestation token once the new key has one.
//!
//! The transports behind [`CertificateIssuer`] and [`AttestationProvider`]
//! are supplied by the caller.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use mtls_binding_storage::{Clock, ClientCertificate, RsaKeyHandle, SystemClock};
use parking_lot::Mutex;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::{
    attestation::{AttestationTokenCache, mint_token_fn},
    binding::CertificateBinding,
    csr::{
        CsrSubject, CuId, HashAlgorithm, MIN_RSA_KEY_BITS, SignaturePadding, build_signing_request,
        public_key_thumbprint,
    },
    error::{AuthError, Result},
};

/// What is sent to the issuer.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuanceRequest {
    /// PEM-encoded signing request.
    pub csr: String,
    /// Attestation token for the request's key, when attestation is in use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation_token: Option<String>,
}

impl fmt::Debug for IssuanceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuanceRequest")
            .field("csr_len", &self.csr.len())
            .field("attestation_token", &self.attestation_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// The issuer's answer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedCertificate {
    /// Certificate as PEM or base64 DER.
    pub certificate: String,
    /// Client id the certificate was issued for.
    pub client_id: String,
    /// Tenant of the identity.
    pub tenant_id: String,
    /// Base URL for mTLS token requests.
    #[serde(alias = "mtlsAuthenticationEndpoint")]
    pub endpoint: String,
    /// Seconds until the certificate expires.
    pub expires_in: i64,
    /// Seconds until the issuer suggests renewing.
    #[serde(default)]
    pub refresh_in: i64,
}

/// Transport that turns a signing request into a certificate.
#[async_trait]
pub trait CertificateIssuer: Send + Sync + fmt::Debug {
    /// Name used in errors and logs.
    fn name(&self) -> &str;

    /// Requests a certificate.
    ///
    /// # Errors
    ///
    /// Implementations return [`AuthError::IssuanceFailed`] or
    /// [`AuthError::InvalidIssuanceResponse`] with the transport status.
    async fn issue(&self, request: IssuanceRequest) -> Result<IssuedCertificate>;
}

/// Transport that mints an attestation token for a key.
#[async_trait]
pub trait AttestationProvider: Send + Sync + fmt::Debug {
    /// Mints a token proving `key` is held by this platform.
    ///
    /// # Errors
    ///
    /// Implementations return [`AuthError::AttestationFailed`].
    async fn attest(&self, key: &RsaKeyHandle) -> Result<String>;
}

/// Produces the private key for a new certificate.
pub type KeyFactory = Arc<dyn Fn() -> Result<RsaPrivateKey> + Send + Sync>;

/// Generates a fresh RSA key of [`MIN_RSA_KEY_BITS`] bits.
///
/// # Errors
///
/// Returns [`AuthError::InvalidKey`] if generation fails.
pub fn generate_rsa_key() -> Result<RsaPrivateKey> {
    RsaPrivateKey::new(&mut rand::thread_rng(), MIN_RSA_KEY_BITS)
        .map_err(|e| AuthError::invalid_key(format!("RSA key generation failed: {e}")))
}

/// Checks an issuer response and returns the client id and endpoint.
///
/// # Errors
///
/// Returns [`AuthError::InvalidIssuanceResponse`] naming `source_name` when
/// the certificate is empty, the client id is not a GUID, the endpoint is
/// not an absolute http(s) URL or `expires_in` is not positive.
pub fn validate_issued(issued: &IssuedCertificate, source_name: &str) -> Result<(Uuid, String)> {
    let invalid = |message: String| AuthError::invalid_issuance_response(source_name, None, message);

    if issued.certificate.trim().is_empty() {
        return Err(invalid("certificate is empty".into()));
    }
    let client_id = Uuid::parse_str(issued.client_id.trim())
        .map_err(|e| invalid(format!("client_id '{}' is not a GUID: {e}", issued.client_id)))?;
    let endpoint = Url::parse(issued.endpoint.trim())
        .map_err(|e| invalid(format!("endpoint '{}' is not a URL: {e}", issued.endpoint)))?;
    if !matches!(endpoint.scheme(), "https" | "http") || endpoint.host_str().is_none() {
        return Err(invalid(format!("endpoint '{}' is not an http(s) URL", issued.endpoint)));
    }
    if issued.expires_in <= 0 {
        return Err(invalid(format!("expires_in must be positive, got {}", issued.expires_in)));
    }
    Ok((client_id, issued.endpoint.trim().trim_end_matches('/').to_owned()))
}

/// Mints certificate bindings for one identity.
pub struct CertificateMinter {
    issuer: Arc<dyn CertificateIssuer>,
    subject: CsrSubject,
    cuid: CuId,
    attestation: Option<Arc<dyn AttestationProvider>>,
    attestation_cache: AttestationTokenCache,
    padding: SignaturePadding,
    key_factory: KeyFactory,
    clock: Arc<dyn Clock>,
    /// Thumbprint of the last key an attestation token was obtained for.
    attested_key: Mutex<Option<String>>,
}

impl fmt::Debug for CertificateMinter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateMinter")
            .field("issuer", &self.issuer.name())
            .field("subject", &self.subject)
            .field("attestation", &self.attestation.is_some())
            .field("padding", &self.padding)
            .finish_non_exhaustive()
    }
}

#[bon::bon]
impl CertificateMinter {
    /// Creates a minter.
    ///
    /// # Optional Fields
    ///
    /// * `attestation` - Provider for attestation tokens (default: none, no token sent).
    /// * `attestation_cache` - Cache for those tokens (default: memory-only, system clock).
    /// * `padding` - Signature padding of the request (default: PKCS#1 v1.5).
    /// * `key_factory` - Key source (default: [`generate_rsa_key`]).
    /// * `clock` - Time source (default: system clock).
    #[builder]
    pub fn new(
        issuer: Arc<dyn CertificateIssuer>,
        subject: CsrSubject,
        cuid: CuId,
        attestation: Option<Arc<dyn AttestationProvider>>,
        attestation_cache: Option<AttestationTokenCache>,
        #[builder(default)] padding: SignaturePadding,
        key_factory: Option<KeyFactory>,
        clock: Option<Arc<dyn Clock>>,
    ) -> Self {
        Self {
            issuer,
            subject,
            cuid,
            attestation,
            attestation_cache: attestation_cache.unwrap_or_else(AttestationTokenCache::with_defaults),
            padding,
            key_factory: key_factory.unwrap_or_else(|| Arc::new(generate_rsa_key) as KeyFactory),
            clock: clock.unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>),
            attested_key: Mutex::new(None),
        }
    }

    /// Runs the full pipeline and returns a new binding.
    ///
    /// # Errors
    ///
    /// Propagates key generation, signing request, attestation and issuer
    /// errors; returns [`AuthError::InvalidIssuanceResponse`] if the issued
    /// certificate does not parse, names a different client id, or is
    /// already expired.
    #[tracing::instrument(skip(self, cancel), fields(issuer = self.issuer.name()))]
    pub async fn mint(&self, cancel: &CancellationToken) -> Result<CertificateBinding> {
        let factory = Arc::clone(&self.key_factory);
        let key = tokio::task::spawn_blocking(move || factory())
            .await
            .map_err(|e| AuthError::invalid_key(format!("key generation task failed: {e}")))??;

        let request =
            build_signing_request(&key, &self.subject, &self.cuid, self.padding, HashAlgorithm::Sha256)?;
        let handle = Arc::new(RsaKeyHandle::new(key));
        let attestation_token = self.attestation_token(&handle, cancel).await?;

        let issued = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AuthError::Cancelled),
            result = self.issuer.issue(IssuanceRequest { csr: request.to_pem(), attestation_token }) => result?,
        };
        let source = self.issuer.name();
        let (client_id, endpoint) = validate_issued(&issued, source)?;

        let certificate = ClientCertificate::from_encoded(&issued.certificate)
            .map_err(|e| AuthError::invalid_issuance_response(source, None, e.to_string()))?
            .with_private_key(handle);
        let subject_id = certificate.subject_common_name().and_then(|cn| Uuid::parse_str(cn).ok());
        if subject_id != Some(client_id) {
            return Err(AuthError::invalid_issuance_response(
                source,
                None,
                format!("certificate subject does not match client_id {client_id}"),
            ));
        }

        let now = self.clock.now();
        if certificate.is_expired(now) {
            return Err(AuthError::invalid_issuance_response(source, None, "certificate is already expired"));
        }
        tracing::debug!(
            %client_id,
            not_after = %certificate.not_after(),
            refresh_in = issued.refresh_in,
            "certificate issued"
        );
        Ok(CertificateBinding { certificate, endpoint, client_id, minted_at: now })
    }

    async fn attestation_token(
        &self,
        handle: &Arc<RsaKeyHandle>,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let Some(provider) = &self.attestation else {
            return Ok(None);
        };
        let thumbprint = public_key_thumbprint(handle.private_key())?;
        let provider = Arc::clone(provider);
        let handle = Arc::clone(handle);
        let mint = mint_token_fn(move || {
            let provider = Arc::clone(&provider);
            let handle = Arc::clone(&handle);
            async move { provider.attest(&handle).await }
        });
        let token = self.attestation_cache.get_or_create(&thumbprint, mint, cancel).await?;

        let previous = self.attested_key.lock().replace(thumbprint.clone());
        if let Some(previous) = previous.filter(|previous| *previous != thumbprint) {
            self.attestation_cache.invalidate(&previous).await;
        }
        Ok(Some(token))
    }
}
