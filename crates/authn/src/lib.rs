//! # mTLS Certificate Binding
//!
//! Mints, caches and rotates the short-lived client certificates a managed
//! identity uses for mTLS token acquisition, and caches the attestation
//! tokens needed to request them.
//!
//! This crate provides:
//! - **Signing requests**: PKCS#10 construction over RSA keys ([`csr`])
//! - **Binding cache**: memory → per-key gate → durable store → mint ([`BindingCache`])
//! - **Attestation token cache**: TTL cache with background refresh ([`AttestationTokenCache`])
//! - **Mint pipeline**: keygen, attestation, issuance and validation ([`CertificateMinter`])
//!
//! Persistence lives in `mtls-binding-storage` and is strictly best-effort:
//! the only errors a caller sees come from minting.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mtls_binding_authn::{
//!     BindingCache, BindingCacheConfig, CertificateIssuer, CertificateMinter, CsrSubject, CuId,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(issuer: Arc<dyn CertificateIssuer>) -> Result<(), Box<dyn std::error::Error>> {
//! let cache = BindingCache::from_config(&BindingCacheConfig::from_env());
//! let minter = CertificateMinter::builder()
//!     .issuer(issuer)
//!     .subject(CsrSubject { client_id: "<client id>".into(), tenant_id: "<tenant id>".into() })
//!     .cuid(CuId { vm_id: "<vm id>".into(), vmss_id: None })
//!     .build();
//!
//! let cancel = CancellationToken::new();
//! let binding = cache.get_or_create("<client id>", || minter.mint(&cancel), &cancel).await?;
//! println!("mTLS endpoint: {}", binding.endpoint);
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module (fake issuer and attestation provider,
//!   counting mint functions, `assert_auth_error!`).
//! - **`failpoints`**: Enables `fail` injection points here and in `mtls-binding-storage`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Attestation token cache.
pub mod attestation;
/// Certificate bindings and refresh policy.
pub mod binding;
/// Binding cache orchestrator.
pub mod binding_cache;
/// Cache configuration.
pub mod config;
/// PKCS#10 signing requests.
pub mod csr;
/// Authentication error types.
pub mod error;
/// Per-key gates.
pub mod gate;
/// Certificate mint pipeline.
pub mod issuance;
/// Process-local binding cache.
pub mod memory_cache;
/// Shared test utilities.
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;

// Re-export key types for convenience
pub use attestation::{AttestationCacheMetrics, AttestationTokenCache, MintTokenFn, mint_token_fn};
pub use binding::{CertificateBinding, half_life, is_beyond_half_life, needs_refresh, refresh_at};
pub use binding_cache::{BindingCache, BindingCacheMetrics, InvalidationReason};
pub use config::{AttestationCacheConfig, BindingCacheConfig, DISABLE_DURABLE_STORE_ENV};
pub use csr::{
    CsrSubject, CuId, HashAlgorithm, SignaturePadding, SigningRequest, build_signing_request,
};
pub use error::{AuthError, Result};
pub use gate::{GateGuard, GatePool};
pub use issuance::{
    AttestationProvider, CertificateIssuer, CertificateMinter, IssuanceRequest, IssuedCertificate,
    validate_issued,
};
pub use memory_cache::InMemoryCertificateCache;
