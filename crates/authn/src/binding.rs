//! Certificate bindings and their refresh policy.
//!
//! A [`CertificateBinding`] is what callers use for an mTLS token request:
//! the certificate with its private key, the endpoint to send the request to,
//! and the client id the certificate was issued for. Bindings are immutable;
//! rotation replaces them wholesale.
//!
//! # Refresh policy
//!
//! ```text
//! refresh_at = not_after - min(20% × (not_after - minted_at), 24h)
//! half_life  = not_before + (not_after - not_before) / 2
//! ```

use chrono::{DateTime, Duration, Utc};
use mtls_binding_storage::ClientCertificate;
use uuid::Uuid;

/// Share of the certificate lifetime reserved for proactive rotation.
pub const REFRESH_FRACTION_PERCENT: i32 = 20;

/// Upper bound on the rotation window.
pub fn refresh_cap() -> Duration {
    Duration::hours(24)
}

/// A certificate ready for mTLS, with everything needed to use it.
#[derive(Debug, Clone)]
pub struct CertificateBinding {
    /// The certificate, with its private key attached.
    pub certificate: ClientCertificate,
    /// Base URL for mTLS token requests.
    pub endpoint: String,
    /// Canonical client id of the identity.
    pub client_id: Uuid,
    /// When this binding was minted (or, for durable hits, its `not_before`).
    pub minted_at: DateTime<Utc>,
}

impl CertificateBinding {
    /// End of the certificate's validity.
    #[must_use]
    pub fn not_after(&self) -> DateTime<Utc> {
        self.certificate.not_after()
    }

    /// When the binding should be rotated.
    #[must_use]
    pub fn refresh_at(&self) -> DateTime<Utc> {
        refresh_at(self.minted_at, self.not_after())
    }

    /// Whether `now` is at or past [`refresh_at`](Self::refresh_at).
    #[must_use]
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        needs_refresh(now, self.minted_at, self.not_after())
    }

    /// Whether `now` is past the midpoint of the validity window.
    #[must_use]
    pub fn is_beyond_half_life(&self, now: DateTime<Utc>) -> bool {
        is_beyond_half_life(now, self.certificate.not_before(), self.not_after())
    }
}

/// Rotation point for a certificate minted at `minted_at`.
#[must_use]
pub fn refresh_at(minted_at: DateTime<Utc>, not_after: DateTime<Utc>) -> DateTime<Utc> {
    let lifetime = (not_after - minted_at).max(Duration::zero());
    let window = (lifetime * REFRESH_FRACTION_PERCENT / 100).min(refresh_cap());
    not_after - window
}

/// Midpoint of `[not_before, not_after]`.
#[must_use]
pub fn half_life(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> DateTime<Utc> {
    not_before + (not_after - not_before) / 2
}

/// Whether `now` has reached the midpoint of the validity window.
#[must_use]
pub fn is_beyond_half_life(now: DateTime<Utc>, not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> bool {
    now >= half_life(not_before, not_after)
}

/// Whether `now` has reached the rotation point.
#[must_use]
pub fn needs_refresh(now: DateTime<Utc>, minted_at: DateTime<Utc>, not_after: DateTime<Utc>) -> bool {
    now >= refresh_at(minted_at, not_after)
}
