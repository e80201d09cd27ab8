//! Durable credential store: selection, write-back and pruning.
//!
//! [`DurableCredentialStore`] layers the certificate-binding policy over a
//! raw [`CredentialStore`]:
//!
//! - **Read** picks, among records tagged for the alias, the one with the
//!   furthest `not_after` that still has at least [`MIN_REMAINING_LIFETIME`]
//!   left, a private key that can sign, and a subject CN that parses as a
//!   GUID (the canonical client id).
//! - **Write** runs under the [`InterprocessLock`] for the alias and never
//!   replaces a record that is at least as fresh as the new certificate.
//! - **Prune** removes records expired for longer than
//!   [`PRUNE_GRACE_PERIOD`] regardless of alias and, with
//!   [`PrunePolicy::KeepNewestOnly`], every other record for the alias.
//!
//! Every operation is best-effort. Failures are logged and reported as a
//! miss, a [`WriteOutcome`] skip, or a zero count. Nothing here returns an
//! error to the authentication path.
//!
//! ```text
//! write(alias, cert) ──► encode tag ──► probe key ──► lock(alias, 300ms)
//!                                                        │ timeout → Skipped
//!                                                        ▼
//!                                   enumerate ──► fresher exists? → Skipped
//!                                                        │
//!                                                        ▼
//!                                                 add ──► prune(policy)
//! ```

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    certificate::ClientCertificate,
    clock::{Clock, SystemClock, to_chrono_duration},
    credential_store::{CredentialStore, NoopCredentialStore, StoredCredential},
    lock::{DEFAULT_LOCK_TIMEOUT, InterprocessLock, LockOutcome},
    tag::{PersistedTag, decode_tag},
};

/// Records with less remaining lifetime than this are never returned.
pub const MIN_REMAINING_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Records expired for longer than this are pruned whatever their alias.
pub const PRUNE_GRACE_PERIOD: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Which records a prune pass removes besides long-expired ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrunePolicy {
    /// Keep only the newest record for the alias. Used after a foreground mint.
    KeepNewestOnly,
    /// Keep every record that is not past the grace window. Used for passive
    /// cleanup after a durable hit.
    PurgeStaleOnly,
}

/// A certificate recovered from the durable store.
#[derive(Debug, Clone)]
pub struct DurableRecord {
    /// Backend record identifier.
    pub record_id: String,
    /// The certificate, with a usable private key attached.
    pub certificate: ClientCertificate,
    /// Endpoint base recorded in the tag.
    pub endpoint_base: String,
    /// Client id re-derived from the subject CN.
    pub client_id: Uuid,
}

/// What a [`DurableCredentialStore::write`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum WriteOutcome {
    /// The record was added (and pruning ran).
    Written,
    /// A record for the alias at least as fresh already exists.
    SkippedExistingFresher,
    /// The interprocess lock was not acquired in time.
    SkippedLockUnavailable,
    /// The alias or endpoint cannot be placed in a tag.
    SkippedInvalidTag,
    /// The certificate has no usable private key.
    SkippedNoPrivateKey,
    /// The durable store is disabled.
    Disabled,
    /// The backend failed; see logs.
    Failed,
}

impl WriteOutcome {
    /// Whether a new record was persisted.
    #[must_use]
    pub fn is_written(self) -> bool {
        self == Self::Written
    }
}

/// Best-effort durable certificate store for one process.
#[derive(Debug, Clone)]
pub struct DurableCredentialStore {
    backend: Arc<dyn CredentialStore>,
    lock: InterprocessLock,
    clock: Arc<dyn Clock>,
    enabled: bool,
}

impl DurableCredentialStore {
    /// Creates an enabled store over `backend`.
    #[must_use]
    pub fn new(backend: Arc<dyn CredentialStore>, lock: InterprocessLock, clock: Arc<dyn Clock>) -> Self {
        Self { backend, lock, clock, enabled: true }
    }

    /// Creates a store that never reads or writes.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            backend: Arc::new(NoopCredentialStore),
            lock: InterprocessLock::default(),
            clock: Arc::new(SystemClock),
            enabled: false,
        }
    }

    /// Whether reads and writes reach the backend.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Backend name, for logs.
    #[must_use]
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Returns the freshest usable record for `alias`, if any.
    #[tracing::instrument(skip(self))]
    pub async fn read(&self, alias: &str) -> Option<DurableRecord> {
        if !self.enabled {
            return None;
        }
        let records = self.enumerate().await?;
        let now = self.clock.now();
        let min_remaining = to_chrono_duration(MIN_REMAINING_LIFETIME);

        let best = records
            .into_iter()
            .filter_map(|record| {
                let tag = decode_tag(&record.tag).filter(|tag| tag.alias == alias)?;
                if record.certificate.remaining_lifetime(now) < min_remaining {
                    return None;
                }
                let client_id = record
                    .certificate
                    .subject_common_name()
                    .and_then(|cn| Uuid::parse_str(cn).ok())?;
                if let Err(e) = record.certificate.check_private_key() {
                    tracing::debug!(record = %record.id, error = %e, "skipping record with unusable key");
                    return None;
                }
                Some(DurableRecord {
                    record_id: record.id,
                    certificate: record.certificate,
                    endpoint_base: tag.endpoint_base,
                    client_id,
                })
            })
            .max_by_key(|record| record.certificate.not_after());

        match &best {
            Some(record) => tracing::debug!(
                cache = "durable",
                record = %record.record_id,
                not_after = %record.certificate.not_after(),
                "durable store hit"
            ),
            None => tracing::debug!(cache = "durable", "durable store miss"),
        }
        best
    }

    /// Persists `certificate` for `alias` and prunes according to `policy`.
    #[tracing::instrument(skip(self, certificate), fields(thumbprint = certificate.thumbprint()))]
    pub async fn write(
        &self,
        alias: &str,
        certificate: &ClientCertificate,
        endpoint_base: &str,
        policy: PrunePolicy,
    ) -> WriteOutcome {
        if !self.enabled {
            return WriteOutcome::Disabled;
        }
        let tag = match PersistedTag::new(alias, endpoint_base).encode() {
            Ok(tag) => tag,
            Err(e) => {
                tracing::debug!(error = %e, "not persisting certificate");
                return WriteOutcome::SkippedInvalidTag;
            },
        };
        if let Err(e) = certificate.check_private_key() {
            tracing::debug!(error = %e, "not persisting certificate without usable key");
            return WriteOutcome::SkippedNoPrivateKey;
        }

        let outcome = self
            .lock
            .with_lock(alias, DEFAULT_LOCK_TIMEOUT, || {
                self.write_locked(alias, &tag, certificate, policy)
            })
            .await;
        match outcome {
            LockOutcome::Acquired(outcome) => outcome,
            LockOutcome::NotAcquired => {
                tracing::debug!("durable write skipped: lock unavailable");
                WriteOutcome::SkippedLockUnavailable
            },
        }
    }

    async fn write_locked(
        &self,
        alias: &str,
        tag: &str,
        certificate: &ClientCertificate,
        policy: PrunePolicy,
    ) -> WriteOutcome {
        let Some(mut records) = self.enumerate().await else {
            return WriteOutcome::Failed;
        };

        let fresher_exists = records.iter().any(|record| {
            is_for_alias(record, alias)
                && record.certificate.not_after() >= certificate.not_after()
                && record.certificate.has_usable_private_key()
        });
        if fresher_exists {
            tracing::debug!("durable write skipped: existing record is at least as fresh");
            return WriteOutcome::SkippedExistingFresher;
        }

        let id = match self.backend.add(tag, certificate).await {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!(store = self.backend.name(), error = %e, "durable write failed");
                return WriteOutcome::Failed;
            },
        };
        tracing::debug!(record = %id, "durable record written");

        records.push(StoredCredential { id: id.clone(), tag: tag.to_owned(), certificate: certificate.clone() });
        self.remove_all(alias, prune_candidates(&records, alias, policy, Some(&id), self.clock.now()))
            .await;
        WriteOutcome::Written
    }

    /// Prunes records under the alias lock. Returns the number removed.
    #[tracing::instrument(skip(self))]
    pub async fn prune(&self, alias: &str, policy: PrunePolicy) -> usize {
        if !self.enabled {
            return 0;
        }
        self.lock
            .with_lock(alias, DEFAULT_LOCK_TIMEOUT, || async {
                let Some(records) = self.enumerate().await else {
                    return 0;
                };
                let doomed = prune_candidates(&records, alias, policy, None, self.clock.now());
                self.remove_all(alias, doomed).await
            })
            .await
            .into_option()
            .unwrap_or(0)
    }

    /// Removes every record for `alias`. Returns the number removed.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, alias: &str) -> usize {
        if !self.enabled {
            return 0;
        }
        self.lock
            .with_lock(alias, DEFAULT_LOCK_TIMEOUT, || async {
                let Some(records) = self.enumerate().await else {
                    return 0;
                };
                let doomed =
                    records.iter().filter(|r| is_for_alias(r, alias)).map(|r| r.id.clone()).collect();
                self.remove_all(alias, doomed).await
            })
            .await
            .into_option()
            .unwrap_or(0)
    }

    async fn enumerate(&self) -> Option<Vec<StoredCredential>> {
        match self.backend.enumerate().await {
            Ok(records) => Some(records),
            Err(e) => {
                tracing::warn!(store = self.backend.name(), error = %e, "durable store unavailable");
                None
            },
        }
    }

    async fn remove_all(&self, alias: &str, ids: Vec<String>) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let mut removed = 0;
        for id in &ids {
            match self.backend.remove(id).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(record = %id, error = %e, "failed to remove durable record"),
            }
        }
        tracing::info!(
            audit.action = "prune_credentials",
            audit.resource = %format_args!("alias:{alias}"),
            audit.result = if removed == ids.len() { "success" } else { "partial" },
            audit.removed = removed,
            "audit_event"
        );
        removed
    }
}

fn is_for_alias(record: &StoredCredential, alias: &str) -> bool {
    decode_tag(&record.tag).is_some_and(|tag| tag.alias == alias)
}

/// Chooses which record ids a prune pass removes.
///
/// Only records carrying a decodable tag are considered. Any such record
/// expired for longer than [`PRUNE_GRACE_PERIOD`] is removed. Under
/// [`PrunePolicy::KeepNewestOnly`] every record for `alias` other than `keep`
/// (or, when `keep` is `None`, the newest one) is removed too.
#[must_use]
pub fn prune_candidates(
    records: &[StoredCredential],
    alias: &str,
    policy: PrunePolicy,
    keep: Option<&str>,
    now: DateTime<Utc>,
) -> Vec<String> {
    let grace = to_chrono_duration(PRUNE_GRACE_PERIOD);
    let keep = keep.map(str::to_owned).or_else(|| {
        records
            .iter()
            .filter(|r| is_for_alias(r, alias))
            .max_by_key(|r| r.certificate.not_after())
            .map(|r| r.id.clone())
    });

    records
        .iter()
        .filter_map(|record| {
            let tag = decode_tag(&record.tag)?;
            let long_expired = now - record.certificate.not_after() > grace;
            let superseded = policy == PrunePolicy::KeepNewestOnly
                && tag.alias == alias
                && keep.as_deref() != Some(record.id.as_str());
            (long_expired || superseded).then(|| record.id.clone())
        })
        .collect()
}
