//! Certificate binding orchestrator.
//!
//! [`BindingCache::get_or_create`] composes the in-memory cache, the per-key
//! gate pool and the durable credential store into one lookup:
//!
//! ```text
//! memory ──hit, key usable, before refresh_at──────────────────────► return
//!    │ miss / stale / key unusable (evict)
//!    ▼
//! gate(key) ──► memory again ──hit──────────────────────────────────► return
//!                  │ miss
//!                  ▼
//!              durable.read ──hit──► memory.set, prune(PurgeStaleOnly) ► return
//!                  │ miss
//!                  ▼
//!              mint() ──ok──► memory.set, durable.write(KeepNewestOnly) ► return
//!                  │ err
//!                  ▼
//!              stale binding still valid? ──yes──────────────────────► return
//!                  │ no
//!                  ▼
//!               error
//! ```
//!
//! Only the mint step can fail the call. Durable store problems degrade to a
//! miss or a skipped write.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use fail::fail_point;
use mtls_binding_storage::{Clock, DurableCredentialStore, PrunePolicy, SystemClock};
use tokio_util::sync::CancellationToken;

use crate::{
    binding::CertificateBinding,
    config::BindingCacheConfig,
    error::{AuthError, Result},
    gate::{GateGuard, GatePool},
    memory_cache::InMemoryCertificateCache,
};

/// Why a binding is being invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationReason {
    /// The private key can no longer sign.
    KeyUnusable,
    /// The token endpoint refused the certificate.
    RejectedByServer,
    /// The caller asked for a fresh certificate.
    Manual,
}

impl InvalidationReason {
    /// Whether durable copies of the certificate should go too.
    #[must_use]
    pub fn purges_durable_store(self) -> bool {
        matches!(self, Self::KeyUnusable | Self::RejectedByServer)
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::KeyUnusable => "key_unusable",
            Self::RejectedByServer => "rejected_by_server",
            Self::Manual => "manual",
        }
    }
}

/// Point-in-time view of [`BindingCache`] counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, bon::Builder)]
pub struct BindingCacheMetrics {
    /// Lookups answered from memory.
    #[builder(default)]
    pub memory_hits: u64,
    /// Lookups answered from the durable store.
    #[builder(default)]
    pub durable_hits: u64,
    /// Successful mints.
    #[builder(default)]
    pub mints: u64,
    /// Failed mints.
    #[builder(default)]
    pub mint_failures: u64,
    /// Failed mints answered with a stale but valid binding.
    #[builder(default)]
    pub stale_fallbacks: u64,
    /// Bindings evicted for an unusable key.
    #[builder(default)]
    pub key_evictions: u64,
}

impl BindingCacheMetrics {
    /// Lookups answered without minting.
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.memory_hits + self.durable_hits
    }
}

#[derive(Debug, Default)]
struct Counters {
    memory_hits: AtomicU64,
    durable_hits: AtomicU64,
    mints: AtomicU64,
    mint_failures: AtomicU64,
    stale_fallbacks: AtomicU64,
    key_evictions: AtomicU64,
}

enum MemoryLookup {
    Fresh(CertificateBinding),
    Stale(CertificateBinding),
    Miss,
}

/// Two-tier certificate binding cache with single-flight minting.
///
/// Construct one per process (or per test) and share it by reference; it
/// holds no global state.
#[derive(Debug)]
pub struct BindingCache {
    memory: InMemoryCertificateCache,
    gates: GatePool,
    durable: DurableCredentialStore,
    clock: Arc<dyn Clock>,
    gate_wait_timeout: Option<Duration>,
    counters: Counters,
}

impl BindingCache {
    /// Creates a cache over `durable`.
    #[must_use]
    pub fn new(durable: DurableCredentialStore, clock: Arc<dyn Clock>) -> Self {
        Self {
            memory: InMemoryCertificateCache::new(Arc::clone(&clock)),
            gates: GatePool::new(),
            durable,
            clock,
            gate_wait_timeout: None,
            counters: Counters::default(),
        }
    }

    /// Creates a cache with no durable tier.
    #[must_use]
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self::new(DurableCredentialStore::disabled(), clock)
    }

    /// Creates a cache from `config` using the system clock.
    #[must_use]
    pub fn from_config(config: &BindingCacheConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self::new(config.durable_store(Arc::clone(&clock)), clock)
            .with_gate_wait_timeout(config.gate_wait_timeout)
    }

    /// Caps how long a caller waits for another caller's mint of the same key.
    #[must_use]
    pub fn with_gate_wait_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.gate_wait_timeout = timeout;
        self
    }

    /// The durable tier.
    #[must_use]
    pub fn durable_store(&self) -> &DurableCredentialStore {
        &self.durable
    }

    /// Returns the binding for `key`, minting one with `mint` if no usable
    /// binding is cached in memory or in the durable store.
    ///
    /// Concurrent calls for the same key run `mint` at most once; the others
    /// wait on the key's gate and pick up the result from memory.
    ///
    /// # Errors
    ///
    /// Returns the mint error when minting fails and no unexpired binding is
    /// available, or [`AuthError::Cancelled`] if `cancel` fires while waiting
    /// for the gate or the mint.
    #[tracing::instrument(skip(self, mint, cancel))]
    pub async fn get_or_create<F, Fut>(
        &self,
        key: &str,
        mint: F,
        cancel: &CancellationToken,
    ) -> Result<CertificateBinding>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CertificateBinding>>,
    {
        if let MemoryLookup::Fresh(binding) = self.lookup_memory(key) {
            return Ok(binding);
        }
        tracing::debug!(cache = "memory", "cache miss");

        let _gate = self.enter_gate(key, cancel).await?;

        let stale = match self.lookup_memory(key) {
            MemoryLookup::Fresh(binding) => return Ok(binding),
            MemoryLookup::Stale(binding) => Some(binding),
            MemoryLookup::Miss => None,
        };

        if let Some(binding) = self.lookup_durable(key).await {
            return Ok(binding);
        }

        let minted = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AuthError::Cancelled),
            result = mint() => result,
        };

        match minted {
            Ok(binding) => {
                self.counters.mints.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    cache = "mint",
                    client_id = %binding.client_id,
                    not_after = %binding.not_after(),
                    "minted certificate binding"
                );
                self.memory.set(key, binding.clone());
                let outcome = self
                    .durable
                    .write(key, &binding.certificate, &binding.endpoint, PrunePolicy::KeepNewestOnly)
                    .await;
                tracing::debug!(cache = "durable", ?outcome, "durable write-back");
                Ok(binding)
            },
            Err(AuthError::Cancelled) => Err(AuthError::Cancelled),
            Err(e) => {
                self.counters.mint_failures.fetch_add(1, Ordering::Relaxed);
                match stale.filter(|binding| self.clock.now() < binding.not_after()) {
                    Some(binding) => {
                        self.counters.stale_fallbacks.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            error = %e,
                            not_after = %binding.not_after(),
                            "certificate rotation failed, serving existing binding"
                        );
                        Ok(binding)
                    },
                    None => Err(e),
                }
            },
        }
    }

    /// Drops the binding for `key`.
    ///
    /// For [`InvalidationReason::KeyUnusable`] and
    /// [`InvalidationReason::RejectedByServer`] the durable records for the
    /// key are removed as well, so other processes do not pick them up.
    ///
    /// Waits for an in-flight mint of `key` to finish first, so that mint
    /// cannot repopulate the cache afterwards.
    ///
    /// An audit event is emitted at INFO level.
    #[tracing::instrument(skip(self))]
    pub async fn invalidate(&self, key: &str, reason: InvalidationReason) {
        // Never cancelled, so the gate is always acquired.
        let _gate = self.gates.enter(key, &CancellationToken::new()).await.ok();
        let evicted = self.memory.remove(key);
        let purged = if reason.purges_durable_store() { self.durable.delete(key).await } else { 0 };

        tracing::info!(
            audit.action = "invalidate_binding",
            audit.resource = %format_args!("binding:{key}"),
            audit.result = "success",
            audit.reason = reason.as_str(),
            audit.memory_evicted = evicted,
            audit.durable_removed = purged,
            "audit_event"
        );
    }

    /// Drops every in-memory binding and its key material. Durable records
    /// are left alone.
    #[tracing::instrument(skip(self))]
    pub fn clear(&self) -> usize {
        let evicted = self.memory.clear();
        tracing::info!(
            audit.action = "clear_bindings",
            audit.resource = "all_bindings",
            audit.result = "success",
            audit.memory_evicted = evicted,
            "audit_event"
        );
        evicted
    }

    /// Number of bindings held in memory.
    #[must_use]
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    /// Whether no binding is held in memory.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// Current counters.
    #[must_use]
    pub fn metrics(&self) -> BindingCacheMetrics {
        let c = &self.counters;
        BindingCacheMetrics {
            memory_hits: c.memory_hits.load(Ordering::Relaxed),
            durable_hits: c.durable_hits.load(Ordering::Relaxed),
            mints: c.mints.load(Ordering::Relaxed),
            mint_failures: c.mint_failures.load(Ordering::Relaxed),
            stale_fallbacks: c.stale_fallbacks.load(Ordering::Relaxed),
            key_evictions: c.key_evictions.load(Ordering::Relaxed),
        }
    }

    async fn enter_gate(&self, key: &str, cancel: &CancellationToken) -> Result<GateGuard> {
        match self.gate_wait_timeout {
            Some(timeout) => self.gates.enter_with_timeout(key, cancel, timeout).await,
            None => self.gates.enter(key, cancel).await,
        }
    }

    fn lookup_memory(&self, key: &str) -> MemoryLookup {
        let Some(binding) = self.memory.try_get(key) else {
            return MemoryLookup::Miss;
        };
        if let Err(e) = binding.certificate.check_private_key() {
            self.memory.remove(key);
            self.counters.key_evictions.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(cache = "memory", error = %e, "evicted binding with unusable private key");
            return MemoryLookup::Miss;
        }
        if binding.needs_refresh(self.clock.now()) {
            tracing::debug!(cache = "memory", refresh_at = %binding.refresh_at(), "binding due for rotation");
            return MemoryLookup::Stale(binding);
        }
        self.counters.memory_hits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(cache = "memory", "cache hit");
        MemoryLookup::Fresh(binding)
    }

    async fn lookup_durable(&self, key: &str) -> Option<CertificateBinding> {
        fail_point!("binding-cache-durable-read", |_| None);

        let record = self.durable.read(key).await?;
        let binding = CertificateBinding {
            minted_at: record.certificate.not_before(),
            certificate: record.certificate,
            endpoint: record.endpoint_base,
            client_id: record.client_id,
        };
        if binding.needs_refresh(self.clock.now()) {
            return None;
        }
        self.counters.durable_hits.fetch_add(1, Ordering::Relaxed);
        self.memory.set(key, binding.clone());

        let durable = self.durable.clone();
        let alias = key.to_owned();
        tokio::spawn(async move {
            let removed = durable.prune(&alias, PrunePolicy::PurgeStaleOnly).await;
            if removed > 0 {
                tracing::debug!(cache = "durable", removed, "pruned stale records after durable hit");
            }
        });
        Some(binding)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use chrono::Duration as ChronoDuration;
    use mtls_binding_storage::{
        InterprocessLock, MemoryCredentialStore, PrivateKeyHandle,
        testutil::{
            ManualClock, TEST_CLIENT_ID, TestKeyHandle, test_certificate_with_key, test_epoch,
        },
    };
    use uuid::Uuid;

    use super::*;

    const ENDPOINT: &str = "https://mtls.example.net";

    fn binding_with(key: Arc<dyn PrivateKeyHandle>, hours: i64, clock: &ManualClock) -> CertificateBinding {
        let now = clock.now();
        CertificateBinding {
            certificate: test_certificate_with_key(
                TEST_CLIENT_ID,
                now,
                now + ChronoDuration::hours(hours),
                key,
            ),
            endpoint: ENDPOINT.into(),
            client_id: Uuid::parse_str(TEST_CLIENT_ID).unwrap(),
            minted_at: now,
        }
    }

    fn durable_cache(clock: Arc<ManualClock>) -> (BindingCache, Arc<MemoryCredentialStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryCredentialStore::new());
        let durable = DurableCredentialStore::new(
            backend.clone(),
            InterprocessLock::with_scopes(vec![dir.path().to_path_buf()]),
            clock.clone(),
        );
        (BindingCache::new(durable, clock), backend, dir)
    }

    #[tokio::test]
    async fn test_mints_once_then_serves_from_memory() {
        let clock = ManualClock::at_epoch();
        let cache = BindingCache::in_memory(clock.clone());
        let cancel = CancellationToken::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let binding = cache
                .get_or_create(
                    "id",
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(binding_with(Arc::new(TestKeyHandle::usable()), 48, &clock))
                    },
                    &cancel,
                )
                .await
                .unwrap();
            assert_eq!(binding.endpoint, ENDPOINT);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let metrics = cache.metrics();
        assert_eq!(metrics.mints, 1);
        assert_eq!(metrics.memory_hits, 2);
    }

    #[tokio::test]
    async fn test_mint_error_propagates_on_empty_cache() {
        let cache = BindingCache::in_memory(ManualClock::at_epoch());
        let result = cache
            .get_or_create(
                "id",
                || async { Err(AuthError::issuance_failed("issuer", Some(500), "boom")) },
                &CancellationToken::new(),
            )
            .await;
        crate::assert_auth_error!(result, IssuanceFailed);
        assert_eq!(cache.metrics().mint_failures, 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_unusable_key_is_evicted_and_reminted() {
        let clock = ManualClock::at_epoch();
        let cache = BindingCache::in_memory(clock.clone());
        let cancel = CancellationToken::new();
        let first_key = Arc::new(TestKeyHandle::usable());

        let first = cache
            .get_or_create("id", || async { Ok(binding_with(first_key.clone(), 48, &clock)) }, &cancel)
            .await
            .unwrap();
        first_key.set_usable(false);

        let second = cache
            .get_or_create(
                "id",
                || async { Ok(binding_with(Arc::new(TestKeyHandle::usable()), 72, &clock)) },
                &cancel,
            )
            .await
            .unwrap();

        assert_ne!(first.certificate.thumbprint(), second.certificate.thumbprint());
        assert!(second.certificate.has_usable_private_key());
        assert_eq!(cache.metrics().key_evictions, 1);
    }

    #[tokio::test]
    async fn test_rotation_after_refresh_point() {
        let clock = ManualClock::at_epoch();
        let cache = BindingCache::in_memory(clock.clone());
        let cancel = CancellationToken::new();

        let first = cache
            .get_or_create(
                "id",
                || async { Ok(binding_with(Arc::new(TestKeyHandle::usable()), 100, &clock)) },
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(first.refresh_at(), test_epoch() + ChronoDuration::hours(80));

        clock.advance(ChronoDuration::hours(80));
        let rotated = cache
            .get_or_create(
                "id",
                || async { Ok(binding_with(Arc::new(TestKeyHandle::usable()), 100, &clock)) },
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(rotated.minted_at, test_epoch() + ChronoDuration::hours(80));
        assert_eq!(cache.metrics().mints, 2);
    }

    #[tokio::test]
    async fn test_failed_rotation_serves_stale_binding() {
        let clock = ManualClock::at_epoch();
        let cache = BindingCache::in_memory(clock.clone());
        let cancel = CancellationToken::new();

        let first = cache
            .get_or_create(
                "id",
                || async { Ok(binding_with(Arc::new(TestKeyHandle::usable()), 100, &clock)) },
                &cancel,
            )
            .await
            .unwrap();

        clock.advance(ChronoDuration::hours(90));
        let served = cache
            .get_or_create(
                "id",
                || async { Err(AuthError::issuance_failed("issuer", Some(503), "down")) },
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(served.certificate.thumbprint(), first.certificate.thumbprint());
        assert_eq!(cache.metrics().stale_fallbacks, 1);
    }

    #[tokio::test]
    async fn test_cancelled_mint() {
        let cache = BindingCache::in_memory(ManualClock::at_epoch());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = cache
            .get_or_create("id", || std::future::pending::<Result<CertificateBinding>>(), &cancel)
            .await;
        crate::assert_auth_error!(result, Cancelled);
    }

    #[tokio::test]
    async fn test_durable_hit_skips_mint() {
        let clock = ManualClock::at_epoch();
        let (writer, backend, _dir) = durable_cache(clock.clone());
        let cancel = CancellationToken::new();

        let minted = writer
            .get_or_create(
                "id",
                || async { Ok(binding_with(Arc::new(TestKeyHandle::usable()), 72, &clock)) },
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(backend.len(), 1);

        // A second cache over the same backend stands in for a new process.
        let reader = BindingCache::new(writer.durable_store().clone(), clock.clone());
        let recovered = reader
            .get_or_create(
                "id",
                || async { Err(AuthError::attestation_failed("durable hit must not mint")) },
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(recovered.certificate.thumbprint(), minted.certificate.thumbprint());
        assert_eq!(recovered.endpoint, ENDPOINT);
        assert_eq!(recovered.client_id, minted.client_id);
        assert_eq!(reader.metrics().durable_hits, 1);
        assert_eq!(reader.metrics().mints, 0);
    }

    #[tokio::test]
    async fn test_invalidate_reasons() {
        let clock = ManualClock::at_epoch();
        let (cache, backend, _dir) = durable_cache(clock.clone());
        let cancel = CancellationToken::new();
        let mint = || async { Ok(binding_with(Arc::new(TestKeyHandle::usable()), 72, &clock)) };

        cache.get_or_create("id", mint, &cancel).await.unwrap();
        cache.invalidate("id", InvalidationReason::Manual).await;
        assert!(cache.is_empty());
        assert_eq!(backend.len(), 1);

        cache.get_or_create("id", mint, &cancel).await.unwrap();
        cache.invalidate("id", InvalidationReason::RejectedByServer).await;
        assert!(cache.is_empty());
        assert_eq!(backend.len(), 0);
    }

    #[tokio::test]
    async fn test_short_lived_mint_is_returned_but_not_cached() {
        let clock = ManualClock::at_epoch();
        let cache = BindingCache::in_memory(clock.clone());
        let binding = cache
            .get_or_create(
                "id",
                || async { Ok(binding_with(Arc::new(TestKeyHandle::usable()), 12, &clock)) },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(binding.endpoint, ENDPOINT);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear_reports_evictions() {
        let clock = ManualClock::at_epoch();
        let cache = BindingCache::in_memory(clock.clone());
        cache.memory.set("a", binding_with(Arc::new(TestKeyHandle::usable()), 48, &clock));
        cache.memory.set("b", binding_with(Arc::new(TestKeyHandle::usable()), 48, &clock));
        assert_eq!(cache.clear(), 2);
        assert!(cache.is_empty());
    }
}
