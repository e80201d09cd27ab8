//! Process-local certificate binding cache.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use moka::{
    ops::compute::{CompResult, Op},
    sync::Cache,
};
use mtls_binding_storage::{Clock, MIN_REMAINING_LIFETIME, to_chrono_duration, to_std_duration};

use crate::binding::CertificateBinding;

/// Expires each binding at its certificate's `notAfter`, measured on the
/// injected clock when the entry is written.
struct NotAfterExpiry {
    clock: Arc<dyn Clock>,
}

impl NotAfterExpiry {
    fn remaining(&self, binding: &CertificateBinding) -> Duration {
        to_std_duration(binding.not_after() - self.clock.now())
    }
}

impl moka::Expiry<String, CertificateBinding> for NotAfterExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &CertificateBinding,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(self.remaining(value))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &CertificateBinding,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(self.remaining(value))
    }
}

/// In-memory map from cache key to [`CertificateBinding`].
///
/// Entries expire at `notAfter` without being looked up again, which releases
/// the private key. A lookup also checks expiry on the injected clock and
/// evicts on the spot. Bindings with less than [`MIN_REMAINING_LIFETIME`] left
/// are never admitted, which forces a fresh mint instead of caching a
/// certificate about to expire.
pub struct InMemoryCertificateCache {
    entries: Cache<String, CertificateBinding>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for InMemoryCertificateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCertificateCache").field("entries", &self.len()).finish_non_exhaustive()
    }
}

impl InMemoryCertificateCache {
    /// Creates an empty cache reading time from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let entries = Cache::builder().expire_after(NotAfterExpiry { clock: Arc::clone(&clock) }).build();
        Self { entries, clock }
    }

    /// Returns a clone of the binding for `key`, evicting it if expired.
    pub fn try_get(&self, key: &str) -> Option<CertificateBinding> {
        let now = self.clock.now();
        match self.entries.get(key) {
            None => return None,
            Some(binding) if now < binding.not_after() => return Some(binding),
            Some(_) => {},
        }
        // Only remove the entry if it is still the expired one; a concurrent
        // set may have replaced it.
        let result = self.entries.entry_by_ref(key).and_compute_with(|current| match current {
            Some(entry) if now >= entry.value().not_after() => Op::Remove,
            _ => Op::Nop,
        });
        if matches!(result, CompResult::Removed(_)) {
            tracing::debug!(cache = "memory", "evicted expired binding");
        }
        None
    }

    /// Caches `binding` under `key`. Returns `false` (and caches nothing) if
    /// the binding has too little lifetime left.
    pub fn set(&self, key: &str, binding: CertificateBinding) -> bool {
        let remaining = binding.certificate.remaining_lifetime(self.clock.now());
        if remaining < to_chrono_duration(MIN_REMAINING_LIFETIME) {
            tracing::debug!(
                cache = "memory",
                remaining_secs = remaining.num_seconds(),
                "not caching binding close to expiry"
            );
            return false;
        }
        self.entries.insert(key.to_owned(), binding);
        true
    }

    /// Removes the binding for `key`. Returns whether one was present.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Removes every binding. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let count = self.len();
        self.entries.invalidate_all();
        count
    }

    /// Number of live bindings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.iter().count()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().next().is_none()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use chrono::Duration;
    use mtls_binding_storage::testutil::{ManualClock, test_certificate, test_epoch};
    use uuid::Uuid;

    use super::*;

    fn binding(hours: i64) -> CertificateBinding {
        CertificateBinding {
            certificate: test_certificate(test_epoch(), test_epoch() + Duration::hours(hours)),
            endpoint: "https://mtls.example.net".into(),
            client_id: Uuid::nil(),
            minted_at: test_epoch(),
        }
    }

    #[test]
    fn test_set_then_get() {
        let cache = InMemoryCertificateCache::new(ManualClock::at_epoch());
        assert!(cache.set("k", binding(48)));
        let hit = cache.try_get("k").unwrap();
        assert_eq!(hit.endpoint, "https://mtls.example.net");
        assert!(cache.try_get("other").is_none());
    }

    #[test]
    fn test_refuses_short_lived_binding() {
        let cache = InMemoryCertificateCache::new(ManualClock::at_epoch());
        assert!(!cache.set("k", binding(23)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_expired_entry_is_evicted_on_lookup() {
        let clock = ManualClock::at_epoch();
        let cache = InMemoryCertificateCache::new(clock.clone());
        cache.set("k", binding(48));

        clock.advance(Duration::hours(47));
        assert!(cache.try_get("k").is_some());

        clock.advance(Duration::hours(1));
        assert!(cache.try_get("k").is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_expiry_follows_not_after_on_the_clock() {
        let clock = ManualClock::at_epoch();
        let expiry = NotAfterExpiry { clock: clock.clone() };
        let entry = binding(48);
        let key = "k".to_owned();

        let ttl = moka::Expiry::expire_after_create(&expiry, &key, &entry, Instant::now());
        assert_eq!(ttl, Some(std::time::Duration::from_secs(48 * 3600)));

        clock.advance(Duration::hours(50));
        let ttl = moka::Expiry::expire_after_update(&expiry, &key, &entry, Instant::now(), ttl);
        assert_eq!(ttl, Some(std::time::Duration::ZERO));
    }

    #[test]
    fn test_replace_remove_clear() {
        let cache = InMemoryCertificateCache::new(ManualClock::at_epoch());
        cache.set("a", binding(48));
        cache.set("a", binding(72));
        cache.set("b", binding(48));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.try_get("a").unwrap().not_after(), test_epoch() + Duration::hours(72));

        assert!(cache.remove("a"));
        assert!(!cache.remove("a"));
        assert_eq!(cache.clear(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_access() {
        let cache = Arc::new(InMemoryCertificateCache::new(ManualClock::at_epoch()));
        let template = binding(48);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                let template = template.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        let key = format!("key-{}", (i + j) % 4);
                        cache.set(&key, template.clone());
                        let _ = cache.try_get(&key);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 4);
    }
}
