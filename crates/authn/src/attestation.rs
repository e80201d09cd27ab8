//! Attestation token cache with proactive background refresh.
//!
//! Tokens are opaque and carry no expiry, so every token is assumed to live
//! for [`AttestationCacheConfig::token_ttl`] from the moment it was minted.
//! Per key the cache moves through:
//!
//! ```text
//! Empty ──mint──► Valid ──refresh_on──► StaleButValid ──try gate──► Refreshing
//!                   ▲                                                 │    │
//!                   └───────────────────── mint ok ───────────────────┘    │
//!                                                                          │ mint err
//!                            RetryScheduled(now + retry_backoff) ◄─────────┘
//! ```
//!
//! Callers always get the current token while a refresh runs. Only a miss or
//! a token within `expiry_skew` of expiry makes a caller wait for a mint.
//!
//! A refresh is started either by a lookup past `refresh_on` or by the
//! wake-up task scheduled for `refresh_on`; both go through the same routine.
//! Background refreshes are detached from the caller's cancellation token.
//! A wake-up only re-mints a token that was read since it was cached; an
//! unread token is left to expire and is then evicted, which drops its mint
//! function and the key it holds. [`AttestationTokenCache::shutdown`] stops
//! all of them.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use fail::fail_point;
use moka::{
    ops::compute::{CompResult, Op},
    sync::Cache,
};
use mtls_binding_storage::{
    Clock, FileTokenCache, InterprocessLock, SystemClock, TokenRecord, to_chrono_duration,
    to_std_duration,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::AttestationCacheConfig,
    error::{AuthError, Result},
    gate::{GateGuard, GatePool},
};

/// Boxed future returned by a [`MintTokenFn`].
pub type TokenFuture = Pin<Box<dyn Future<Output = Result<String>> + Send>>;

/// Re-mints an attestation token without any caller context.
pub type MintTokenFn = Arc<dyn Fn() -> TokenFuture + Send + Sync>;

/// Wraps an async closure as a [`MintTokenFn`].
pub fn mint_token_fn<F, Fut>(mint: F) -> MintTokenFn
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String>> + Send + 'static,
{
    Arc::new(move || Box::pin(mint()))
}

struct Entry {
    token: String,
    expires_on: DateTime<Utc>,
    refresh_on: DateTime<Utc>,
    mint: MintTokenFn,
    /// Set by lookups; a wake-up skips the refresh while it is clear.
    read: AtomicBool,
}

impl Entry {
    fn new(token: String, expires_on: DateTime<Utc>, refresh_on: DateTime<Utc>, mint: MintTokenFn) -> Self {
        Self { token, expires_on, refresh_on, mint, read: AtomicBool::new(false) }
    }

    fn with_refresh_on(&self, refresh_on: DateTime<Utc>) -> Self {
        Self {
            token: self.token.clone(),
            expires_on: self.expires_on,
            refresh_on,
            mint: Arc::clone(&self.mint),
            read: AtomicBool::new(self.read.load(Ordering::Relaxed)),
        }
    }
}

type Entries = Cache<String, Arc<Entry>>;

/// Expires each token at its `expires_on`, measured on the injected clock.
struct TokenExpiry {
    clock: Arc<dyn Clock>,
}

impl TokenExpiry {
    fn remaining(&self, entry: &Entry) -> Duration {
        to_std_duration(entry.expires_on - self.clock.now())
    }
}

impl moka::Expiry<String, Arc<Entry>> for TokenExpiry {
    fn expire_after_create(&self, _key: &String, value: &Arc<Entry>, _created_at: Instant) -> Option<Duration> {
        Some(self.remaining(value))
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Arc<Entry>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(self.remaining(value))
    }
}

enum Lookup {
    Fresh(String),
    Stale(String),
    Miss,
}

/// Point-in-time view of [`AttestationTokenCache`] counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, bon::Builder)]
pub struct AttestationCacheMetrics {
    /// Lookups answered before `refresh_on`.
    #[builder(default)]
    pub hits: u64,
    /// Lookups answered past `refresh_on` (a refresh was requested).
    #[builder(default)]
    pub stale_hits: u64,
    /// Misses answered from the file tier.
    #[builder(default)]
    pub file_hits: u64,
    /// Mints on the caller's path.
    #[builder(default)]
    pub foreground_mints: u64,
    /// Mints started by a background refresh.
    #[builder(default)]
    pub background_refreshes: u64,
    /// Background refreshes that failed and were rescheduled.
    #[builder(default)]
    pub refresh_errors: u64,
    /// Tokens dropped at expiry by a wake-up.
    #[builder(default)]
    pub expired_evictions: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    file_hits: AtomicU64,
    foreground_mints: AtomicU64,
    background_refreshes: AtomicU64,
    refresh_errors: AtomicU64,
    expired_evictions: AtomicU64,
}

struct Inner {
    entries: Entries,
    gates: GatePool,
    clock: Arc<dyn Clock>,
    config: AttestationCacheConfig,
    file: Option<FileTokenCache>,
    shutdown: CancellationToken,
    counters: Counters,
}

/// TTL cache of attestation tokens keyed by key-handle identity.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct AttestationTokenCache {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AttestationTokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttestationTokenCache")
            .field("entries", &self.len())
            .field("config", &self.inner.config)
            .field("file_tier", &self.inner.file.as_ref().map(FileTokenCache::path))
            .finish()
    }
}

impl AttestationTokenCache {
    /// Creates a cache. The file tier is enabled when `config.file_path` is set.
    #[must_use]
    pub fn new(config: AttestationCacheConfig, clock: Arc<dyn Clock>) -> Self {
        let file = config.file_path.as_ref().map(|path| {
            FileTokenCache::new(path, InterprocessLock::new(config.lock_dir.clone()), Arc::clone(&clock))
        });
        Self {
            inner: Arc::new(Inner {
                entries: Cache::builder().expire_after(TokenExpiry { clock: Arc::clone(&clock) }).build(),
                gates: GatePool::new(),
                clock,
                config,
                file,
                shutdown: CancellationToken::new(),
                counters: Counters::default(),
            }),
        }
    }

    /// Creates a memory-only cache with default settings and the system clock.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(AttestationCacheConfig::default(), Arc::new(SystemClock))
    }

    /// Returns the token for `key`, minting with `mint` on a miss or when the
    /// cached token is about to expire.
    ///
    /// A token past its refresh point is returned as is and a background
    /// refresh is started. `mint` is kept and reused by later refreshes.
    ///
    /// # Errors
    ///
    /// Returns the mint error on the synchronous path, or
    /// [`AuthError::Cancelled`] if `cancel` fires first.
    #[tracing::instrument(skip(self, mint, cancel))]
    pub async fn get_or_create(
        &self,
        key: &str,
        mint: MintTokenFn,
        cancel: &CancellationToken,
    ) -> Result<String> {
        match self.inner.lookup(key) {
            Lookup::Fresh(token) => return Ok(token),
            Lookup::Stale(token) => {
                Inner::trigger_refresh(&self.inner, key);
                return Ok(token);
            },
            Lookup::Miss => {},
        }

        let gate = self.inner.gates.enter(key, cancel).await?;
        match self.inner.lookup(key) {
            Lookup::Fresh(token) => return Ok(token),
            Lookup::Stale(token) => {
                drop(gate);
                Inner::trigger_refresh(&self.inner, key);
                return Ok(token);
            },
            Lookup::Miss => {},
        }

        if let Some(token) = self.inner.lookup_file(key, &mint).await {
            return Ok(token);
        }

        let token = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(AuthError::Cancelled),
            result = mint() => result?,
        };
        self.inner.counters.foreground_mints.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(cache = "mint", "minted attestation token");
        Inner::store(&self.inner, key, token.clone(), mint).await;
        Ok(token)
    }

    /// Drops the token for `key` from memory and the file tier.
    #[tracing::instrument(skip(self))]
    pub async fn invalidate(&self, key: &str) {
        let removed = self.inner.entries.remove(key).is_some();
        if let Some(file) = &self.inner.file {
            file.remove(key).await;
        }
        tracing::info!(
            audit.action = "invalidate_attestation_token",
            audit.resource = %format_args!("attestation:{key}"),
            audit.result = "success",
            audit.memory_evicted = removed,
            "audit_event"
        );
    }

    /// Stops scheduled and in-flight background refreshes and drops every
    /// cached token. The file tier is left alone.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let evicted = self.len();
        self.inner.entries.invalidate_all();
        tracing::info!(evicted, "attestation token cache shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Expiry of the cached token for `key`.
    #[must_use]
    pub fn expires_on(&self, key: &str) -> Option<DateTime<Utc>> {
        self.inner.entries.get(key).map(|entry| entry.expires_on)
    }

    /// Next refresh point of the cached token for `key`.
    #[must_use]
    pub fn refresh_on(&self, key: &str) -> Option<DateTime<Utc>> {
        self.inner.entries.get(key).map(|entry| entry.refresh_on)
    }

    /// Number of cached tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.iter().count()
    }

    /// Whether no token is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.iter().next().is_none()
    }

    /// Current counters.
    #[must_use]
    pub fn metrics(&self) -> AttestationCacheMetrics {
        let c = &self.inner.counters;
        AttestationCacheMetrics {
            hits: c.hits.load(Ordering::Relaxed),
            stale_hits: c.stale_hits.load(Ordering::Relaxed),
            file_hits: c.file_hits.load(Ordering::Relaxed),
            foreground_mints: c.foreground_mints.load(Ordering::Relaxed),
            background_refreshes: c.background_refreshes.load(Ordering::Relaxed),
            refresh_errors: c.refresh_errors.load(Ordering::Relaxed),
            expired_evictions: c.expired_evictions.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn lookup(&self, key: &str) -> Lookup {
        let now = self.clock.now();
        let skew = to_chrono_duration(self.config.expiry_skew);
        match self.entries.get(key) {
            Some(entry) if now + skew >= entry.expires_on => {
                tracing::debug!(cache = "memory", expires_on = %entry.expires_on, "attestation token expired");
                Lookup::Miss
            },
            Some(entry) if now >= entry.refresh_on => {
                entry.read.store(true, Ordering::Relaxed);
                self.counters.stale_hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(cache = "memory", refresh_on = %entry.refresh_on, "attestation token due for refresh");
                Lookup::Stale(entry.token.clone())
            },
            Some(entry) => {
                entry.read.store(true, Ordering::Relaxed);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(cache = "memory", "cache hit");
                Lookup::Fresh(entry.token.clone())
            },
            None => {
                tracing::debug!(cache = "memory", "cache miss");
                Lookup::Miss
            },
        }
    }

    async fn lookup_file(self: &Arc<Self>, key: &str, mint: &MintTokenFn) -> Option<String> {
        let record = self.file.as_ref()?.read(key).await?;
        let now = self.clock.now();
        if now + to_chrono_duration(self.config.expiry_skew) >= record.expires_on_utc {
            return None;
        }
        self.counters.file_hits.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(cache = "file", expires_on = %record.expires_on_utc, "cache hit");

        let refresh_on = record.expires_on_utc - to_chrono_duration(self.config.token_ttl) / 2;
        self.entries.insert(
            key.to_owned(),
            Arc::new(Entry::new(record.token.clone(), record.expires_on_utc, refresh_on, Arc::clone(mint))),
        );
        Self::schedule(self, key, refresh_on);
        Some(record.token)
    }

    /// Caches a freshly minted token, mirrors it to the file tier and
    /// schedules its refresh.
    async fn store(self: &Arc<Self>, key: &str, token: String, mint: MintTokenFn) {
        let now = self.clock.now();
        let ttl = to_chrono_duration(self.config.token_ttl);
        let expires_on = now + ttl;
        let refresh_on = now + ttl / 2;
        self.entries.insert(key.to_owned(), Arc::new(Entry::new(token.clone(), expires_on, refresh_on, mint)));
        Self::schedule(self, key, refresh_on);
        self.write_file(key, token, expires_on, now).await;
    }

    async fn write_file(&self, key: &str, token: String, expires_on: DateTime<Utc>, now: DateTime<Utc>) {
        fail_point!("attestation-before-file-write", |_| ());
        if let Some(file) = &self.file {
            let record = TokenRecord { token, expires_on_utc: expires_on, cached_on_utc: now };
            if !file.write(key, record).await {
                tracing::debug!(cache = "file", "attestation token not mirrored to file tier");
            }
        }
    }

    /// Starts a background refresh for `key` unless one is already running.
    fn trigger_refresh(self: &Arc<Self>, key: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let Some(gate) = self.gates.try_enter(key) else {
            tracing::trace!("refresh already in progress");
            return;
        };
        let inner = Arc::clone(self);
        let key = key.to_owned();
        tokio::spawn(async move { inner.refresh(&key, gate).await });
    }

    async fn refresh(self: Arc<Self>, key: &str, _gate: GateGuard) {
        let now = self.clock.now();
        let skew = to_chrono_duration(self.config.expiry_skew);
        let Some(entry) = self.entries.get(key) else {
            return;
        };
        if now + skew >= entry.expires_on {
            self.evict_expired(key, now);
            return;
        }
        if now < entry.refresh_on {
            return;
        }
        if !entry.read.load(Ordering::Relaxed) {
            tracing::debug!(
                cache = "memory",
                expires_on = %entry.expires_on,
                "attestation token unread since cached, letting it expire"
            );
            Self::schedule(&self, key, entry.expires_on - skew);
            return;
        }
        let mint = Arc::clone(&entry.mint);
        drop(entry);

        self.counters.background_refreshes.fetch_add(1, Ordering::Relaxed);
        let result = tokio::select! {
            () = self.shutdown.cancelled() => return,
            result = mint() => result,
        };

        match result {
            Ok(token) => {
                tracing::debug!(cache = "mint", "attestation token refreshed in background");
                Self::store(&self, key, token, mint).await;
            },
            Err(e) => {
                self.counters.refresh_errors.fetch_add(1, Ordering::Relaxed);
                let retry_at = self.clock.now() + to_chrono_duration(self.config.retry_backoff);
                if let Some(entry) = self.entries.get(key) {
                    self.entries.insert(key.to_owned(), Arc::new(entry.with_refresh_on(retry_at)));
                }
                tracing::warn!(
                    error = %e,
                    retry_in = ?self.config.retry_backoff,
                    "background attestation refresh failed, keeping current token"
                );
                Self::schedule(&self, key, retry_at);
            },
        }
    }

    /// Removes `key` if its token is still the hard-expired one.
    fn evict_expired(&self, key: &str, now: DateTime<Utc>) {
        let skew = to_chrono_duration(self.config.expiry_skew);
        let result = self.entries.entry_by_ref(key).and_compute_with(|current| match current {
            Some(entry) if now + skew >= entry.value().expires_on => Op::Remove,
            _ => Op::Nop,
        });
        if matches!(result, CompResult::Removed(_)) {
            self.counters.expired_evictions.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(cache = "memory", "evicted expired attestation token");
        }
    }

    /// Wakes up at `at` and runs the refresh routine for `key`.
    fn schedule(self: &Arc<Self>, key: &str, at: DateTime<Utc>) {
        let delay = to_std_duration(at - self.clock.now());
        let weak: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let key = key.to_owned();
        tokio::spawn(async move {
            tokio::select! {
                () = shutdown.cancelled() => {},
                () = tokio::time::sleep(delay) => {
                    if let Some(inner) = weak.upgrade() {
                        Self::trigger_refresh(&inner, &key);
                    }
                },
            }
        });
    }
}
