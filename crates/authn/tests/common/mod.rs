//! Helpers shared by the authn integration tests.

#![allow(dead_code, clippy::expect_used)]

use std::{
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use mtls_binding_authn::{AuthError, BindingCache, CertificateBinding};
use mtls_binding_storage::{
    Clock, DurableCredentialStore, FileCredentialStore, InterprocessLock,
    testutil::{TEST_CLIENT_ID, TestKeyHandle, test_certificate_with_key},
};
use parking_lot::Mutex;
use uuid::Uuid;

pub const ENDPOINT: &str = "https://mtls.example.net";

/// A binding cache over a file store rooted at `root`. Two caches over the
/// same root behave like two processes sharing a user profile.
pub fn file_backed_cache(root: &Path, clock: Arc<dyn Clock>) -> BindingCache {
    let durable = DurableCredentialStore::new(
        Arc::new(FileCredentialStore::new(root.join("credentials"))),
        InterprocessLock::with_scopes(vec![root.join("locks")]),
        Arc::clone(&clock),
    );
    BindingCache::new(durable, clock)
}

/// Counts calls and hands out bindings with switchable keys.
#[derive(Debug)]
pub struct CountingMint {
    clock: Arc<dyn Clock>,
    lifetime_hours: i64,
    delay: Duration,
    calls: AtomicUsize,
    keys: Mutex<Vec<Arc<TestKeyHandle>>>,
}

impl CountingMint {
    pub fn new(clock: Arc<dyn Clock>, lifetime_hours: i64) -> Self {
        Self {
            clock,
            lifetime_hours,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            keys: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn key(&self, index: usize) -> Arc<TestKeyHandle> {
        Arc::clone(&self.keys.lock()[index])
    }

    pub async fn mint(&self) -> Result<CertificateBinding, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let key = Arc::new(TestKeyHandle::usable());
        self.keys.lock().push(Arc::clone(&key));

        let now = self.clock.now();
        Ok(CertificateBinding {
            certificate: test_certificate_with_key(
                TEST_CLIENT_ID,
                now,
                now + chrono::Duration::hours(self.lifetime_hours),
                key,
            ),
            endpoint: ENDPOINT.into(),
            client_id: Uuid::parse_str(TEST_CLIENT_ID).expect("GUID"),
            minted_at: now,
        })
    }
}

/// Polls `condition` for up to five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "condition not reached within 5s");
}
