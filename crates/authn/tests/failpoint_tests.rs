#![cfg(feature = "failpoints")]
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
//! Integration tests for fail-point injection in the authn crate.
//!
//! These tests require the `failpoints` feature:
//! ```bash
//! cargo test -p mtls-binding-authn --features failpoints --test failpoint_tests
//! ```

mod common;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use common::{CountingMint, file_backed_cache};
use mtls_binding_authn::{AttestationCacheConfig, AttestationTokenCache, mint_token_fn};
use mtls_binding_storage::testutil::ManualClock;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn durable_read_failure_falls_back_to_mint() {
    let scenario = fail::FailScenario::setup();
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::at_epoch();
    let cancel = CancellationToken::new();

    let writer = file_backed_cache(dir.path(), clock.clone());
    let writer_mint = CountingMint::new(clock.clone(), 72);
    writer.get_or_create("identity", || writer_mint.mint(), &cancel).await.unwrap();

    fail::cfg("binding-cache-durable-read", "return").expect("failed to configure fail point");

    let reader = file_backed_cache(dir.path(), clock.clone());
    let reader_mint = CountingMint::new(clock.clone(), 72);
    let binding = reader.get_or_create("identity", || reader_mint.mint(), &cancel).await;

    assert!(binding.is_ok(), "a broken durable tier must not fail the caller");
    assert_eq!(reader_mint.calls(), 1);
    assert_eq!(reader.metrics().durable_hits, 0);

    scenario.teardown();
}

#[tokio::test]
async fn credential_store_add_failure_keeps_memory_binding() {
    let scenario = fail::FailScenario::setup();
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::at_epoch();
    let cancel = CancellationToken::new();

    fail::cfg("file-write-before-rename", "return").expect("failed to configure fail point");

    let cache = file_backed_cache(dir.path(), clock.clone());
    let mint = CountingMint::new(clock.clone(), 72);
    cache.get_or_create("identity", || mint.mint(), &cancel).await.unwrap();
    cache.get_or_create("identity", || mint.mint(), &cancel).await.unwrap();

    assert_eq!(mint.calls(), 1);
    assert_eq!(cache.metrics().memory_hits, 1);
    assert!(cache.durable_store().read("identity").await.is_none());

    scenario.teardown();
}

#[tokio::test]
async fn attestation_file_write_failure_is_swallowed() {
    let scenario = fail::FailScenario::setup();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("attestation.json");
    let config = AttestationCacheConfig::builder().file_path(path.clone()).build();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let mint = mint_token_fn(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Ok(format!("token-{n}")) }
    });

    fail::cfg("attestation-before-file-write", "return").expect("failed to configure fail point");

    let cache = AttestationTokenCache::new(config, ManualClock::at_epoch());
    let token = cache.get_or_create("key", mint, &CancellationToken::new()).await.unwrap();

    assert_eq!(token, "token-1");
    assert!(!path.exists());

    scenario.teardown();
}
