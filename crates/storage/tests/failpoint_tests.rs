#![cfg(feature = "failpoints")]
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
//! Integration tests for fail-point injection.
//!
//! These tests require the `failpoints` feature:
//! ```bash
//! cargo test -p mtls-binding-storage --features failpoints --test failpoint_tests
//! ```

mod common;

use std::sync::Arc;

use common::{ENDPOINT, certificate};
use mtls_binding_storage::{
    CredentialStore, DurableCredentialStore, FileCredentialStore, InterprocessLock, PrunePolicy,
    SystemClock, WriteOutcome,
};

fn durable(root: &std::path::Path) -> (DurableCredentialStore, FileCredentialStore) {
    let backend = FileCredentialStore::new(root.join("credentials"));
    let lock = InterprocessLock::with_scopes(vec![root.join("locks")]);
    (DurableCredentialStore::new(Arc::new(backend.clone()), lock, Arc::new(SystemClock)), backend)
}

#[tokio::test]
async fn enumerate_failure_degrades_to_miss() {
    let scenario = fail::FailScenario::setup();
    let dir = tempfile::tempdir().unwrap();
    let (store, _) = durable(dir.path());
    assert!(store.write("identity", &certificate(72), ENDPOINT, PrunePolicy::KeepNewestOnly).await.is_written());

    fail::cfg("credential-store-enumerate", "return").expect("failed to configure fail point");

    assert!(store.read("identity").await.is_none(), "read should miss, not fail");
    let outcome = store.write("identity", &certificate(96), ENDPOINT, PrunePolicy::KeepNewestOnly).await;
    assert_eq!(outcome, WriteOutcome::Failed);
    assert_eq!(store.delete("identity").await, 0);

    scenario.teardown();
}

#[tokio::test]
async fn add_failure_is_reported_as_failed_write() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("credential-store-add", "return").expect("failed to configure fail point");

    let dir = tempfile::tempdir().unwrap();
    let (store, backend) = durable(dir.path());
    let outcome = store.write("identity", &certificate(72), ENDPOINT, PrunePolicy::KeepNewestOnly).await;

    assert_eq!(outcome, WriteOutcome::Failed);
    assert!(backend.enumerate().await.unwrap().is_empty());

    scenario.teardown();
}

#[tokio::test]
async fn crash_before_rename_leaves_no_partial_record() {
    let scenario = fail::FailScenario::setup();
    fail::cfg("file-write-before-rename", "return").expect("failed to configure fail point");

    let dir = tempfile::tempdir().unwrap();
    let (store, backend) = durable(dir.path());
    let outcome = store.write("identity", &certificate(72), ENDPOINT, PrunePolicy::KeepNewestOnly).await;
    assert_eq!(outcome, WriteOutcome::Failed);

    fail::remove("file-write-before-rename");
    assert!(backend.enumerate().await.unwrap().is_empty());
    let leftovers: Vec<_> = std::fs::read_dir(backend.dir()).unwrap().collect();
    assert!(leftovers.is_empty(), "temporary file should be cleaned up: {leftovers:?}");

    scenario.teardown();
}
