//! End-to-end tests of the durable store over the file backend.
//!
//! Two `DurableCredentialStore` instances sharing one directory stand in for
//! two processes using the same identity.

#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

mod common;

use std::{path::Path, sync::Arc};

use common::{CLIENT_ID, ENDPOINT, certificate};
use mtls_binding_storage::{
    CredentialStore, DEFAULT_LOCK_TIMEOUT, DurableCredentialStore, FileCredentialStore,
    InterprocessLock, PrunePolicy, SystemClock, WriteOutcome,
};

fn process(root: &Path) -> (DurableCredentialStore, FileCredentialStore, InterprocessLock) {
    let backend = FileCredentialStore::new(root.join("credentials"));
    let lock = InterprocessLock::with_scopes(vec![root.join("locks")]);
    let store =
        DurableCredentialStore::new(Arc::new(backend.clone()), lock.clone(), Arc::new(SystemClock));
    (store, backend, lock)
}

#[tokio::test]
async fn record_written_by_one_process_is_read_by_another() {
    let dir = tempfile::tempdir().unwrap();
    let (writer, _, _) = process(dir.path());
    let (reader, _, _) = process(dir.path());

    let cert = certificate(72);
    let outcome = writer.write("identity", &cert, ENDPOINT, PrunePolicy::KeepNewestOnly).await;
    assert_eq!(outcome, WriteOutcome::Written);

    let record = reader.read("identity").await.expect("durable hit");
    assert_eq!(record.certificate.thumbprint(), cert.thumbprint());
    assert_eq!(record.client_id.to_string(), CLIENT_ID);
    assert_eq!(record.endpoint_base, ENDPOINT);
    assert!(record.certificate.has_usable_private_key());
}

#[tokio::test]
async fn freshest_record_wins_across_processes() {
    let dir = tempfile::tempdir().unwrap();
    let (a, backend, _) = process(dir.path());
    let (b, _, _) = process(dir.path());

    // Both processes minted without seeing each other; the durable store ends
    // up with two valid records.
    assert!(a.write("identity", &certificate(40), ENDPOINT, PrunePolicy::PurgeStaleOnly).await.is_written());
    let fresher = certificate(90);
    assert!(b.write("identity", &fresher, ENDPOINT, PrunePolicy::PurgeStaleOnly).await.is_written());
    assert_eq!(backend.enumerate().await.unwrap().len(), 2);

    assert_eq!(a.read("identity").await.unwrap().certificate.thumbprint(), fresher.thumbprint());

    assert_eq!(a.prune("identity", PrunePolicy::KeepNewestOnly).await, 1);
    let remaining = backend.enumerate().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].certificate.thumbprint(), fresher.thumbprint());
}

#[tokio::test]
async fn lock_held_by_another_process_skips_write() {
    let dir = tempfile::tempdir().unwrap();
    let (store, backend, _) = process(dir.path());
    let (_, _, other_lock) = process(dir.path());

    let _held = other_lock.acquire("identity", DEFAULT_LOCK_TIMEOUT).await.unwrap();
    let outcome = store.write("identity", &certificate(72), ENDPOINT, PrunePolicy::KeepNewestOnly).await;

    assert_eq!(outcome, WriteOutcome::SkippedLockUnavailable);
    assert!(backend.enumerate().await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_writers_leave_one_record() {
    let dir = tempfile::tempdir().unwrap();
    let cert = certificate(72);

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let (store, _, _) = process(dir.path());
        let cert = cert.clone();
        tasks.push(tokio::spawn(async move {
            store.write("identity", &cert, ENDPOINT, PrunePolicy::KeepNewestOnly).await
        }));
    }

    let mut written = 0;
    for task in tasks {
        match task.await.unwrap() {
            WriteOutcome::Written => written += 1,
            WriteOutcome::SkippedExistingFresher | WriteOutcome::SkippedLockUnavailable => {},
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(written, 1);

    let (_, backend, _) = process(dir.path());
    assert_eq!(backend.enumerate().await.unwrap().len(), 1);
}

#[tokio::test]
async fn delete_clears_identity() {
    let dir = tempfile::tempdir().unwrap();
    let (store, backend, _) = process(dir.path());
    store.write("identity", &certificate(72), ENDPOINT, PrunePolicy::KeepNewestOnly).await;
    store.write("other", &certificate(72), ENDPOINT, PrunePolicy::KeepNewestOnly).await;

    assert_eq!(store.delete("identity").await, 1);
    assert!(store.read("identity").await.is_none());
    assert_eq!(backend.enumerate().await.unwrap().len(), 1);
}
