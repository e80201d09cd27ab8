//! Durable persistence for mTLS certificate bindings.
//!
//! This crate holds everything that touches state outside the current
//! process: the platform credential store, the cross-process lock that
//! serializes writes to it, and the file tier of the attestation token cache.
//! The in-process caches and the mint pipeline live in `mtls-binding-authn`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  mtls-binding-authn                          │
//! │        BindingCache            AttestationTokenCache         │
//! ├──────────────────────────────┬───────────────────────────────┤
//! │   DurableCredentialStore     │        FileTokenCache         │
//! │ (select freshest, prune,     │  (JSON map, atomic rename)    │
//! │  best-effort, never throws)  │                               │
//! ├──────────────────────────────┴───────────────────────────────┤
//! │          InterprocessLock (flock, 300ms bounded wait)        │
//! ├──────────────────────────────────────────────────────────────┤
//! │                   CredentialStore trait                      │
//! │   FileCredentialStore │ MemoryCredentialStore │ Noop          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Records are scoped to an identity by a tag (see [`tag`]). Every operation
//! above the [`CredentialStore`] trait is best-effort: failures degrade to a
//! cache miss or a skipped write and are only visible in logs.
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module (manual clock, test RSA keys, self-signed
//!   certificates with chosen validity, switchable key handles).
//! - **`failpoints`**: Enables `fail` injection points in the credential stores.

#![deny(unsafe_code)]

pub mod certificate;
pub mod clock;
pub mod credential_store;
pub mod durable;
pub mod error;
pub mod file_store;
pub mod key;
pub mod lock;
pub mod tag;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod token_file;

pub use certificate::{ClientCertificate, pem_encode};
pub use clock::{Clock, SystemClock, to_chrono_duration, to_std_duration};
pub use credential_store::{
    CredentialStore, MemoryCredentialStore, NoopCredentialStore, StoredCredential,
    default_credential_store, default_store_dir,
};
pub use durable::{
    DurableCredentialStore, DurableRecord, MIN_REMAINING_LIFETIME, PRUNE_GRACE_PERIOD, PrunePolicy,
    WriteOutcome,
};
pub use error::{BoxError, StorageError, StorageResult};
pub use file_store::FileCredentialStore;
pub use key::{PrivateKeyHandle, RsaKeyHandle};
pub use lock::{DEFAULT_LOCK_TIMEOUT, InterprocessLock, LockGuard, LockOutcome, lock_name};
pub use tag::{PersistedTag, TAG_PREFIX, decode_tag, encode_tag};
pub use token_file::{FileTokenCache, TokenRecord};
pub use zeroize::Zeroizing;
