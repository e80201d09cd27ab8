//! Cache configuration.
//!
//! Both configs can be built in code with their `bon` builders or
//! deserialized, with durations written in humantime form (`"8h"`, `"15m"`).
//! The refresh policy, minimum lifetime and prune grace window are fixed and
//! deliberately absent here.

use std::{path::PathBuf, sync::Arc, time::Duration};

use mtls_binding_storage::{
    Clock, DurableCredentialStore, InterprocessLock, default_credential_store,
};
use serde::{Deserialize, Serialize};

/// Environment variable that turns the durable credential store off.
pub const DISABLE_DURABLE_STORE_ENV: &str = "MTLS_BINDING_DISABLE_DURABLE_STORE";

/// Configuration for [`BindingCache`](crate::BindingCache).
#[derive(Debug, Clone, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BindingCacheConfig {
    /// Persist bindings in the durable credential store.
    #[serde(default = "default_durable_store_enabled")]
    #[builder(default = default_durable_store_enabled())]
    pub durable_store_enabled: bool,

    /// Directory for the file-backed credential store. Defaults to the
    /// per-user data directory.
    #[serde(default)]
    pub store_dir: Option<PathBuf>,

    /// Extra lock directory tried after the system-wide one.
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,

    /// Upper bound on waiting for another caller's mint of the same key.
    /// `None` waits until the caller cancels.
    #[serde(default, with = "humantime_serde")]
    pub gate_wait_timeout: Option<Duration>,
}

fn default_durable_store_enabled() -> bool {
    true
}

impl Default for BindingCacheConfig {
    fn default() -> Self {
        Self {
            durable_store_enabled: default_durable_store_enabled(),
            store_dir: None,
            lock_dir: None,
            gate_wait_timeout: None,
        }
    }
}

impl BindingCacheConfig {
    /// Default configuration with [`DISABLE_DURABLE_STORE_ENV`] applied.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_toggle(std::env::var(DISABLE_DURABLE_STORE_ENV).ok().as_deref())
    }

    /// Applies the value of the disable toggle, if set.
    #[must_use]
    pub fn with_env_toggle(mut self, value: Option<&str>) -> Self {
        if value.is_some_and(is_truthy) {
            tracing::info!(env = DISABLE_DURABLE_STORE_ENV, "durable credential store disabled");
            self.durable_store_enabled = false;
        }
        self
    }

    /// Builds the durable store this configuration describes.
    #[must_use]
    pub fn durable_store(&self, clock: Arc<dyn Clock>) -> DurableCredentialStore {
        if !self.durable_store_enabled {
            return DurableCredentialStore::disabled();
        }
        let backend = default_credential_store(self.store_dir.clone(), true);
        DurableCredentialStore::new(backend, InterprocessLock::new(self.lock_dir.clone()), clock)
    }
}

/// Whether an environment value reads as "on".
#[must_use]
pub fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// Configuration for [`AttestationTokenCache`](crate::AttestationTokenCache).
#[derive(Debug, Clone, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttestationCacheConfig {
    /// Assumed token lifetime. The provider does not report one.
    #[serde(with = "humantime_serde", default = "default_token_ttl")]
    #[builder(default = default_token_ttl())]
    pub token_ttl: Duration,

    /// Delay before retrying a failed background refresh.
    #[serde(with = "humantime_serde", default = "default_retry_backoff")]
    #[builder(default = default_retry_backoff())]
    pub retry_backoff: Duration,

    /// A token this close to expiry is treated as expired.
    #[serde(with = "humantime_serde", default = "default_expiry_skew")]
    #[builder(default = default_expiry_skew())]
    pub expiry_skew: Duration,

    /// JSON file backing the cross-process tier. `None` keeps tokens in
    /// memory only.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    /// Lock directory for the file tier.
    #[serde(default)]
    pub lock_dir: Option<PathBuf>,
}

fn default_token_ttl() -> Duration {
    Duration::from_secs(8 * 60 * 60)
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_expiry_skew() -> Duration {
    Duration::from_secs(5 * 60)
}

impl Default for AttestationCacheConfig {
    fn default() -> Self {
        Self {
            token_ttl: default_token_ttl(),
            retry_backoff: default_retry_backoff(),
            expiry_skew: default_expiry_skew(),
            file_path: None,
            lock_dir: None,
        }
    }
}
