//! Persisted-record tag codec.
//!
//! Every certificate written to a durable store carries an ASCII marker that
//! scopes it to one logical identity:
//!
//! ```text
//! MSAL|alias=<opaque-alias>|ep=<endpoint-base>
//! ```
//!
//! Values may not contain `|`, CR, LF or NUL. The encoder rejects such values
//! (the caller then skips persistence) rather than emitting a tag that would
//! decode to something else. The decoder is lenient: segments are `key=value`
//! pairs, the last occurrence of a key wins, and unknown keys are ignored so
//! that newer writers can add fields without breaking older readers.

use crate::error::{StorageError, StorageResult};

/// Leading segment of every tag written by this crate.
pub const TAG_PREFIX: &str = "MSAL";

const ALIAS_KEY: &str = "alias";
const ENDPOINT_KEY: &str = "ep";
const FORBIDDEN: [char; 4] = ['|', '\r', '\n', '\0'];

/// Decoded contents of a persisted-record tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedTag {
    /// Identity scope (the binding cache key).
    pub alias: String,
    /// Base URL used for mTLS token requests with this certificate.
    pub endpoint_base: String,
}

impl PersistedTag {
    /// Creates a tag for the given alias and endpoint.
    pub fn new(alias: impl Into<String>, endpoint_base: impl Into<String>) -> Self {
        Self { alias: alias.into(), endpoint_base: endpoint_base.into() }
    }

    /// Encodes this tag. See [`encode_tag`].
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidTag`] if either value is unencodable.
    pub fn encode(&self) -> StorageResult<String> {
        encode_tag(&self.alias, &self.endpoint_base)
    }
}

/// Encodes `alias` and `endpoint_base` into a tag string.
///
/// # Errors
///
/// Returns [`StorageError::InvalidTag`] if the alias is empty or if either
/// value contains a forbidden character.
pub fn encode_tag(alias: &str, endpoint_base: &str) -> StorageResult<String> {
    if alias.trim().is_empty() {
        return Err(StorageError::invalid_tag("alias must not be empty"));
    }
    check_value(ALIAS_KEY, alias)?;
    check_value(ENDPOINT_KEY, endpoint_base)?;
    Ok(format!("{TAG_PREFIX}|{ALIAS_KEY}={alias}|{ENDPOINT_KEY}={endpoint_base}"))
}

/// Decodes a tag string.
///
/// Returns `None` when the tag was not written by this crate (wrong prefix)
/// or lacks an alias or endpoint.
#[must_use]
pub fn decode_tag(tag: &str) -> Option<PersistedTag> {
    let mut segments = tag.split('|');
    if segments.next()? != TAG_PREFIX {
        return None;
    }

    let mut alias = None;
    let mut endpoint = None;
    for segment in segments {
        let Some((key, value)) = segment.split_once('=') else {
            continue;
        };
        match key {
            ALIAS_KEY => alias = Some(value),
            ENDPOINT_KEY => endpoint = Some(value),
            _ => {},
        }
    }

    let alias = alias.filter(|a| !a.is_empty())?;
    Some(PersistedTag::new(alias, endpoint?))
}

fn check_value(field: &str, value: &str) -> StorageResult<()> {
    if let Some(bad) = value.chars().find(|c| FORBIDDEN.contains(c)) {
        return Err(StorageError::invalid_tag(format!(
            "{field} contains forbidden character {bad:?}"
        )));
    }
    Ok(())
}
