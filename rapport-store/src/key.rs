//! Key validation shared by every consumer.

use crate::error::{Result, StoreError};

/// Longest key accepted, in bytes.
pub const MAX_KEY_LEN: usize = 512;

/// Reject keys that are empty, oversized, or contain whitespace/control characters.
///
/// Runs before any store call so malformed input never reaches either tier.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("key must not be empty".to_string()));
    }

    if key.len() > MAX_KEY_LEN {
        return Err(StoreError::InvalidKey(format!(
            "key exceeds {} bytes",
            MAX_KEY_LEN
        )));
    }

    if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(StoreError::InvalidKey(format!(
            "key contains whitespace or control characters: {:?}",
            key
        )));
    }

    Ok(())
}

/// Join a namespace prefix and a key with `:`.
pub fn namespaced(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}:{}", prefix, key)
    }
}
