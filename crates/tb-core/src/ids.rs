// SPDX-License-Identifier: MIT OR Apache-2.0
//! Identifier generation and validation.
//!
//! Resource identifiers (workspace ids, session ids) are caller-supplied
//! opaque strings restricted to `[A-Za-z0-9_-]{1,128}`. Server-generated ids
//! are UUIDv4. API-key plaintext is `<prefix><64 lowercase hex>` where the
//! hex chars come from 32 bytes of OS entropy.

use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Maximum length of a workspace or session identifier.
pub const MAX_RESOURCE_ID_LEN: usize = 128;

/// Maximum length of a caller-supplied relative file path.
pub const MAX_RELATIVE_PATH_LEN: usize = 1024;

/// Maximum length of an API-key prefix.
pub const MAX_KEY_PREFIX_LEN: usize = 8;

/// Number of random bytes backing a key plaintext (64 hex chars).
const KEY_MATERIAL_BYTES: usize = 32;

/// Generate a fresh UUIDv4 string.
#[must_use]
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// SHA-256 of `input`, lowercase hex.
#[must_use]
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Generate a new API-key plaintext: `<prefix>` followed by 64 lowercase hex
/// characters drawn from 32 bytes of OS entropy.
///
/// The prefix is truncated to [`MAX_KEY_PREFIX_LEN`] characters.
#[must_use]
pub fn generate_key_plaintext(prefix: &str) -> String {
    let prefix: String = prefix.chars().take(MAX_KEY_PREFIX_LEN).collect();
    let mut bytes = [0u8; KEY_MATERIAL_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(prefix.len() + KEY_MATERIAL_BYTES * 2);
    out.push_str(&prefix);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// The displayable prefix of a key plaintext: its first ≤ 8 characters.
#[must_use]
pub fn key_prefix_of(plaintext: &str) -> String {
    plaintext.chars().take(MAX_KEY_PREFIX_LEN).collect()
}

/// Validate a workspace or session identifier: `[A-Za-z0-9_-]{1,128}`.
///
/// # Errors
///
/// Returns a human-readable reason when the identifier is empty, too long,
/// or contains a character outside the allowed set.
pub fn validate_resource_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("identifier must not be empty".into());
    }
    if id.len() > MAX_RESOURCE_ID_LEN {
        return Err(format!(
            "identifier exceeds maximum length of {MAX_RESOURCE_ID_LEN}"
        ));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
    {
        return Err(format!("identifier contains invalid character {bad:?}"));
    }
    Ok(())
}

/// Validate a caller-supplied relative path before it is joined to a
/// workspace root.
///
/// Rejects empty paths, `..` components, absolute paths, backslashes, NUL
/// bytes, and paths longer than [`MAX_RELATIVE_PATH_LEN`].
///
/// # Errors
///
/// Returns a human-readable reason for the first rule violated.
pub fn validate_relative_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("path must not be empty".into());
    }
    if path.len() > MAX_RELATIVE_PATH_LEN {
        return Err(format!(
            "path exceeds maximum length of {MAX_RELATIVE_PATH_LEN}"
        ));
    }
    if path.contains('\\') {
        return Err("path must not contain backslashes".into());
    }
    if path.contains('\0') {
        return Err("path must not contain NUL bytes".into());
    }
    if path.starts_with('/') {
        return Err("path must be relative".into());
    }
    if path.split('/').any(|seg| seg == "..") {
        return Err("path must not contain '..' components".into());
    }
    Ok(())
}
