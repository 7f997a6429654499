//! Identifier generation and composite storage keys

use bech32::Bech32m;
use uuid7::uuid7;

use crate::error::CoreError;

/// Separator between the parts of a composite tree key.
pub const KEY_SEPARATOR: u8 = 0;

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Rejects empty key parts and parts that would collide with the key separator.
pub fn validate_key_part(field: &str, value: &str) -> Result<(), CoreError> {
    if value.trim().is_empty() {
        return Err(CoreError::validation(format!("{field} must not be empty")));
    }
    if value.as_bytes().contains(&KEY_SEPARATOR) {
        return Err(CoreError::validation(format!(
            "{field} contains a NUL byte"
        )));
    }
    Ok(())
}

/// `a \0 b \0 ...`
pub fn composite_key(parts: &[&str]) -> Vec<u8> {
    let mut key = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEPARATOR);
        }
        key.extend_from_slice(part.as_bytes());
    }
    key
}

/// Prefix matching every composite key that starts with `parts`.
pub fn composite_prefix(parts: &[&str]) -> Vec<u8> {
    let mut key = composite_key(parts);
    key.push(KEY_SEPARATOR);
    key
}

pub fn u64_to_be(n: u64) -> [u8; 8] {
    n.to_be_bytes()
}

pub fn u64_from_be(bytes: &[u8]) -> Result<u64, CoreError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| CoreError::CorruptData(format!("expected 8 byte counter, got {}", bytes.len())))?;
    Ok(u64::from_be_bytes(arr))
}
