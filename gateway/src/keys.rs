//! Credential codec: opaque bearer keys are 32 CSPRNG bytes encoded as
//! URL-safe base64; only the hex SHA-256 fingerprint is ever stored.

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

pub const KEY_PREFIX_LEN: usize = 8;

pub fn generate_plaintext_key() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("system RNG unavailable")?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Display-only prefix; never sufficient to reconstruct the key.
pub fn key_prefix(plain: &str) -> String {
    plain.chars().take(KEY_PREFIX_LEN).collect()
}

pub fn hash_key(plain: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plain.as_bytes());
    hex::encode(hasher.finalize())
}

/// Constant-time comparison; used for fingerprints and the admin token,
/// never for raw plaintext.
pub fn constant_time_equals(a: &str, b: &str) -> bool {
    ConstantTimeEq::ct_eq(a.as_bytes(), b.as_bytes()).unwrap_u8() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic_and_hex_encoded() {
        assert_eq!(hash_key("x"), hash_key("x"));
        assert_ne!(hash_key("x"), hash_key("y"));
        assert_eq!(
            hash_key(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn generated_keys_are_distinct_url_safe_strings() {
        let a = generate_plaintext_key().unwrap();
        let b = generate_plaintext_key().unwrap();
        assert_ne!(a, b);
        // 32 bytes without padding encode to 43 characters
        assert_eq!(a.len(), 43);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn prefix_is_first_eight_chars() {
        let plain = "abcdefghijkl";
        assert_eq!(key_prefix(plain), "abcdefgh");
        assert_eq!(key_prefix("abc"), "abc");
    }

    #[test]
    fn constant_time_compare_matches_equality() {
        let digest = hash_key("some-key");
        assert!(constant_time_equals(&digest, &hash_key("some-key")));
        assert!(!constant_time_equals(&digest, &hash_key("other-key")));
        assert!(!constant_time_equals(&digest, &digest[..32]));
    }
}
