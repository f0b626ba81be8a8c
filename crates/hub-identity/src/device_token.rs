//! Device bearer tokens.
//!
//! A device token is 32 random bytes handed to the Spoke once at
//! registration time; the Hub only ever stores its SHA-256 digest. Unlike
//! a user password, the token is already maximum-entropy and never
//! reused across devices, so a plain digest is enough to resist both
//! guessing and rainbow-table lookup — there's no per-device salt to add
//! that the randomness doesn't already provide, and a digest lets
//! [`hub_store::devices::get_by_hashed_token`] do an indexed equality
//! lookup instead of a linear scan-and-compare.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Generate a new opaque device token. Returned once to the caller, who
/// must store only [`hash_token`]'s digest.
pub fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_unique() {
        let a = generate_token();
        let b = generate_token();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64); // 32 bytes, hex-encoded
    }

    #[test]
    fn hashing_is_deterministic() {
        let token = generate_token();
        assert_eq!(hash_token(&token), hash_token(&token));
    }
}
