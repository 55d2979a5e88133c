//! Opaque token generation and hashing.
//!
//! Tokens are 32 bytes of OS randomness, URL-safe base64 without padding.
//! The engine persists only the SHA-256 hex digest; lookups hash the
//! presented token and compare digests in constant time.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Length of the raw token material in bytes.
pub const TOKEN_BYTES: usize = 32;

/// A freshly generated access/refresh token pair with persisted hashes.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub access_hash: String,
    pub refresh_hash: String,
}

impl TokenPair {
    pub fn generate() -> Self {
        let access_token = generate_token();
        let refresh_token = generate_token();
        let access_hash = hash_token(&access_token);
        let refresh_hash = hash_token(&refresh_token);
        Self {
            access_token,
            refresh_token,
            access_hash,
            refresh_hash,
        }
    }
}

/// Generate one opaque token.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// SHA-256 hex digest of a token. This is the only form that is persisted.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Constant-time digest comparison.
pub fn hashes_match(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
