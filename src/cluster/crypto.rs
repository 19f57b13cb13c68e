//! Key generation, hashing and payload protection for the cluster protocol.
//!
//! Everything here is a pure function over its inputs; callers own all
//! state. Raw shared keys never leave the process: the wire carries either
//! the salted hash (header token) or an AES-GCM sealed payload.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::Rng;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::ClusterError;

const KEY_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const KEY_LEN: usize = 8;

/// Fixed embedded salt for key/password hashing. Changing it invalidates
/// every stored admin password and every in-flight header token.
const TOKEN_SALT: &str = "molnXKrjkDueYK3eSz0r";

/// AES-GCM nonce length in bytes, prefixed to every sealed payload.
const NONCE_LEN: usize = 12;

/// Rounds of SHA-256 applied when deriving a snapshot key from a password.
const SNAPSHOT_KEY_ROUNDS: usize = 100;

/// Generate a fresh cluster secret: 8 characters from `[A-Z0-9]`.
pub fn generate_cluster_key() -> String {
    let mut rng = rand::rng();
    (0..KEY_LEN)
        .map(|_| KEY_CHARSET[rng.random_range(0..KEY_CHARSET.len())] as char)
        .collect()
}

/// Salted SHA-256 of a secret, hex encoded. Used for stored admin
/// passwords and as the `X-Node-Key` header token.
pub fn hash_key(plain: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plain.as_bytes());
    hasher.update(TOKEN_SALT.as_bytes());
    hex::encode(hasher.finalize())
}

/// Derive the 256-bit AES key from a shared secret.
fn derive_cipher_key(secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.finalize().into()
}

/// Derive a snapshot encryption key from a user password via repeated
/// SHA-256.
pub fn derive_snapshot_key(password: &str) -> [u8; 32] {
    let mut digest: [u8; 32] = {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hasher.finalize().into()
    };
    for _ in 1..SNAPSHOT_KEY_ROUNDS {
        let mut hasher = Sha256::new();
        hasher.update(digest);
        digest = hasher.finalize().into();
    }
    digest
}

/// Seal a JSON value with AES-256-GCM under the shared secret.
///
/// Output framing is `base64(nonce || ciphertext)` with a random 12-byte
/// nonce, matching what [`decrypt_json`] expects.
pub fn encrypt_json<T: Serialize>(value: &T, key: &str) -> Result<String, ClusterError> {
    let plaintext = serde_json::to_vec(value)
        .map_err(|e| ClusterError::Malformed(format!("serialize: {}", e)))?;
    encrypt_bytes(&plaintext, &derive_cipher_key(key))
}

/// Open a sealed payload and parse the plaintext as JSON.
pub fn decrypt_json(payload: &str, key: &str) -> Result<serde_json::Value, ClusterError> {
    let plaintext = decrypt_bytes(payload, &derive_cipher_key(key))?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| ClusterError::Malformed(format!("payload is not JSON: {}", e)))
}

/// Seal raw bytes under a pre-derived 256-bit key.
pub fn encrypt_bytes(plaintext: &[u8], key: &[u8; 32]) -> Result<String, ClusterError> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| ClusterError::Crypto(format!("cipher init: {}", e)))?;
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| ClusterError::Crypto(format!("encrypt: {}", e)))?;

    let mut framed = nonce.to_vec();
    framed.extend(ciphertext);
    Ok(BASE64.encode(framed))
}

/// Open a sealed payload under a pre-derived 256-bit key.
pub fn decrypt_bytes(payload: &str, key: &[u8; 32]) -> Result<Vec<u8>, ClusterError> {
    let framed = BASE64
        .decode(payload)
        .map_err(|e| ClusterError::Malformed(format!("payload is not base64: {}", e)))?;
    if framed.len() < NONCE_LEN {
        return Err(ClusterError::Malformed("payload too short".to_string()));
    }

    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| ClusterError::Crypto(format!("cipher init: {}", e)))?;
    let (nonce, ciphertext) = framed.split_at(NONCE_LEN);

    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| ClusterError::Crypto("decrypt failed, wrong key or corrupted payload".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generated_keys_use_charset() {
        for _ in 0..50 {
            let key = generate_cluster_key();
            assert_eq!(key.len(), KEY_LEN);
            assert!(key.bytes().all(|b| KEY_CHARSET.contains(&b)));
        }
    }

    #[test]
    fn test_hash_is_stable_and_salted() {
        let a = hash_key("SECRET01");
        let b = hash_key("SECRET01");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        // A plain unsalted digest must not match
        let unsalted = hex::encode(Sha256::digest(b"SECRET01"));
        assert_ne!(a, unsalted);
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let body = json!({"nonce": 1234, "name": "Kitchen Pi"});
        let sealed = encrypt_json(&body, "ABC123XY").unwrap();
        let opened = decrypt_json(&sealed, "ABC123XY").unwrap();
        assert_eq!(opened, body);
    }

    #[test]
    fn test_wrong_key_is_a_crypto_error() {
        let sealed = encrypt_json(&json!({"nonce": 1}), "ABC123XY").unwrap();
        let err = decrypt_json(&sealed, "WRONGKEY").unwrap_err();
        assert!(matches!(err, ClusterError::Crypto(_)));
    }

    #[test]
    fn test_garbage_payload_is_malformed() {
        assert!(matches!(
            decrypt_json("not base64 at all!", "ABC123XY").unwrap_err(),
            ClusterError::Malformed(_)
        ));
        assert!(matches!(
            decrypt_json("AAAA", "ABC123XY").unwrap_err(),
            ClusterError::Malformed(_)
        ));
    }

    #[test]
    fn test_snapshot_key_derivation_is_deterministic() {
        assert_eq!(derive_snapshot_key("hunter2"), derive_snapshot_key("hunter2"));
        assert_ne!(derive_snapshot_key("hunter2"), derive_snapshot_key("hunter3"));
    }
}
