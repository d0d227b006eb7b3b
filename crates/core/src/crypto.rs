//! Chunk encryption and key derivation
//!
//! Chunks are sealed with AES-256-GCM under a fresh random 96-bit nonce; the
//! wire payload is `nonce || ciphertext || tag`. Keys are derived client-side
//! from the master password with Argon2id. Nonce reuse under the same key is
//! forbidden, which is why every call to [`encrypt_chunk`] draws a new nonce.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use rand::RngCore;

/// Key length in bytes (AES-256)
pub const KEY_SIZE: usize = 32;
/// GCM nonce length in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;
/// GCM authentication tag length in bytes
pub const TAG_SIZE: usize = 16;
/// Key-derivation salt length in bytes
pub const SALT_SIZE: usize = 16;

// Argon2id parameters (t=3, m=64 MiB, p=4)
const ARGON2_TIME_COST: u32 = 3;
const ARGON2_MEMORY_KIB: u32 = 64 * 1024;
const ARGON2_PARALLELISM: u32 = 4;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed (wrong key or corrupted data)")]
    Decrypt,
    #[error("encrypted payload too short ({0} bytes)")]
    Malformed(usize),
}

/// Generate a random key-derivation salt
#[must_use]
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Generate a random 256-bit content key
#[must_use]
pub fn generate_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    key
}

/// Derive a 256-bit key from a master password using Argon2id
///
/// # Errors
/// Returns an error if the Argon2 parameters are rejected
pub fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
    let params = Params::new(
        ARGON2_MEMORY_KIB,
        ARGON2_TIME_COST,
        ARGON2_PARALLELISM,
        Some(KEY_SIZE),
    )
    .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
    Ok(key)
}

/// Encrypt a plaintext chunk: `nonce(12) || ciphertext || tag(16)`
///
/// # Errors
/// Returns an error if encryption fails
pub fn encrypt_chunk(plaintext: &[u8], key: &[u8; KEY_SIZE]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut payload = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    payload.extend_from_slice(&nonce);
    payload.extend_from_slice(&ciphertext);
    Ok(payload)
}

/// Decrypt a payload produced by [`encrypt_chunk`]
///
/// # Errors
/// Returns an error if the payload is malformed or authentication fails
pub fn decrypt_chunk(payload: &[u8], key: &[u8; KEY_SIZE]) -> Result<Vec<u8>, CryptoError> {
    if payload.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::Malformed(payload.len()));
    }
    let (nonce, ciphertext) = payload.split_at(NONCE_SIZE);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = generate_key();
        let plaintext = b"secret chunk contents";

        let sealed = encrypt_chunk(plaintext, &key).unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + plaintext.len() + TAG_SIZE);

        let opened = decrypt_chunk(&sealed, &key).unwrap();
        assert_eq!(opened, plaintext);
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let key = generate_key();
        let a = encrypt_chunk(b"same input", &key).unwrap();
        let b = encrypt_chunk(b"same input", &key).unwrap();
        assert_ne!(a, b);
        assert_ne!(&a[..NONCE_SIZE], &b[..NONCE_SIZE]);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = encrypt_chunk(b"data", &generate_key()).unwrap();
        assert!(matches!(
            decrypt_chunk(&sealed, &generate_key()),
            Err(CryptoError::Decrypt)
        ));
    }

    #[test]
    fn test_tampered_payload_fails() {
        let key = generate_key();
        let mut sealed = encrypt_chunk(b"data to protect", &key).unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(decrypt_chunk(&sealed, &key).is_err());
    }

    #[test]
    fn test_short_payload_rejected() {
        let key = generate_key();
        assert!(matches!(
            decrypt_chunk(&[0u8; 8], &key),
            Err(CryptoError::Malformed(8))
        ));
    }

    #[test]
    fn test_derive_key_deterministic() {
        let salt = [7u8; SALT_SIZE];
        let k1 = derive_key("correct horse", &salt).unwrap();
        let k2 = derive_key("correct horse", &salt).unwrap();
        assert_eq!(k1, k2);

        let k3 = derive_key("wrong horse", &salt).unwrap();
        assert_ne!(k1, k3);

        let other_salt = [8u8; SALT_SIZE];
        let k4 = derive_key("correct horse", &other_salt).unwrap();
        assert_ne!(k1, k4);
    }
}
