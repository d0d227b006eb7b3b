//! Encrypted key storage
//!
//! Two-key scheme: a random 256-bit content key encrypts file chunks; the
//! content key itself is sealed under a master key derived from the user's
//! password with Argon2id and written to the keyfile. The content key only
//! ever exists in the clear in memory, while the agent is running.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::crypto::{
    decrypt_chunk, derive_key, encrypt_chunk, generate_key, generate_salt, KEY_SIZE, SALT_SIZE,
};

/// Name of the keyfile inside the agent home
pub const KEYFILE_NAME: &str = "keyfile.json";

#[derive(Debug, thiserror::Error)]
pub enum KeystoreError {
    #[error("keystore not initialized at {0}")]
    NotInitialized(PathBuf),
    #[error("keystore already exists at {0}")]
    AlreadyExists(PathBuf),
    #[error("keyfile unreadable: {0}")]
    Unreadable(String),
    #[error("invalid password or corrupted keyfile")]
    BadPassword,
    #[error("keystore is locked")]
    Locked,
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Serialize, Deserialize)]
struct Keyfile {
    version: u32,
    key_id: String,
    created_at: String,
    salt: String,
    /// Content key sealed under the password-derived master key
    encrypted_key: String,
}

/// Manages the content encryption key
pub struct Keystore {
    path: PathBuf,
    key_id: String,
    salt: [u8; SALT_SIZE],
    encrypted_key: Vec<u8>,
    unlocked: Option<[u8; KEY_SIZE]>,
}

impl Keystore {
    /// Create a fresh keystore with a random content key.
    ///
    /// # Errors
    /// Fails if a keyfile already exists or cannot be written.
    pub fn create(home: &Path, password: &str) -> Result<Self, KeystoreError> {
        Self::create_with_key(home, password, generate_key())
    }

    /// Import an exported content key, sealing it under `password`.
    ///
    /// # Errors
    /// Fails if the key is not valid base64 of 32 bytes or the keyfile exists.
    pub fn import(home: &Path, key_b64: &str, password: &str) -> Result<Self, KeystoreError> {
        let raw = BASE64
            .decode(key_b64.trim())
            .map_err(|e| KeystoreError::InvalidKey(e.to_string()))?;
        let key: [u8; KEY_SIZE] = raw
            .try_into()
            .map_err(|_| KeystoreError::InvalidKey("key must be 32 bytes".into()))?;
        Self::create_with_key(home, password, key)
    }

    fn create_with_key(
        home: &Path,
        password: &str,
        key: [u8; KEY_SIZE],
    ) -> Result<Self, KeystoreError> {
        let path = home.join(KEYFILE_NAME);
        if path.exists() {
            return Err(KeystoreError::AlreadyExists(path));
        }
        std::fs::create_dir_all(home)?;

        let salt = generate_salt();
        let master = derive_key(password, &salt)
            .map_err(|e| KeystoreError::Unreadable(e.to_string()))?;
        let encrypted_key =
            encrypt_chunk(&key, &master).map_err(|e| KeystoreError::Unreadable(e.to_string()))?;

        let keyfile = Keyfile {
            version: 1,
            key_id: uuid::Uuid::new_v4().to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            salt: BASE64.encode(salt),
            encrypted_key: BASE64.encode(&encrypted_key),
        };
        let json = serde_json::to_string_pretty(&keyfile)
            .map_err(|e| KeystoreError::Unreadable(e.to_string()))?;
        std::fs::write(&path, json)?;

        Ok(Self {
            path,
            key_id: keyfile.key_id,
            salt,
            encrypted_key,
            unlocked: Some(key),
        })
    }

    /// Load an existing keystore (locked).
    ///
    /// # Errors
    /// Fails if the keyfile is missing or unparsable.
    pub fn load(home: &Path) -> Result<Self, KeystoreError> {
        let path = home.join(KEYFILE_NAME);
        if !path.exists() {
            return Err(KeystoreError::NotInitialized(path));
        }
        let json = std::fs::read_to_string(&path)?;
        let keyfile: Keyfile =
            serde_json::from_str(&json).map_err(|e| KeystoreError::Unreadable(e.to_string()))?;

        let salt_raw = BASE64
            .decode(&keyfile.salt)
            .map_err(|e| KeystoreError::Unreadable(e.to_string()))?;
        let salt: [u8; SALT_SIZE] = salt_raw
            .try_into()
            .map_err(|_| KeystoreError::Unreadable("bad salt length".into()))?;
        let encrypted_key = BASE64
            .decode(&keyfile.encrypted_key)
            .map_err(|e| KeystoreError::Unreadable(e.to_string()))?;

        Ok(Self {
            path,
            key_id: keyfile.key_id,
            salt,
            encrypted_key,
            unlocked: None,
        })
    }

    /// Unlock with the master password.
    ///
    /// # Errors
    /// Fails if the password is wrong or the keyfile was tampered with.
    pub fn unlock(&mut self, password: &str) -> Result<(), KeystoreError> {
        let master = derive_key(password, &self.salt)
            .map_err(|e| KeystoreError::Unreadable(e.to_string()))?;
        let raw =
            decrypt_chunk(&self.encrypted_key, &master).map_err(|_| KeystoreError::BadPassword)?;
        let key: [u8; KEY_SIZE] = raw
            .try_into()
            .map_err(|_| KeystoreError::BadPassword)?;
        self.unlocked = Some(key);
        Ok(())
    }

    /// Drop the in-memory key
    pub fn lock(&mut self) {
        if let Some(key) = self.unlocked.as_mut() {
            key.fill(0);
        }
        self.unlocked = None;
    }

    /// The content key; requires an unlocked keystore.
    ///
    /// # Errors
    /// Fails if the keystore is locked.
    pub fn key(&self) -> Result<&[u8; KEY_SIZE], KeystoreError> {
        self.unlocked.as_ref().ok_or(KeystoreError::Locked)
    }

    /// Export the content key as base64 for setting up another device.
    ///
    /// # Errors
    /// Fails if the keystore is locked.
    pub fn export(&self) -> Result<String, KeystoreError> {
        Ok(BASE64.encode(self.key()?))
    }

    /// Unique identifier of this key
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Path of the keyfile on disk
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_unlock_roundtrip() {
        let home = tempfile::tempdir().unwrap();
        let created = Keystore::create(home.path(), "hunter2").unwrap();
        let original_key = *created.key().unwrap();

        let mut loaded = Keystore::load(home.path()).unwrap();
        assert!(matches!(loaded.key(), Err(KeystoreError::Locked)));

        loaded.unlock("hunter2").unwrap();
        assert_eq!(loaded.key().unwrap(), &original_key);
        assert_eq!(loaded.key_id(), created.key_id());
    }

    #[test]
    fn test_wrong_password() {
        let home = tempfile::tempdir().unwrap();
        Keystore::create(home.path(), "right").unwrap();

        let mut loaded = Keystore::load(home.path()).unwrap();
        assert!(matches!(
            loaded.unlock("wrong"),
            Err(KeystoreError::BadPassword)
        ));
    }

    #[test]
    fn test_export_import() {
        let home_a = tempfile::tempdir().unwrap();
        let home_b = tempfile::tempdir().unwrap();

        let a = Keystore::create(home_a.path(), "pw-a").unwrap();
        let exported = a.export().unwrap();

        // Second device imports the same key under a different password
        let b = Keystore::import(home_b.path(), &exported, "pw-b").unwrap();
        assert_eq!(a.key().unwrap(), b.key().unwrap());

        let mut b_loaded = Keystore::load(home_b.path()).unwrap();
        b_loaded.unlock("pw-b").unwrap();
        assert_eq!(b_loaded.key().unwrap(), a.key().unwrap());
    }

    #[test]
    fn test_create_refuses_overwrite() {
        let home = tempfile::tempdir().unwrap();
        Keystore::create(home.path(), "pw").unwrap();
        assert!(matches!(
            Keystore::create(home.path(), "pw"),
            Err(KeystoreError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_lock_clears_key() {
        let home = tempfile::tempdir().unwrap();
        let mut ks = Keystore::create(home.path(), "pw").unwrap();
        ks.lock();
        assert!(matches!(ks.key(), Err(KeystoreError::Locked)));
    }

    #[test]
    fn test_import_rejects_garbage() {
        let home = tempfile::tempdir().unwrap();
        assert!(Keystore::import(home.path(), "not-base64!!!", "pw").is_err());
        assert!(Keystore::import(home.path(), &BASE64.encode([1u8; 7]), "pw").is_err());
    }
}
