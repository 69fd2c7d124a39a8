//! Symmetric encryption of secret strings
//!
//! AES-256-GCM with a fresh random nonce per call. The key is either a SHA-256
//! digest of the password (records written before any salt existed) or an
//! Argon2id derivation over the password and the per-stage salt.
//!
//! Ciphertext layout: `base64(nonce || ciphertext || tag)`.

use crate::error::{Result, StatecraftError};
use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::{Engine, engine::general_purpose::STANDARD};
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};

const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;
const TAG_LENGTH: usize = 16;

/// Length of a freshly generated salt in bytes.
pub const SALT_LENGTH: usize = 16;

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Number of passes
    pub iterations: u32,
    /// Degree of parallelism
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // OWASP recommendation for Argon2id
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    /// Cheap parameters for tests and CI. Never use for real stages.
    pub fn light() -> Self {
        Self {
            memory_kib: 256,
            iterations: 1,
            parallelism: 1,
        }
    }
}

/// A derived 256-bit encryption key
#[derive(Clone)]
pub struct SecretKey([u8; KEY_LENGTH]);

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

impl SecretKey {
    /// Fast unsalted derivation: SHA-256 over the password
    pub fn from_password(password: &str) -> Self {
        let digest = Sha256::digest(password.as_bytes());
        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&digest);
        Self(key)
    }

    /// Slow salted derivation: Argon2id over the password and salt
    pub fn derive(password: &str, salt: &[u8], params: KdfParams) -> Result<Self> {
        let params = Params::new(
            params.memory_kib,
            params.iterations,
            params.parallelism,
            Some(KEY_LENGTH),
        )
        .map_err(|e| StatecraftError::Encryption(format!("invalid KDF parameters: {e}")))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = [0u8; KEY_LENGTH];
        argon2
            .hash_password_into(password.as_bytes(), salt, &mut key)
            .map_err(|e| StatecraftError::Encryption(format!("key derivation failed: {e}")))?;
        Ok(Self(key))
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.0)
            .map_err(|e| StatecraftError::Encryption(format!("failed to create cipher: {e}")))
    }

    /// Encrypts `plaintext`; two calls never yield the same ciphertext
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = self.cipher()?;

        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| StatecraftError::Encryption(e.to_string()))?;

        let mut combined = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(combined))
    }

    /// Authenticated decryption of a value produced by [`SecretKey::encrypt`]
    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        let combined = STANDARD
            .decode(encoded)
            .map_err(|e| StatecraftError::Decryption(format!("invalid base64: {e}")))?;
        if combined.len() < NONCE_LENGTH + TAG_LENGTH {
            return Err(StatecraftError::Decryption(
                "ciphertext too short".to_string(),
            ));
        }

        let cipher = self.cipher()?;
        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LENGTH);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| {
                StatecraftError::Decryption("wrong password or tampered ciphertext".to_string())
            })?;

        String::from_utf8(plaintext)
            .map_err(|e| StatecraftError::Decryption(format!("plaintext is not UTF-8: {e}")))
    }
}

/// The keys a scope tree encrypts and decrypts with
///
/// With a salt, new secrets use the Argon2id key and decryption falls back to
/// the unsalted key so records written before the salt existed stay readable.
#[derive(Debug, Clone)]
pub struct EncryptionKeys {
    primary: SecretKey,
    legacy: Option<SecretKey>,
}

impl EncryptionKeys {
    pub fn new(password: &str, salt: Option<&[u8]>, params: KdfParams) -> Result<Self> {
        match salt {
            Some(salt) => Ok(Self {
                primary: SecretKey::derive(password, salt, params)?,
                legacy: Some(SecretKey::from_password(password)),
            }),
            None => Ok(Self {
                primary: SecretKey::from_password(password),
                legacy: None,
            }),
        }
    }

    /// Whether new secrets are encrypted with the salted key
    pub fn is_salted(&self) -> bool {
        self.legacy.is_some()
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        self.primary.encrypt(plaintext)
    }

    pub fn decrypt(&self, encoded: &str) -> Result<String> {
        match self.primary.decrypt(encoded) {
            Ok(plaintext) => Ok(plaintext),
            Err(err @ StatecraftError::Decryption(_)) => match &self.legacy {
                Some(legacy) => legacy.decrypt(encoded).map_err(|_| err),
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }
}

/// Generates a random salt for password-based key derivation
pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LENGTH];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Encrypts `value` with a key derived from `password` (and `salt`, when present)
pub fn encrypt(value: &str, password: &str, salt: Option<&[u8]>) -> Result<String> {
    EncryptionKeys::new(password, salt, KdfParams::default())?.encrypt(value)
}

/// Decrypts `ciphertext`; with a salt, unsalted ciphertext is still accepted
pub fn decrypt(ciphertext: &str, password: &str, salt: Option<&[u8]>) -> Result<String> {
    EncryptionKeys::new(password, salt, KdfParams::default())?.decrypt(ciphertext)
}
