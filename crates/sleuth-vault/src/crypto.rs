use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use sleuth_core::config::VaultConfig;
use sleuth_core::error::{Result, SleuthError};
use sleuth_core::types::OwnerId;

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
const MASTER_KEY_LEN: usize = 32;

/// Output of one encryption. Every write gets a fresh salt and nonce.
#[derive(Debug, Clone)]
pub struct SealedSecret {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub salt: Vec<u8>,
}

/// Versioned vault master key.
///
/// The master key never encrypts data directly: each write derives a
/// one-off data key via HKDF-SHA256 over a fresh salt, with the owner
/// identifier as derivation context. The owner identifier is also bound
/// as AAD, so a ciphertext sealed for one owner cannot be opened under
/// another owner's context even with the correct master key and salt.
pub struct MasterKey {
    bytes: [u8; MASTER_KEY_LEN],
    version: String,
}

impl MasterKey {
    /// Decode the configured master key. Must be base64 for exactly
    /// 32 bytes; anything else is a fatal configuration error.
    pub fn from_config(config: &VaultConfig) -> Result<Self> {
        let encoded = config.master_key.as_deref().ok_or_else(|| {
            SleuthError::Configuration(format!(
                "vault master key {} is not configured",
                config.key_version
            ))
        })?;

        if encoded.starts_with("${") {
            return Err(SleuthError::Configuration(format!(
                "vault master key {} references an unset environment variable: {}",
                config.key_version, encoded
            )));
        }

        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| {
                SleuthError::Configuration(format!(
                    "vault master key {} is not valid base64: {}",
                    config.key_version, e
                ))
            })?;

        if decoded.len() != MASTER_KEY_LEN {
            return Err(SleuthError::Configuration(format!(
                "vault master key {} must decode to exactly {} bytes, got {}",
                config.key_version,
                MASTER_KEY_LEN,
                decoded.len()
            )));
        }

        let mut bytes = [0u8; MASTER_KEY_LEN];
        bytes.copy_from_slice(&decoded);
        Ok(Self {
            bytes,
            version: config.key_version.clone(),
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Encrypt a plaintext for one owner.
    pub fn seal(&self, owner: &OwnerId, plaintext: &[u8]) -> Result<SealedSecret> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let key = self.derive_data_key(owner, &salt)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| SleuthError::Configuration("invalid derived key length".into()))?;

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: owner.0.as_bytes(),
                },
            )
            .map_err(|_| SleuthError::Configuration("secret encryption failed".into()))?;

        Ok(SealedSecret {
            ciphertext,
            nonce: nonce.to_vec(),
            salt: salt.to_vec(),
        })
    }

    /// Decrypt a sealed secret under the given owner's context.
    /// Authentication-tag mismatch (wrong owner, corrupted ciphertext, or
    /// wrong master key) is a `SecretAuth` error, never an absent value.
    pub fn open(&self, owner: &OwnerId, sealed: &SealedSecret) -> Result<Vec<u8>> {
        let key = self.derive_data_key(owner, &sealed.salt)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|_| SleuthError::Configuration("invalid derived key length".into()))?;

        cipher
            .decrypt(
                Nonce::from_slice(&sealed.nonce),
                Payload {
                    msg: sealed.ciphertext.as_slice(),
                    aad: owner.0.as_bytes(),
                },
            )
            .map_err(|_| {
                SleuthError::SecretAuth(format!(
                    "ciphertext did not authenticate for owner {}",
                    owner
                ))
            })
    }

    fn derive_data_key(&self, owner: &OwnerId, salt: &[u8]) -> Result<[u8; 32]> {
        let hkdf = Hkdf::<Sha256>::new(Some(salt), &self.bytes);
        let mut okm = [0u8; 32];
        hkdf.expand(owner.0.as_bytes(), &mut okm)
            .map_err(|_| SleuthError::Configuration("data key derivation failed".into()))?;
        Ok(okm)
    }
}
