//! AES-256-GCM sealing of connector credentials
//!
//! Sealed layout: 12-byte random nonce followed by the ciphertext and tag.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use std::fmt;

use accord_core::{AccordError, Credentials, Result};

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

#[derive(Clone)]
pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl CredentialCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_LEN {
            return Err(AccordError::encryption_error(format!(
                "Invalid encryption key length: expected {} bytes, got {}",
                KEY_LEN,
                key.len()
            )));
        }

        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|e| AccordError::encryption_error(format!("Cipher init failed: {}", e)))?;
        Ok(Self { cipher })
    }

    /// Build from a base64-encoded 32-byte key
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|e| AccordError::encryption_error(format!("Key is not valid base64: {}", e)))?;
        Self::new(&key)
    }

    /// Fresh random key, base64-encoded
    pub fn generate_key() -> String {
        let mut key = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut key);
        STANDARD.encode(key)
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| AccordError::encryption_error(format!("Encryption failed: {}", e)))?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend(ciphertext);
        Ok(sealed)
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            return Err(AccordError::encryption_error("Invalid ciphertext length"));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| AccordError::encryption_error(format!("Decryption failed: {}", e)))
    }

    pub fn seal_credentials(&self, credentials: &Credentials) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(credentials)
            .map_err(|e| AccordError::encryption_error(format!("Credential encoding failed: {}", e)))?;
        self.encrypt(&json)
    }

    pub fn open_credentials(&self, sealed: &[u8]) -> Result<Credentials> {
        let json = self.decrypt(sealed)?;
        serde_json::from_slice(&json)
            .map_err(|e| AccordError::encryption_error(format!("Credential decoding failed: {}", e)))
    }
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialCipher(<redacted>)")
    }
}
