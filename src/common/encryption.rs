//! Encryption at rest for stored parameters
//!
//! - AES-256-GCM authenticated encryption
//! - Parameter key derived from the master key with HKDF-SHA256
//! - Random nonce per write, bound to the parameter name as associated data
//!
//! Stored format: MAGIC || NONCE || CIPHERTEXT+TAG

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use sha2::Sha256;

use crate::common::{Error, Result};

/// Size of AES-256 key in bytes
const KEY_SIZE: usize = 32;

/// Size of GCM nonce in bytes
const NONCE_SIZE: usize = 12;

/// Size of GCM authentication tag in bytes
const TAG_SIZE: usize = 16;

/// Magic bytes to identify encrypted parameters
const ENCRYPTION_MAGIC: &[u8] = b"JRLENC01";

/// HKDF info for the parameter key
const PARAM_CONTEXT: &[u8] = b"joinrelay-params";

/// Encrypted value with its nonce
#[derive(Debug, Clone)]
pub struct EncryptedData {
    pub nonce: [u8; NONCE_SIZE],
    /// Ciphertext with authentication tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes =
            Vec::with_capacity(ENCRYPTION_MAGIC.len() + NONCE_SIZE + self.ciphertext.len());
        bytes.extend_from_slice(ENCRYPTION_MAGIC);
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let min_size = ENCRYPTION_MAGIC.len() + NONCE_SIZE + TAG_SIZE;
        if bytes.len() < min_size {
            return Err(Error::Encryption(format!(
                "data too short: {} bytes, minimum {} bytes",
                bytes.len(),
                min_size
            )));
        }

        if !Self::is_encrypted(bytes) {
            return Err(Error::Encryption("invalid magic bytes".to_string()));
        }

        let nonce_start = ENCRYPTION_MAGIC.len();
        let ciphertext_start = nonce_start + NONCE_SIZE;

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[nonce_start..ciphertext_start]);

        Ok(Self {
            nonce,
            ciphertext: bytes[ciphertext_start..].to_vec(),
        })
    }

    pub fn is_encrypted(bytes: &[u8]) -> bool {
        bytes.len() >= ENCRYPTION_MAGIC.len()
            && &bytes[..ENCRYPTION_MAGIC.len()] == ENCRYPTION_MAGIC
    }
}

/// Cipher for parameter values. Disabled ciphers pass data through unchanged.
pub struct ParamCipher {
    cipher: Option<Aes256Gcm>,
}

impl ParamCipher {
    /// Plaintext storage
    pub fn disabled() -> Self {
        Self { cipher: None }
    }

    /// Build a cipher from a base64 master key (at least 32 bytes)
    pub fn from_master_key(master_key: &str) -> Result<Self> {
        let key_bytes = BASE64
            .decode(master_key.trim())
            .map_err(|e| Error::Encryption(format!("invalid base64 master key: {}", e)))?;

        if key_bytes.len() < KEY_SIZE {
            return Err(Error::Encryption(format!(
                "master key too short: {} bytes, minimum {} bytes",
                key_bytes.len(),
                KEY_SIZE
            )));
        }

        let key = derive_key(&key_bytes, PARAM_CONTEXT)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| Error::Encryption(format!("failed to create cipher: {}", e)))?;

        Ok(Self {
            cipher: Some(cipher),
        })
    }

    /// Build from an optional master key
    pub fn from_config(master_key: Option<&str>) -> Result<Self> {
        match master_key {
            Some(key) => Self::from_master_key(key),
            None => Ok(Self::disabled()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.cipher.is_some()
    }

    /// Encrypt `plaintext` for parameter `name`
    pub fn seal(&self, name: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        let Some(cipher) = &self.cipher else {
            return Ok(plaintext.to_vec());
        };

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: name.as_bytes(),
                },
            )
            .map_err(|e| Error::Encryption(format!("encryption failed: {}", e)))?;

        Ok(EncryptedData {
            nonce: nonce_bytes,
            ciphertext,
        }
        .to_bytes())
    }

    /// Decrypt a stored value for parameter `name`
    pub fn open(&self, name: &str, stored: &[u8]) -> Result<Vec<u8>> {
        let Some(cipher) = &self.cipher else {
            if EncryptedData::is_encrypted(stored) {
                return Err(Error::Encryption(
                    "value is encrypted but no master key is configured".into(),
                ));
            }
            return Ok(stored.to_vec());
        };

        let encrypted = EncryptedData::from_bytes(stored)?;
        cipher
            .decrypt(
                Nonce::from_slice(&encrypted.nonce),
                Payload {
                    msg: encrypted.ciphertext.as_ref(),
                    aad: name.as_bytes(),
                },
            )
            .map_err(|e| Error::Encryption(format!("decryption failed: {}", e)))
    }

    /// Generate a new random master key (for initial setup)
    pub fn generate_master_key() -> String {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        BASE64.encode(key)
    }
}

impl std::fmt::Debug for ParamCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamCipher")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

fn derive_key(master_key: &[u8], context: &[u8]) -> Result<[u8; KEY_SIZE]> {
    use hkdf::Hkdf;

    let hkdf = Hkdf::<Sha256>::new(None, master_key);
    let mut output = [0u8; KEY_SIZE];
    hkdf.expand(context, &mut output)
        .map_err(|e| Error::Encryption(format!("key derivation failed: {}", e)))?;

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> ParamCipher {
        ParamCipher::from_master_key(&ParamCipher::generate_master_key()).unwrap()
    }

    #[test]
    fn test_disabled_passthrough() {
        let cipher = ParamCipher::disabled();
        assert!(!cipher.is_enabled());
        let sealed = cipher.seal("/d/s/join-command", b"PLACEHOLDER").unwrap();
        assert_eq!(sealed, b"PLACEHOLDER");
        assert_eq!(cipher.open("/d/s/join-command", &sealed).unwrap(), b"PLACEHOLDER");
    }

    #[test]
    fn test_seal_open() {
        let cipher = cipher();
        let value = b"join 10.0.0.1:6443 --token ab.cd --discovery-token-ca-cert-hash sha256:00";
        let sealed = cipher.seal("/d/s/join-command", value).unwrap();

        assert!(EncryptedData::is_encrypted(&sealed));
        assert!(!sealed.windows(5).any(|w| w == b"token"));
        assert_eq!(cipher.open("/d/s/join-command", &sealed).unwrap(), value);
    }

    #[test]
    fn test_nonce_differs_per_write() {
        let cipher = cipher();
        let a = cipher.seal("k", b"same").unwrap();
        let b = cipher.seal("k", b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_value_bound_to_name() {
        let cipher = cipher();
        let sealed = cipher.seal("/d/a/join-command", b"secret").unwrap();
        assert!(cipher.open("/d/b/join-command", &sealed).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = cipher().seal("k", b"secret").unwrap();
        assert!(cipher().open("k", &sealed).is_err());
        assert!(ParamCipher::disabled().open("k", &sealed).is_err());
    }

    #[test]
    fn test_invalid_master_key() {
        assert!(ParamCipher::from_master_key("dG9vIHNob3J0").is_err());
        assert!(ParamCipher::from_master_key("not-valid-base64!!!").is_err());
    }
}
