//! AEAD (Authenticated Encryption with Associated Data) ciphers
//!
//! Supports the Shadowsocks AEAD methods:
//! - chacha20-ietf-poly1305
//! - aes-128-gcm
//! - aes-256-gcm

use aes_gcm::{
    aead::{Aead as AeadTrait, KeyInit},
    Aes128Gcm, Aes256Gcm, Nonce,
};
use chacha20poly1305::ChaCha20Poly1305;

use crate::error::{Error, Result};

use super::{NONCE_SIZE, TAG_SIZE};

/// Cipher methods supported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherKind {
    ChaCha20Poly1305,
    Aes128Gcm,
    Aes256Gcm,
}

impl CipherKind {
    /// Look up a cipher by its Shadowsocks method name.
    ///
    /// Only AEAD methods are listed; an unknown (or stream-cipher) name is
    /// a configuration error.
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Ok(CipherKind::ChaCha20Poly1305),
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            _ => Err(Error::Config(format!(
                "Unsupported cipher: {} (only AEAD ciphers are supported)",
                name
            ))),
        }
    }

    /// Get the Shadowsocks method name for this cipher
    pub fn name(&self) -> &'static str {
        match self {
            CipherKind::ChaCha20Poly1305 => "chacha20-ietf-poly1305",
            CipherKind::Aes128Gcm => "aes-128-gcm",
            CipherKind::Aes256Gcm => "aes-256-gcm",
        }
    }

    /// Get the key size for this cipher
    pub fn key_size(&self) -> usize {
        match self {
            CipherKind::ChaCha20Poly1305 => 32,
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm => 32,
        }
    }

    /// Get the salt size for this cipher (equals the key size)
    pub fn salt_size(&self) -> usize {
        self.key_size()
    }

    /// Get the nonce size for this cipher
    pub fn nonce_size(&self) -> usize {
        NONCE_SIZE
    }

    /// Get the tag size for this cipher
    pub fn tag_size(&self) -> usize {
        TAG_SIZE
    }
}

/// AEAD cipher instance bound to one session subkey
pub struct AeadCipher {
    kind: CipherKind,
    inner: CipherInner,
}

enum CipherInner {
    ChaCha20Poly1305(ChaCha20Poly1305),
    Aes128Gcm(Aes128Gcm),
    Aes256Gcm(Aes256Gcm),
}

impl AeadCipher {
    /// Create a new AEAD cipher with the given key
    pub fn new(kind: CipherKind, key: &[u8]) -> Result<Self> {
        if key.len() != kind.key_size() {
            return Err(Error::Crypto(format!(
                "Invalid key size: expected {}, got {}",
                kind.key_size(),
                key.len()
            )));
        }

        let inner = match kind {
            CipherKind::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new_from_slice(key)
                    .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)))?;
                CipherInner::ChaCha20Poly1305(cipher)
            }
            CipherKind::Aes128Gcm => {
                let cipher = Aes128Gcm::new_from_slice(key)
                    .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)))?;
                CipherInner::Aes128Gcm(cipher)
            }
            CipherKind::Aes256Gcm => {
                let cipher = Aes256Gcm::new_from_slice(key)
                    .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)))?;
                CipherInner::Aes256Gcm(cipher)
            }
        };

        Ok(Self { kind, inner })
    }

    /// Encrypt plaintext, producing ciphertext with a trailing tag
    pub fn seal(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_SIZE {
            return Err(Error::Crypto(format!(
                "Invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce.len()
            )));
        }

        let nonce = Nonce::from_slice(nonce);

        let result = match &self.inner {
            CipherInner::ChaCha20Poly1305(cipher) => cipher.encrypt(nonce, plaintext),
            CipherInner::Aes128Gcm(cipher) => cipher.encrypt(nonce, plaintext),
            CipherInner::Aes256Gcm(cipher) => cipher.encrypt(nonce, plaintext),
        };

        result.map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))
    }

    /// Decrypt ciphertext, verifying the trailing tag.
    ///
    /// Returns [`Error::AuthFailed`] if the tag does not verify, so callers
    /// can tell a wrong key apart from transport errors.
    pub fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_SIZE {
            return Err(Error::Crypto(format!(
                "Invalid nonce size: expected {}, got {}",
                NONCE_SIZE,
                nonce.len()
            )));
        }

        if ciphertext.len() < TAG_SIZE {
            return Err(Error::Crypto("Ciphertext too short".to_string()));
        }

        let nonce = Nonce::from_slice(nonce);

        let result = match &self.inner {
            CipherInner::ChaCha20Poly1305(cipher) => cipher.decrypt(nonce, ciphertext),
            CipherInner::Aes128Gcm(cipher) => cipher.decrypt(nonce, ciphertext),
            CipherInner::Aes256Gcm(cipher) => cipher.decrypt(nonce, ciphertext),
        };

        result.map_err(|_| Error::AuthFailed)
    }

    /// Get the cipher kind
    pub fn kind(&self) -> CipherKind {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_bytes;

    #[test]
    fn test_chacha20_poly1305_roundtrip() {
        let key = random_bytes(32);
        let cipher = AeadCipher::new(CipherKind::ChaCha20Poly1305, &key).unwrap();

        let nonce = [0u8; 12];
        let plaintext = b"Hello, World!";

        let ciphertext = cipher.seal(&nonce, plaintext).unwrap();
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_SIZE);

        let decrypted = cipher.open(&nonce, &ciphertext).unwrap();
        assert_eq!(plaintext.as_slice(), decrypted.as_slice());
    }

    #[test]
    fn test_aes_128_gcm_roundtrip() {
        let key = random_bytes(16);
        let cipher = AeadCipher::new(CipherKind::Aes128Gcm, &key).unwrap();

        let nonce = [0u8; 12];
        let plaintext = b"Hello, World!";

        let ciphertext = cipher.seal(&nonce, plaintext).unwrap();
        let decrypted = cipher.open(&nonce, &ciphertext).unwrap();

        assert_eq!(plaintext.as_slice(), decrypted.as_slice());
    }

    #[test]
    fn test_aes_256_gcm_roundtrip() {
        let key = random_bytes(32);
        let cipher = AeadCipher::new(CipherKind::Aes256Gcm, &key).unwrap();

        let nonce = [0u8; 12];
        let plaintext = b"Hello, World!";

        let ciphertext = cipher.seal(&nonce, plaintext).unwrap();
        let decrypted = cipher.open(&nonce, &ciphertext).unwrap();

        assert_eq!(plaintext.as_slice(), decrypted.as_slice());
    }

    #[test]
    fn test_wrong_key_fails_auth() {
        let key1 = random_bytes(32);
        let key2 = random_bytes(32);

        let cipher1 = AeadCipher::new(CipherKind::Aes256Gcm, &key1).unwrap();
        let cipher2 = AeadCipher::new(CipherKind::Aes256Gcm, &key2).unwrap();

        let nonce = [0u8; 12];
        let ciphertext = cipher1.seal(&nonce, b"payload").unwrap();

        match cipher2.open(&nonce, &ciphertext) {
            Err(Error::AuthFailed) => {}
            other => panic!("expected AuthFailed, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_invalid_key_size() {
        let key = random_bytes(17);
        assert!(AeadCipher::new(CipherKind::Aes128Gcm, &key).is_err());
    }

    #[test]
    fn test_kind_from_name() {
        assert_eq!(
            CipherKind::from_name("aes-256-gcm").unwrap(),
            CipherKind::Aes256Gcm
        );
        assert_eq!(
            CipherKind::from_name("CHACHA20-IETF-POLY1305").unwrap(),
            CipherKind::ChaCha20Poly1305
        );
        // Stream ciphers are rejected at configuration time.
        assert!(CipherKind::from_name("aes-256-cfb").is_err());
        assert!(CipherKind::from_name("rc4-md5").is_err());
    }
}
