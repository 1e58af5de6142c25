//! Cryptography module for Shadowmux
//!
//! Provides the AEAD primitives and key schedule used by the Shadowsocks
//! framing layer:
//! - ChaCha20-Poly1305, AES-128-GCM, AES-256-GCM
//! - EVP_BytesToKey master-key derivation from a secret
//! - HKDF-SHA1 per-session subkey derivation

mod aead;

pub use aead::{AeadCipher, CipherKind};

use crate::error::{Error, Result};

/// Nonce size for AEAD ciphers (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Tag size for AEAD ciphers (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Maximum payload bytes in a single frame (0x3FFF per the AEAD spec)
pub const MAX_PAYLOAD_LEN: usize = 0x3FFF;

/// HKDF info string fixed by the Shadowsocks AEAD spec
const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Generate cryptographically secure random bytes
pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Derive a master key from a secret using OpenSSL's EVP_BytesToKey
/// (MD5, no salt, one round), as mandated for Shadowsocks passwords.
pub fn evp_bytes_to_key(secret: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + 16);
    let mut last: Option<md5::Digest> = None;

    while key.len() < key_len {
        let digest = match &last {
            Some(prev) => {
                let mut input = Vec::with_capacity(16 + secret.len());
                input.extend_from_slice(&prev.0);
                input.extend_from_slice(secret);
                md5::compute(&input)
            }
            None => md5::compute(secret),
        };
        key.extend_from_slice(&digest.0);
        last = Some(digest);
    }

    key.truncate(key_len);
    key
}

/// Derive the per-session subkey from the master key and the connection salt
/// using HKDF-SHA1 with the fixed `ss-subkey` info string.
pub fn session_subkey(master_key: &[u8], salt: &[u8]) -> Result<Vec<u8>> {
    use hkdf::Hkdf;
    use sha1::Sha1;

    let hk = Hkdf::<Sha1>::new(Some(salt), master_key);
    let mut okm = vec![0u8; master_key.len()];
    hk.expand(SUBKEY_INFO, &mut okm)
        .map_err(|e| Error::Crypto(format!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}

/// Increment a little-endian counter nonce by one.
///
/// Each direction of a connection runs its own counter starting at zero,
/// bumped once per AEAD operation.
pub fn increment_nonce(nonce: &mut [u8]) {
    for byte in nonce.iter_mut() {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let bytes1 = random_bytes(32);
        let bytes2 = random_bytes(32);
        assert_eq!(bytes1.len(), 32);
        assert_ne!(bytes1, bytes2);
    }

    #[test]
    fn test_evp_bytes_to_key_matches_openssl() {
        // First block is MD5(secret); the next is MD5(prev || secret).
        let secret = b"barbarian@def";
        let key = evp_bytes_to_key(secret, 32);

        let first = md5::compute(secret);
        assert_eq!(&key[..16], &first.0);

        let mut input = Vec::new();
        input.extend_from_slice(&first.0);
        input.extend_from_slice(secret);
        let second = md5::compute(&input);
        assert_eq!(&key[16..], &second.0);
    }

    #[test]
    fn test_evp_bytes_to_key_known_vector() {
        // MD5("password") = 5f4dcc3b5aa765d61d8327deb882cf99
        let key = evp_bytes_to_key(b"password", 16);
        assert_eq!(
            key,
            [
                0x5f, 0x4d, 0xcc, 0x3b, 0x5a, 0xa7, 0x65, 0xd6, 0x1d, 0x83, 0x27, 0xde, 0xb8,
                0x82, 0xcf, 0x99
            ]
        );
    }

    #[test]
    fn test_session_subkey() {
        let master = evp_bytes_to_key(b"password", 32);
        let salt_a = random_bytes(32);
        let salt_b = random_bytes(32);

        let sub_a = session_subkey(&master, &salt_a).unwrap();
        let sub_b = session_subkey(&master, &salt_b).unwrap();

        assert_eq!(sub_a.len(), 32);
        assert_ne!(sub_a, sub_b);
        // Same inputs derive the same subkey.
        assert_eq!(sub_a, session_subkey(&master, &salt_a).unwrap());
    }

    #[test]
    fn test_increment_nonce() {
        let mut nonce = [0u8; NONCE_SIZE];
        increment_nonce(&mut nonce);
        assert_eq!(nonce[0], 1);
        assert_eq!(&nonce[1..], &[0u8; 11]);

        let mut nonce = [0xFFu8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        increment_nonce(&mut nonce);
        assert_eq!(nonce[0], 0);
        assert_eq!(nonce[1], 1);
    }
}
