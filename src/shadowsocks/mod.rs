//! Shadowsocks AEAD protocol
//!
//! Wire layout, per direction:
//!
//! ```text
//! +------+--------------------+---------------------------+----
//! | salt | len frame (2+tag)  | payload frame (len+tag)   | ...
//! +------+--------------------+---------------------------+----
//! ```
//!
//! The salt length equals the cipher key length. Each frame is sealed with
//! the per-session subkey HKDF-SHA1(salt, master key, "ss-subkey") and a
//! little-endian counter nonce incremented once per AEAD operation.
//!
//! A server carries an ordered list of ciphers, one per access key. The
//! list index doubles as the access-key identifier; [`identify`] selects
//! the entry that authenticates a new connection's first length frame.

mod identify;
mod stream;

pub use identify::{identify, ReplayTee};
pub use stream::{ShadowReader, ShadowWriter};

use std::sync::Arc;

use crate::crypto::{evp_bytes_to_key, session_subkey, AeadCipher, CipherKind};
use crate::error::{Error, Result};

/// One access key: an AEAD method plus the master key derived from its secret
pub struct Cipher {
    kind: CipherKind,
    master_key: Vec<u8>,
}

impl Cipher {
    /// Create a cipher from a method and a plaintext secret
    pub fn new(kind: CipherKind, secret: &str) -> Self {
        let master_key = evp_bytes_to_key(secret.as_bytes(), kind.key_size());
        Self { kind, master_key }
    }

    /// Parse a `method:secret` entry.
    ///
    /// Splits on the first colon only, so secrets may contain colons.
    pub fn from_entry(entry: &str) -> Result<Self> {
        let (name, secret) = entry
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("Invalid cipher entry {:?}: missing colon", entry)))?;
        let kind = CipherKind::from_name(name)?;
        Ok(Self::new(kind, secret))
    }

    /// Get the cipher method
    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Get the salt length for this cipher
    pub fn salt_len(&self) -> usize {
        self.kind.salt_size()
    }

    /// Derive the AEAD session cipher for one direction from its salt
    pub fn session(&self, salt: &[u8]) -> Result<AeadCipher> {
        let subkey = session_subkey(&self.master_key, salt)?;
        AeadCipher::new(self.kind, &subkey)
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("Cipher").field("kind", &self.kind).finish()
    }
}

/// Ordered, immutable list of ciphers. The position of an entry is its
/// access-key identifier and its trial order.
#[derive(Debug, Default)]
pub struct CipherList {
    ciphers: Vec<Arc<Cipher>>,
}

impl CipherList {
    pub fn new(ciphers: Vec<Cipher>) -> Self {
        Self {
            ciphers: ciphers.into_iter().map(Arc::new).collect(),
        }
    }

    /// Build a list from `method:secret` entries, preserving order
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        let ciphers = entries
            .iter()
            .map(|e| Cipher::from_entry(e.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(ciphers))
    }

    pub fn len(&self) -> usize {
        self.ciphers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ciphers.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Cipher>> {
        self.ciphers.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Cipher>> {
        self.ciphers.iter()
    }
}
