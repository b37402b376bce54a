use std::fmt;
use std::str::FromStr;

use zeroize::Zeroize;

use crate::{Error, SeededRng};

/// Room reserved for a cipher key, whatever the cipher.
pub const MAX_CIPHER_KEY_LENGTH: usize = 64;

/// Room reserved for an HMAC key, whatever the digest.
pub const MAX_HMAC_KEY_LENGTH: usize = 64;

/// One direction's worth of keys: a cipher key and an HMAC key.
///
/// Only the leading bytes matching the negotiated cipher and digest are
/// used. The material is wiped on drop.
#[derive(Clone)]
pub struct KeyMaterial {
    cipher: [u8; MAX_CIPHER_KEY_LENGTH],
    hmac: [u8; MAX_HMAC_KEY_LENGTH],
}

impl KeyMaterial {
    pub const LEN: usize = MAX_CIPHER_KEY_LENGTH + MAX_HMAC_KEY_LENGTH;

    pub fn new(cipher: &[u8], hmac: &[u8]) -> Self {
        let mut k = KeyMaterial {
            cipher: [0; MAX_CIPHER_KEY_LENGTH],
            hmac: [0; MAX_HMAC_KEY_LENGTH],
        };
        let c = cipher.len().min(MAX_CIPHER_KEY_LENGTH);
        let h = hmac.len().min(MAX_HMAC_KEY_LENGTH);
        k.cipher[..c].copy_from_slice(&cipher[..c]);
        k.hmac[..h].copy_from_slice(&hmac[..h]);
        k
    }

    /// Split a 128 byte block: cipher key first, then HMAC key.
    pub fn from_block(block: &[u8]) -> Self {
        let (cipher, hmac) = block.split_at(MAX_CIPHER_KEY_LENGTH.min(block.len()));
        Self::new(cipher, hmac)
    }

    pub fn random(rng: &mut SeededRng) -> Self {
        let mut k = KeyMaterial::new(&[], &[]);
        rng.fill_bytes(&mut k.cipher);
        rng.fill_bytes(&mut k.hmac);
        k
    }

    pub fn cipher(&self) -> &[u8] {
        &self.cipher
    }

    pub fn hmac(&self) -> &[u8] {
        &self.hmac
    }

    pub(crate) fn write_block(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.cipher);
        out.extend_from_slice(&self.hmac);
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.cipher.zeroize();
        self.hmac.zeroize();
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial").finish_non_exhaustive()
    }
}

/// Two key sets, one per direction, as produced by key expansion or read
/// from a static key file. Which one is used for sending is decided by the
/// [`KeyDirection`].
#[derive(Clone)]
pub struct Key2 {
    keys: [KeyMaterial; 2],
}

impl Key2 {
    pub const LEN: usize = KeyMaterial::LEN * 2;

    pub fn new(first: KeyMaterial, second: KeyMaterial) -> Self {
        Key2 {
            keys: [first, second],
        }
    }

    /// Build from a `Key2::LEN` byte block.
    pub fn from_block(block: &[u8]) -> Result<Self, Error> {
        if block.len() != Self::LEN {
            return Err(Error::CryptoError(
                crate::crypto::CryptoError::InvalidKeyLength,
            ));
        }
        let (a, b) = block.split_at(KeyMaterial::LEN);
        Ok(Key2::new(KeyMaterial::from_block(a), KeyMaterial::from_block(b)))
    }

    pub fn random(rng: &mut SeededRng) -> Self {
        Key2::new(KeyMaterial::random(rng), KeyMaterial::random(rng))
    }

    pub fn key(&self, index: usize) -> &KeyMaterial {
        &self.keys[index & 1]
    }

    pub fn to_block(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        self.keys[0].write_block(&mut out);
        self.keys[1].write_block(&mut out);
        out
    }
}

impl fmt::Debug for Key2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key2").finish_non_exhaustive()
    }
}

/// Which half of a [`Key2`] each side sends with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDirection {
    /// Both directions use key 0.
    Bidirectional,
    /// Send with key 0, receive with key 1.
    Normal,
    /// Send with key 1, receive with key 0.
    Inverse,
}

/// Indices into a [`Key2`] for each direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyIndices {
    pub send: usize,
    pub recv: usize,
}

impl KeyDirection {
    pub fn indices(self) -> KeyIndices {
        match self {
            KeyDirection::Bidirectional => KeyIndices { send: 0, recv: 0 },
            KeyDirection::Normal => KeyIndices { send: 0, recv: 1 },
            KeyDirection::Inverse => KeyIndices { send: 1, recv: 0 },
        }
    }

    /// The direction the peer must use for keys to line up.
    pub fn complement(self) -> Self {
        match self {
            KeyDirection::Bidirectional => KeyDirection::Bidirectional,
            KeyDirection::Normal => KeyDirection::Inverse,
            KeyDirection::Inverse => KeyDirection::Normal,
        }
    }

    /// Check that the two sides agree and return the local indices.
    pub fn resolve(local: KeyDirection, remote: KeyDirection) -> Result<KeyIndices, Error> {
        if remote != local.complement() {
            return Err(Error::KeyDirectionMismatch(local, remote));
        }
        Ok(local.indices())
    }
}

impl FromStr for KeyDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0" => Ok(KeyDirection::Normal),
            "1" => Ok(KeyDirection::Inverse),
            "bidirectional" | "" => Ok(KeyDirection::Bidirectional),
            _ => Err(format!("Invalid key direction: {}", s)),
        }
    }
}
