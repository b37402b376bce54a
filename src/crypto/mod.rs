//! Data channel cryptography.
//!
//! Everything here is stateless apart from the packet id trackers handed in
//! by the caller. Keys are held in zeroizing containers and never printed.

mod cipher;
mod hmac;
mod key;
mod pipeline;
mod prf;

use std::fmt;
use std::str::FromStr;

pub use key::{Key2, KeyDirection, KeyIndices, KeyMaterial};
pub use key::{MAX_CIPHER_KEY_LENGTH, MAX_HMAC_KEY_LENGTH};
pub use pipeline::{CipherPipeline, CryptoPolicy};

pub(crate) use self::hmac::HmacKey;
pub(crate) use prf::{generate_key_expansion, KeySource};

use crate::packet_id::ReplayError;

/// Block size of every supported cipher (AES).
pub const CIPHER_BLOCK_SIZE: usize = 16;

/// Failure inside the cipher pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("Packet too short")]
    Truncated,

    #[error("HMAC authentication failed")]
    HmacMismatch,

    #[error("Packet id rejected: {0}")]
    Replay(ReplayError),

    #[error("Decryption failed")]
    DecryptFailed,

    #[error("Invalid key or IV length")]
    InvalidKeyLength,

    #[error("Packet id space exhausted")]
    PacketIdExhausted,
}

/// Symmetric cipher of the data channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherKind {
    /// No encryption, authentication only.
    None,
    Aes128Cbc,
    Aes256Cbc,
    Aes128Cfb,
    Aes256Cfb,
    Aes128Ofb,
    Aes256Ofb,
}

/// Block cipher chaining mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    None,
    Cbc,
    Cfb,
    Ofb,
}

impl CipherKind {
    pub fn mode(&self) -> CipherMode {
        match self {
            CipherKind::None => CipherMode::None,
            CipherKind::Aes128Cbc | CipherKind::Aes256Cbc => CipherMode::Cbc,
            CipherKind::Aes128Cfb | CipherKind::Aes256Cfb => CipherMode::Cfb,
            CipherKind::Aes128Ofb | CipherKind::Aes256Ofb => CipherMode::Ofb,
        }
    }

    pub fn key_len(&self) -> usize {
        match self {
            CipherKind::None => 0,
            CipherKind::Aes128Cbc | CipherKind::Aes128Cfb | CipherKind::Aes128Ofb => 16,
            CipherKind::Aes256Cbc | CipherKind::Aes256Cfb | CipherKind::Aes256Ofb => 32,
        }
    }

    pub fn iv_len(&self) -> usize {
        match self {
            CipherKind::None => 0,
            _ => CIPHER_BLOCK_SIZE,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CipherKind::None => "none",
            CipherKind::Aes128Cbc => "AES-128-CBC",
            CipherKind::Aes256Cbc => "AES-256-CBC",
            CipherKind::Aes128Cfb => "AES-128-CFB",
            CipherKind::Aes256Cfb => "AES-256-CFB",
            CipherKind::Aes128Ofb => "AES-128-OFB",
            CipherKind::Aes256Ofb => "AES-256-OFB",
        }
    }

    fn all() -> &'static [CipherKind] {
        &[
            CipherKind::None,
            CipherKind::Aes128Cbc,
            CipherKind::Aes256Cbc,
            CipherKind::Aes128Cfb,
            CipherKind::Aes256Cfb,
            CipherKind::Aes128Ofb,
            CipherKind::Aes256Ofb,
        ]
    }
}

impl FromStr for CipherKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CipherKind::all()
            .iter()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| format!("Unknown cipher: {}", s))
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// HMAC digest of the data channel and tls-auth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestKind {
    /// No authentication.
    None,
    Sha1,
    Sha256,
    Sha512,
}

impl DigestKind {
    /// Length of the HMAC tag on the wire. Also the HMAC key length used.
    pub fn output_len(&self) -> usize {
        match self {
            DigestKind::None => 0,
            DigestKind::Sha1 => 20,
            DigestKind::Sha256 => 32,
            DigestKind::Sha512 => 64,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DigestKind::None => "none",
            DigestKind::Sha1 => "SHA1",
            DigestKind::Sha256 => "SHA256",
            DigestKind::Sha512 => "SHA512",
        }
    }
}

impl FromStr for DigestKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            DigestKind::None,
            DigestKind::Sha1,
            DigestKind::Sha256,
            DigestKind::Sha512,
        ]
        .into_iter()
        .find(|d| d.name().eq_ignore_ascii_case(s))
        .ok_or_else(|| format!("Unknown digest: {}", s))
    }
}

impl fmt::Display for DigestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
