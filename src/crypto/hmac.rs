use arrayvec::ArrayVec;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use super::{CryptoError, DigestKind, MAX_HMAC_KEY_LENGTH};

/// Largest HMAC tag we produce (SHA-512).
pub(crate) const MAX_HMAC_LEN: usize = 64;

pub(crate) type Tag = ArrayVec<u8, MAX_HMAC_LEN>;

/// HMAC key bound to its digest.
pub(crate) struct HmacKey {
    digest: DigestKind,
    key: Zeroizing<Vec<u8>>,
}

impl HmacKey {
    /// Keys longer than the digest output are truncated to it.
    pub fn new(digest: DigestKind, key: &[u8]) -> Self {
        let len = digest.output_len().min(key.len()).min(MAX_HMAC_KEY_LENGTH);
        HmacKey {
            digest,
            key: Zeroizing::new(key[..len].to_vec()),
        }
    }

    pub fn tag_len(&self) -> usize {
        self.digest.output_len()
    }

    /// HMAC over the concatenation of `parts`.
    pub fn sign(&self, parts: &[&[u8]]) -> Result<Tag, CryptoError> {
        match self.digest {
            DigestKind::None => Ok(Tag::new()),
            DigestKind::Sha1 => compute::<Hmac<Sha1>>(&self.key, parts),
            DigestKind::Sha256 => compute::<Hmac<Sha256>>(&self.key, parts),
            DigestKind::Sha512 => compute::<Hmac<Sha512>>(&self.key, parts),
        }
    }

    /// Constant-time comparison against a received tag.
    pub fn verify(&self, parts: &[&[u8]], tag: &[u8]) -> Result<(), CryptoError> {
        let expected = self.sign(parts)?;
        if tag.len() != expected.len() || !bool::from(expected[..].ct_eq(tag)) {
            return Err(CryptoError::HmacMismatch);
        }
        Ok(())
    }
}

fn compute<M: Mac + KeyInit>(key: &[u8], parts: &[&[u8]]) -> Result<Tag, CryptoError> {
    let mut mac = <M as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    for p in parts {
        mac.update(p);
    }
    let bytes = mac.finalize().into_bytes();
    let mut tag = Tag::new();
    tag.try_extend_from_slice(&bytes)
        .map_err(|_| CryptoError::InvalidKeyLength)?;
    Ok(tag)
}

impl std::fmt::Debug for HmacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacKey")
            .field("digest", &self.digest)
            .finish_non_exhaustive()
    }
}
