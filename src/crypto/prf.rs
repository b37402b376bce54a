//! TLS 1.0 PRF and data channel key expansion.
//!
//! PRF(secret, label, seed) = P_MD5(S1, label + seed) XOR P_SHA1(S2, label + seed)
//!
//! where S1 and S2 are the two (possibly overlapping) halves of the secret.

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use md5::Md5;
use sha1::Sha1;
use zeroize::{Zeroize, Zeroizing};

use super::{CryptoError, Key2};
use crate::session_id::SessionId;
use crate::SeededRng;

/// Prefix of both key expansion labels.
pub const KEY_EXPANSION_ID: &str = "OpenVPN";

const MASTER_SECRET_LEN: usize = 48;

fn compute_full_seed(label: &str, parts: &[&[u8]]) -> Vec<u8> {
    let mut full_seed = label.as_bytes().to_vec();
    for p in parts {
        full_seed.extend_from_slice(p);
    }
    full_seed
}

fn p_hash<M: Mac + KeyInit + Clone>(
    secret: &[u8],
    full_seed: &[u8],
    out: &mut [u8],
) -> Result<(), CryptoError> {
    let key = <M as Mac>::new_from_slice(secret).map_err(|_| CryptoError::InvalidKeyLength)?;

    // A(1) = HMAC_hash(secret, A(0)) where A(0) = seed
    let mut a = {
        let mut m = key.clone();
        m.update(full_seed);
        m.finalize().into_bytes()
    };

    let mut pos = 0;
    while pos < out.len() {
        // HMAC_hash(secret, A(i) + seed)
        let mut m = key.clone();
        m.update(&a);
        m.update(full_seed);
        let chunk = m.finalize().into_bytes();

        let n = (out.len() - pos).min(chunk.len());
        out[pos..pos + n].copy_from_slice(&chunk[..n]);
        pos += n;

        // A(i+1) = HMAC_hash(secret, A(i))
        let mut m = key.clone();
        m.update(&a);
        a = m.finalize().into_bytes();
    }

    Ok(())
}

/// Fill `out` with PRF output.
pub(crate) fn tls1_prf(
    secret: &[u8],
    label: &str,
    seed: &[&[u8]],
    out: &mut [u8],
) -> Result<(), CryptoError> {
    let full_seed = compute_full_seed(label, seed);

    let half = (secret.len() + 1) / 2;
    let s1 = &secret[..half];
    let s2 = &secret[secret.len() - half..];

    p_hash::<Hmac<Md5>>(s1, &full_seed, out)?;

    let mut sha = Zeroizing::new(vec![0u8; out.len()]);
    p_hash::<Hmac<Sha1>>(s2, &full_seed, &mut sha)?;

    for (o, s) in out.iter_mut().zip(sha.iter()) {
        *o ^= s;
    }
    Ok(())
}

/// Random contribution of one side to key method 2.
///
/// Only the client's `pre_master` is used.
#[derive(Clone)]
pub(crate) struct KeySource {
    pub pre_master: [u8; 48],
    pub random1: [u8; 32],
    pub random2: [u8; 32],
}

impl KeySource {
    pub const CLIENT_LEN: usize = 48 + 32 + 32;
    pub const SERVER_LEN: usize = 32 + 32;

    pub fn random(rng: &mut SeededRng, client: bool) -> Self {
        let mut k = KeySource {
            pre_master: [0; 48],
            random1: [0; 32],
            random2: [0; 32],
        };
        if client {
            rng.fill_bytes(&mut k.pre_master);
        }
        rng.fill_bytes(&mut k.random1);
        rng.fill_bytes(&mut k.random2);
        k
    }

    pub fn write(&self, client: bool, out: &mut Vec<u8>) {
        if client {
            out.extend_from_slice(&self.pre_master);
        }
        out.extend_from_slice(&self.random1);
        out.extend_from_slice(&self.random2);
    }

    pub fn read(input: &[u8], client: bool) -> Option<Self> {
        let expected = if client {
            Self::CLIENT_LEN
        } else {
            Self::SERVER_LEN
        };
        if input.len() != expected {
            return None;
        }
        let mut k = KeySource {
            pre_master: [0; 48],
            random1: [0; 32],
            random2: [0; 32],
        };
        let rest = if client {
            k.pre_master.copy_from_slice(&input[..48]);
            &input[48..]
        } else {
            input
        };
        k.random1.copy_from_slice(&rest[..32]);
        k.random2.copy_from_slice(&rest[32..64]);
        Some(k)
    }
}

impl Drop for KeySource {
    fn drop(&mut self) {
        self.pre_master.zeroize();
        self.random1.zeroize();
        self.random2.zeroize();
    }
}

/// Derive both directions' keys from the two key sources.
///
/// The result is identical on both sides. The client sends with key 0 and
/// the server with key 1.
pub(crate) fn generate_key_expansion(
    client: &KeySource,
    server: &KeySource,
    client_sid: &SessionId,
    server_sid: &SessionId,
) -> Result<Key2, CryptoError> {
    let mut master = Zeroizing::new([0u8; MASTER_SECRET_LEN]);
    tls1_prf(
        &client.pre_master,
        &format!("{} master secret", KEY_EXPANSION_ID),
        &[&client.random1[..], &server.random1[..]],
        &mut master[..],
    )?;

    let mut block = Zeroizing::new([0u8; Key2::LEN]);
    tls1_prf(
        &master[..],
        &format!("{} key expansion", KEY_EXPANSION_ID),
        &[
            &client.random2[..],
            &server.random2[..],
            client_sid.as_bytes(),
            server_sid.as_bytes(),
        ],
        &mut block[..],
    )?;

    Key2::from_block(&block[..]).map_err(|_| CryptoError::InvalidKeyLength)
}
