//! Authenticated encryption of one datagram payload.
//!
//! Wire layout, with every field optional according to the policy:
//!
//! ```text
//! HMAC | IV | packet id | ciphertext
//! ```
//!
//! The HMAC covers everything after it. The IV is only carried for CBC with
//! `use_iv`; CBC without it uses an all-zero IV, and CFB/OFB derive the IV
//! from the packet id, which is why those modes require both replay
//! protection and `use_iv`.

use super::cipher;
use super::{CipherKind, CipherMode, CryptoError, DigestKind, HmacKey, KeyMaterial};
use crate::buffer::Buf;
use crate::packet_id::{PacketId, PacketIdRecv, PacketIdSend};
use crate::{Error, SeededRng};

/// How the data channel (or tls-auth) protects packets.
///
/// Shared read-only by every pipeline built from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoPolicy {
    pub cipher: CipherKind,
    pub digest: DigestKind,
    /// Carry a random IV (CBC) or allow IV derivation (CFB/OFB).
    pub use_iv: bool,
    /// Carry and check packet ids.
    pub replay_protect: bool,
    /// Prefix the packet id with a timestamp.
    pub long_form: bool,
}

impl CryptoPolicy {
    /// Policy for the HMAC firewall on control packets.
    pub fn tls_auth(digest: DigestKind) -> Self {
        CryptoPolicy {
            cipher: CipherKind::None,
            digest,
            use_iv: false,
            replay_protect: true,
            long_form: true,
        }
    }

    /// Reject combinations that would reuse an IV.
    pub fn validate(&self) -> Result<(), Error> {
        match self.cipher.mode() {
            CipherMode::Cfb | CipherMode::Ofb if !self.replay_protect => {
                Err(Error::ConfigError(format!(
                    "{} requires replay protection",
                    self.cipher
                )))
            }
            CipherMode::Cfb | CipherMode::Ofb if !self.use_iv => Err(Error::ConfigError(
                format!("{} requires use_iv", self.cipher),
            )),
            _ => Ok(()),
        }
    }

    fn iv_on_wire(&self) -> usize {
        if self.cipher.mode() == CipherMode::Cbc && self.use_iv {
            self.cipher.iv_len()
        } else {
            0
        }
    }

    fn packet_id_len(&self) -> usize {
        if self.replay_protect {
            PacketId::wire_len(self.long_form)
        } else {
            0
        }
    }

    /// Bytes added to a payload, excluding cipher padding.
    pub fn overhead(&self) -> usize {
        self.digest.output_len() + self.iv_on_wire() + self.packet_id_len()
    }
}

/// A policy bound to one direction's key material.
pub struct CipherPipeline {
    policy: CryptoPolicy,
    cipher_key: KeyMaterial,
    hmac: HmacKey,
}

impl CipherPipeline {
    pub fn new(policy: CryptoPolicy, key: &KeyMaterial) -> Self {
        CipherPipeline {
            policy,
            cipher_key: key.clone(),
            hmac: HmacKey::new(policy.digest, key.hmac()),
        }
    }

    pub fn policy(&self) -> &CryptoPolicy {
        &self.policy
    }

    /// Protect `plaintext` and append the result to `out`.
    ///
    /// On failure `out` is restored to its previous length.
    pub fn encrypt(
        &self,
        packet_id: &mut PacketIdSend,
        now_secs: u32,
        rng: &mut SeededRng,
        plaintext: &[u8],
        out: &mut Buf,
    ) -> Result<(), CryptoError> {
        let start = out.len();
        let result = self.do_encrypt(packet_id, now_secs, rng, plaintext, out, start);
        if result.is_err() {
            out.truncate(start);
        }
        result
    }

    fn do_encrypt(
        &self,
        packet_id: &mut PacketIdSend,
        now_secs: u32,
        rng: &mut SeededRng,
        plaintext: &[u8],
        out: &mut Buf,
        start: usize,
    ) -> Result<(), CryptoError> {
        let p = &self.policy;
        let hmac_len = self.hmac.tag_len();
        out.resize(start + hmac_len, 0);

        let pid = if p.replay_protect {
            Some(packet_id.next(now_secs)?)
        } else {
            None
        };

        let mut iv = [0u8; 16];
        match p.cipher.mode() {
            CipherMode::Cbc if p.use_iv => {
                rng.fill_bytes(&mut iv);
                out.extend_from_slice(&iv);
            }
            CipherMode::Cfb | CipherMode::Ofb => {
                let pid = pid.ok_or(CryptoError::InvalidKeyLength)?;
                iv = iv_from_packet_id(pid, p.long_form);
            }
            _ => {}
        }

        if let Some(pid) = pid {
            pid.serialize(p.long_form, out);
        }

        cipher::encrypt(
            p.cipher,
            self.cipher_key.cipher(),
            &iv[..p.cipher.iv_len()],
            plaintext,
            out,
        )?;

        if hmac_len > 0 {
            let tag = self.hmac.sign(&[&out[start + hmac_len..]])?;
            out[start..start + hmac_len].copy_from_slice(&tag);
        }

        Ok(())
    }

    /// Verify and decrypt `packet`, appending the plaintext to `out`.
    ///
    /// The HMAC is checked before anything else, then the packet id is
    /// tested against the replay window. The id is only recorded once the
    /// payload decrypted, so a failed packet leaves the window untouched.
    /// An armed [`PacketIdRecv::ignore_next`] skips the test but the id is
    /// still recorded.
    pub fn decrypt(
        &self,
        packet_id: &mut PacketIdRecv,
        packet: &[u8],
        out: &mut Buf,
    ) -> Result<(), CryptoError> {
        let p = &self.policy;
        let hmac_len = self.hmac.tag_len();

        if packet.len() < hmac_len + p.iv_on_wire() + p.packet_id_len() {
            return Err(CryptoError::Truncated);
        }

        let (tag, rest) = packet.split_at(hmac_len);
        if hmac_len > 0 {
            self.hmac.verify(&[rest], tag)?;
        }

        let (wire_iv, rest) = rest.split_at(p.iv_on_wire());

        let (pid, body) = if p.replay_protect {
            let (body, pid) =
                PacketId::parse(rest, p.long_form).map_err(|_| CryptoError::Truncated)?;
            (Some(pid), body)
        } else {
            (None, rest)
        };

        let ignoring = packet_id.is_ignoring();
        if let Some(pid) = pid {
            if !ignoring {
                packet_id.test(pid).map_err(CryptoError::Replay)?;
            }
        }

        let mut iv = [0u8; 16];
        match p.cipher.mode() {
            CipherMode::Cbc if p.use_iv => iv.copy_from_slice(wire_iv),
            CipherMode::Cfb | CipherMode::Ofb => {
                let pid = pid.ok_or(CryptoError::DecryptFailed)?;
                iv = iv_from_packet_id(pid, p.long_form);
            }
            _ => {}
        }

        let start = out.len();
        if let Err(e) = cipher::decrypt(
            p.cipher,
            self.cipher_key.cipher(),
            &iv[..p.cipher.iv_len()],
            body,
            out,
        ) {
            out.truncate(start);
            return Err(e);
        }

        if ignoring {
            packet_id.clear_ignore();
        }
        if let Some(pid) = pid {
            packet_id.add(pid);
        }

        Ok(())
    }
}

// The packet id, zero padded to a cipher block.
fn iv_from_packet_id(pid: PacketId, long_form: bool) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..4].copy_from_slice(&pid.id.to_be_bytes());
    if long_form {
        iv[4..8].copy_from_slice(&pid.time.to_be_bytes());
    }
    iv
}

impl std::fmt::Debug for CipherPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherPipeline")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}
