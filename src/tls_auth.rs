//! HMAC firewall on control packets ("tls-auth").
//!
//! With a pre-shared [`Key2`], every control packet carries an HMAC and a
//! long-form packet id right after the session id:
//!
//! ```text
//! op/key_id | session_id | HMAC | packet id | acks .. | message_id | payload
//! ```
//!
//! The HMAC covers `packet id | op/key_id | session_id | acks ..`. That is
//! the cipher pipeline's `HMAC | packet id | body` layout with the first
//! nine bytes moved to the body, so the pipeline does the work once the
//! header has been swapped around.

use std::time::Instant;

use crate::buffer::Buf;
use crate::crypto::{CipherPipeline, CryptoError, CryptoPolicy, DigestKind, Key2, KeyDirection};
use crate::packet_id::{PacketId, PacketIdRecv, PacketIdSend};
use crate::session_id::SessionId;
use crate::time_tricks::InstantExt;
use crate::wire::{split_header, ControlPacket, Opcode};
use crate::{Config, SeededRng};

const HEADER_LEN: usize = 1 + SessionId::LEN;

/// Pre-shared key and direction for tls-auth.
#[derive(Debug, Clone)]
pub struct TlsAuthKey {
    pub key: Key2,
    pub direction: KeyDirection,
    pub digest: DigestKind,
}

/// Per-session tls-auth state.
#[derive(Debug)]
pub(crate) struct TlsAuth {
    encrypt: CipherPipeline,
    decrypt: CipherPipeline,
    send_pid: PacketIdSend,
    recv_pid: PacketIdRecv,
}

impl TlsAuth {
    pub fn new(config: &Config) -> Option<Self> {
        let auth = config.tls_auth()?;
        let policy = CryptoPolicy::tls_auth(auth.digest);
        let idx = auth.direction.indices();
        Some(TlsAuth {
            encrypt: CipherPipeline::new(policy, auth.key.key(idx.send)),
            decrypt: CipherPipeline::new(policy, auth.key.key(idx.recv)),
            send_pid: PacketIdSend::new(true),
            recv_pid: PacketIdRecv::new(true, config.replay_window()),
        })
    }

    /// Skip the replay check for the next verified packet.
    pub fn ignore_next_packet_id(&mut self) {
        self.recv_pid.ignore_next();
    }

    /// Add HMAC and packet id to a plain control packet.
    pub fn wrap(
        &mut self,
        now: Instant,
        rng: &mut SeededRng,
        packet: &[u8],
        out: &mut Buf,
    ) -> Result<(), CryptoError> {
        wrap_with(&self.encrypt, &mut self.send_pid, now, rng, packet, out)
    }

    /// Verify and strip HMAC and packet id, leaving a plain control packet.
    pub fn unwrap(&mut self, packet: &[u8], out: &mut Buf) -> Result<(), CryptoError> {
        unwrap_with(&self.decrypt, &mut self.recv_pid, packet, out)
    }
}

fn wrap_with(
    pipeline: &CipherPipeline,
    send_pid: &mut PacketIdSend,
    now: Instant,
    rng: &mut SeededRng,
    packet: &[u8],
    out: &mut Buf,
) -> Result<(), CryptoError> {
    if packet.len() < HEADER_LEN {
        return Err(CryptoError::Truncated);
    }
    let (header, rest) = packet.split_at(HEADER_LEN);

    // HMAC | pid | header | rest
    let mut swapped = Buf::new();
    pipeline.encrypt(send_pid, now.to_unix_secs(), rng, packet, &mut swapped)?;

    // header | HMAC | pid | rest
    let auth_len = swapped.len() - packet.len();
    out.extend_from_slice(header);
    out.extend_from_slice(&swapped[..auth_len]);
    out.extend_from_slice(rest);
    Ok(())
}

fn unwrap_with(
    pipeline: &CipherPipeline,
    recv_pid: &mut PacketIdRecv,
    packet: &[u8],
    out: &mut Buf,
) -> Result<(), CryptoError> {
    let auth_len = pipeline.policy().overhead();
    if packet.len() < HEADER_LEN + auth_len {
        return Err(CryptoError::Truncated);
    }
    let (header, rest) = packet.split_at(HEADER_LEN);
    let (auth, rest) = rest.split_at(auth_len);

    let mut swapped = Buf::from_slice(auth);
    swapped.extend_from_slice(header);
    swapped.extend_from_slice(rest);
    pipeline.decrypt(recv_pid, &swapped, out)
}

/// Stateless check of a client's first hard reset.
///
/// Lets a server decide whether a datagram from an unknown address is worth
/// allocating a session for, without touching any session state.
pub struct TlsAuthStandalone {
    decrypt: Option<(CipherPipeline, usize)>,
}

impl TlsAuthStandalone {
    pub fn new(config: &Config) -> Self {
        let decrypt = config.tls_auth().map(|auth| {
            let policy = CryptoPolicy::tls_auth(auth.digest);
            let idx = auth.direction.indices();
            (
                CipherPipeline::new(policy, auth.key.key(idx.recv)),
                config.replay_window(),
            )
        });
        TlsAuthStandalone { decrypt }
    }

    /// True if `packet` is an authentic initial client reset: key id 0,
    /// valid HMAC, no acks and message id 0.
    pub fn check_initial_packet(&self, packet: &[u8]) -> bool {
        let Some(first) = packet.first() else {
            return false;
        };
        let (op, key_id) = split_header(*first);
        let is_reset = Opcode::from_u8(op).map_or(false, |o| o.is_hard_reset_client());
        if !is_reset || key_id != 0 {
            return false;
        }

        let mut plain = Buf::new();
        let packet = match &self.decrypt {
            Some((pipeline, window)) => {
                let mut recv = PacketIdRecv::new(true, *window);
                recv.ignore_next();
                if unwrap_with(pipeline, &mut recv, packet, &mut plain).is_err() {
                    return false;
                }
                &plain[..]
            }
            None => packet,
        };

        match ControlPacket::parse(packet) {
            Ok((_, p)) => p.acks.is_empty() && p.message_id == Some(0),
            Err(_) => false,
        }
    }
}

/// Length of the tls-auth block for `digest`, used when dumping packets.
pub(crate) fn auth_len(digest: DigestKind) -> usize {
    digest.output_len() + PacketId::wire_len(true)
}
