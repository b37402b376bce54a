//! Pre-shared key mode: a data channel without any control channel.
//!
//! Both ends load the same [`Key2`] and pick opposite key directions.
//! Packets carry no opcode byte, just the cipher pipeline's output.

use std::time::Instant;

use crate::buffer::Buf;
use crate::crypto::{CipherPipeline, CryptoError, Key2, KeyDirection};
use crate::packet_id::{PacketIdRecv, PacketIdSend};
use crate::time_tricks::InstantExt;
use crate::{Config, Error, SeededRng};

pub struct StaticKeyTunnel {
    encrypt: CipherPipeline,
    decrypt: CipherPipeline,
    send_pid: PacketIdSend,
    recv_pid: PacketIdRecv,
    rng: SeededRng,
}

impl StaticKeyTunnel {
    /// `local` is our key direction, `remote` the one the peer was
    /// configured with, if known. They must complement each other.
    pub fn new(
        config: &Config,
        key: &Key2,
        local: KeyDirection,
        remote: KeyDirection,
    ) -> Result<Self, Error> {
        let idx = KeyDirection::resolve(local, remote)?;
        let policy = *config.data_policy();
        Ok(StaticKeyTunnel {
            encrypt: CipherPipeline::new(policy, key.key(idx.send)),
            decrypt: CipherPipeline::new(policy, key.key(idx.recv)),
            send_pid: PacketIdSend::new(policy.long_form),
            recv_pid: PacketIdRecv::new(policy.long_form, config.replay_window()),
            rng: SeededRng::new(config.rng_seed()),
        })
    }

    /// Protect `plaintext`, replacing the contents of `out`.
    pub fn encrypt(&mut self, now: Instant, plaintext: &[u8], out: &mut Buf) -> Result<(), Error> {
        out.clear();
        self.encrypt
            .encrypt(
                &mut self.send_pid,
                now.to_unix_secs(),
                &mut self.rng,
                plaintext,
                out,
            )
            .map_err(|e| match e {
                CryptoError::PacketIdExhausted => Error::PacketIdExhausted,
                e => e.into(),
            })
    }

    /// Verify and decrypt `packet`, replacing the contents of `out`.
    pub fn decrypt(&mut self, packet: &[u8], out: &mut Buf) -> Result<(), CryptoError> {
        out.clear();
        self.decrypt.decrypt(&mut self.recv_pid, packet, out)
    }
}
