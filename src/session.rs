//! A session between us and one peer: two session ids and up to two key
//! states, the current one and the one it replaced.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::buffer::{Buf, BufferPool};
use crate::config::KeyMethod;
use crate::key_state::{KeyEvent, KeyState, KeyStateKind, ProcessCtx};
use crate::session_id::SessionId;
use crate::tls::{Role, TlsEngineFactory};
use crate::tls_auth::TlsAuth;
use crate::verify::IdentityLock;
use crate::wire::{next_key_id, ControlPacket, Opcode};
use crate::{Config, DropReason, Error, Inbound, SeededRng};

/// Key slot of the current key.
pub(crate) const KS_PRIMARY: usize = 0;

/// Key slot of the key being phased out after a renegotiation.
pub(crate) const KS_LAME_DUCK: usize = 1;

pub(crate) struct TlsSession {
    config: Arc<Config>,
    role: Role,
    local_sid: SessionId,
    remote_sid: Option<SessionId>,
    remote_addr: SocketAddr,
    keys: [Option<KeyState>; 2],
    options_hash: Option<[u8; 32]>,
    tls_auth: Option<TlsAuth>,
    events: Vec<(u8, KeyEvent)>,
}

impl TlsSession {
    /// New session with key id 0, which starts with a hard reset.
    pub fn new(
        config: Arc<Config>,
        role: Role,
        remote_addr: SocketAddr,
        now: Instant,
        factory: &mut dyn TlsEngineFactory,
        rng: &mut SeededRng,
    ) -> Result<Self, Error> {
        let reset = match (role, config.key_method()) {
            (Role::Client, KeyMethod::V1) => Opcode::HardResetClientV1,
            (Role::Client, KeyMethod::V2) => Opcode::HardResetClientV2,
            (Role::Server, KeyMethod::V1) => Opcode::HardResetServerV1,
            (Role::Server, KeyMethod::V2) => Opcode::HardResetServerV2,
        };
        let primary = KeyState::new(config.clone(), role, 0, reset, factory, now)?;
        let local_sid = SessionId::random(rng);
        debug!("New {:?} session {} for {}", role, local_sid, remote_addr);

        Ok(TlsSession {
            tls_auth: TlsAuth::new(&config),
            config,
            role,
            local_sid,
            remote_sid: None,
            remote_addr,
            keys: [Some(primary), None],
            options_hash: None,
            events: Vec::new(),
        })
    }

    #[inline(always)]
    pub fn local_sid(&self) -> SessionId {
        self.local_sid
    }

    #[inline(always)]
    pub fn remote_sid(&self) -> Option<SessionId> {
        self.remote_sid
    }

    #[inline(always)]
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn options_hash(&self) -> Option<[u8; 32]> {
        self.options_hash
    }

    pub fn key(&self, slot: usize) -> Option<&KeyState> {
        self.keys[slot].as_ref()
    }

    pub fn key_mut(&mut self, slot: usize) -> Option<&mut KeyState> {
        self.keys[slot].as_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = &KeyState> {
        self.keys.iter().flatten()
    }

    pub fn keys_mut(&mut self) -> impl Iterator<Item = &mut KeyState> {
        self.keys.iter_mut().flatten()
    }

    pub fn primary_state(&self) -> Option<KeyStateKind> {
        self.key(KS_PRIMARY).map(|k| k.state())
    }

    /// All keys have expired.
    pub fn is_empty(&self) -> bool {
        self.keys.iter().all(|k| k.is_none())
    }

    /// Let the first packet of a fresh server session past the tls-auth
    /// replay check. Its packet id cannot be known in advance.
    pub fn arm_first_packet(&mut self) {
        if let Some(auth) = &mut self.tls_auth {
            auth.ignore_next_packet_id();
        }
    }

    /// Schedule every key for removal, used when the session is pushed out
    /// of the active slot.
    pub fn retire(&mut self, must_die: Instant) {
        for ks in self.keys.iter_mut().flatten() {
            if ks.must_die().map_or(true, |t| t > must_die) {
                ks.set_must_die(must_die);
            }
        }
    }

    pub fn deauthenticate(&mut self) {
        for ks in self.keys.iter_mut().flatten() {
            ks.deauthenticate();
        }
    }

    pub fn take_events(&mut self) -> std::vec::Drain<'_, (u8, KeyEvent)> {
        self.events.drain(..)
    }

    /// Handle a control packet already matched to this session.
    ///
    /// `packet` is the datagram as received, tls-auth and all.
    pub fn handle_control(
        &mut self,
        now: Instant,
        packet: &[u8],
        factory: &mut dyn TlsEngineFactory,
    ) -> Result<Inbound, Error> {
        let mut plain = Buf::new();
        let packet = match &mut self.tls_auth {
            Some(auth) => {
                if let Err(e) = auth.unwrap(packet, &mut plain) {
                    debug!("tls-auth check failed for session {}: {}", self.local_sid, e);
                    return Ok(Inbound::Dropped(DropReason::TlsAuthFailed));
                }
                &plain[..]
            }
            None => packet,
        };

        let Ok((_, cp)) = ControlPacket::parse(packet) else {
            return Ok(Inbound::Dropped(DropReason::Malformed));
        };

        if let Some(acked) = cp.remote_session_id {
            if acked != self.local_sid {
                debug!("Packet acks session {}, we are {}", acked, self.local_sid);
                return Ok(Inbound::Dropped(DropReason::SessionIdMismatch));
            }
        }

        match self.remote_sid {
            Some(sid) if sid != cp.session_id => {
                return Ok(Inbound::Dropped(DropReason::SessionIdMismatch));
            }
            Some(_) => {}
            None => {
                let expected = match self.role {
                    Role::Client => cp.opcode.is_hard_reset_server(),
                    Role::Server => cp.opcode.is_hard_reset_client(),
                };
                if !expected {
                    return Ok(Inbound::Dropped(DropReason::Unroutable));
                }
                debug!("Session {} bound to remote {}", self.local_sid, cp.session_id);
                self.remote_sid = Some(cp.session_id);
            }
        }

        let slot = self
            .keys
            .iter()
            .position(|k| k.as_ref().map_or(false, |k| k.key_id() == cp.key_id));

        let slot = match slot {
            Some(slot) => slot,
            None if cp.opcode == Opcode::SoftResetV1 => {
                let established = self
                    .key(KS_PRIMARY)
                    .map_or(false, |k| k.is_decrypt_enabled());
                if !established {
                    return Ok(Inbound::Dropped(DropReason::UnknownKeyId));
                }
                info!("Peer renegotiates with key id {}", cp.key_id);
                self.soft_reset(now, Some(cp.key_id), factory)?;
                KS_PRIMARY
            }
            None => return Ok(Inbound::Dropped(DropReason::UnknownKeyId)),
        };

        // Key is Some: the slot came from a present key or soft_reset.
        let Some(ks) = self.keys[slot].as_mut() else {
            return Ok(Inbound::Dropped(DropReason::UnknownKeyId));
        };
        match ks.receive(&cp, now) {
            Ok(()) => Ok(Inbound::Control),
            Err(reason) => Ok(Inbound::Dropped(reason)),
        }
    }

    /// Start a new key. `key_id` is given when the peer initiated.
    pub fn soft_reset(
        &mut self,
        now: Instant,
        key_id: Option<u8>,
        factory: &mut dyn TlsEngineFactory,
    ) -> Result<(), Error> {
        let Some(current) = self.key(KS_PRIMARY) else {
            return Err(Error::NotConnected);
        };
        let key_id = key_id.unwrap_or_else(|| next_key_id(current.key_id()));
        let fresh = KeyState::new(
            self.config.clone(),
            self.role,
            key_id,
            Opcode::SoftResetV1,
            factory,
            now,
        )?;

        let mut old = self.keys[KS_PRIMARY].replace(fresh);
        if let Some(old) = &mut old {
            old.set_must_die(now + self.config.transition_window());
            info!("Key id {} -> {}, old key is lame duck", old.key_id(), key_id);
        }
        if let Some(prev) = std::mem::replace(&mut self.keys[KS_LAME_DUCK], old) {
            debug!("Dropping lame duck key id {}", prev.key_id());
        }
        Ok(())
    }

    /// Drive both keys, start renegotiation when due, and queue whatever
    /// needs sending.
    #[allow(clippy::too_many_arguments)]
    pub fn process(
        &mut self,
        now: Instant,
        rng: &mut SeededRng,
        lock: &mut IdentityLock,
        auth_ids: &mut u32,
        factory: &mut dyn TlsEngineFactory,
        pool: &mut BufferPool,
        tx: &mut VecDeque<(SocketAddr, Buf)>,
    ) -> Result<(), Error> {
        for slot in [KS_PRIMARY, KS_LAME_DUCK] {
            let expired = self.keys[slot]
                .as_ref()
                .and_then(|k| k.must_die())
                .map_or(false, |t| now >= t);
            if expired {
                if let Some(ks) = self.keys[slot].take() {
                    info!("Key id {} expired", ks.key_id());
                }
            }
        }

        let renegotiate = self
            .key(KS_PRIMARY)
            .map_or(false, |k| k.should_renegotiate(now));
        if renegotiate {
            self.soft_reset(now, None, factory)?;
        }

        let mut packets = Vec::new();
        for slot in [KS_PRIMARY, KS_LAME_DUCK] {
            let Some(ks) = self.keys[slot].as_mut() else {
                continue;
            };
            let mut ctx = ProcessCtx {
                local_sid: self.local_sid,
                remote_sid: self.remote_sid,
                rng: &mut *rng,
                lock: &mut *lock,
                auth_ids: &mut *auth_ids,
            };
            let result = ks.process(now, &mut ctx, &mut packets);

            let key_id = ks.key_id();
            self.events.extend(ks.take_events().map(|e| (key_id, e)));
            if let Some(hash) = ks.remote_options_hash() {
                self.options_hash = Some(hash);
            }

            if let Err(e) = result {
                if slot == KS_PRIMARY {
                    return Err(e);
                }
                warn!("Lame duck key id {} failed: {}", key_id, e);
                self.keys[slot] = None;
            }
        }

        for packet in packets {
            let out = match &mut self.tls_auth {
                Some(auth) => {
                    let mut wrapped = pool.pop();
                    auth.wrap(now, rng, &packet, &mut wrapped)?;
                    pool.push(packet);
                    wrapped
                }
                None => packet,
            };
            tx.push_back((self.remote_addr, out));
        }
        Ok(())
    }

    pub fn next_wakeup(&self) -> Option<Instant> {
        self.keys().filter_map(|k| k.next_wakeup()).min()
    }
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("local_sid", &self.local_sid)
            .field("remote_sid", &self.remote_sid)
            .field("remote_addr", &self.remote_addr)
            .field("keys", &self.keys)
            .finish()
    }
}
