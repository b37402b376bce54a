//! One TLS negotiation and the data channel keys it produces.
//!
//! A [`KeyState`] owns a TLS engine, the reliable queue its records travel
//! over and, once negotiated, the encrypt/decrypt pipelines for one key id.
//! It is driven from the outside by [`KeyState::receive`] for incoming
//! control packets and [`KeyState::process`] for everything else.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use sha2::{Digest, Sha256};

use crate::buffer::Buf;
use crate::config::{KeyDerivation, KeyMethod};
use crate::crypto::{
    generate_key_expansion, CipherPipeline, CryptoError, Key2, KeyDirection, KeyMaterial,
    KeySource,
};
use crate::key_method::{self, KeyMessage, EXPORTER_LABEL};
use crate::packet_id::{PacketIdRecv, PacketIdSend};
use crate::reliable::{RecvVerdict, ReliableQueue};
use crate::session_id::SessionId;
use crate::time_tricks::InstantExt;
use crate::tls::{PeerIdentity, Role, TlsEngine, TlsEngineFactory};
use crate::verify::{
    sanitize_common_name, AuthVerdict, Credentials, IdentityLock, UserPassRequest,
};
use crate::wire::{header_byte, ControlPacket, Opcode};
use crate::{Config, DropReason, Error, SeededRng};

/// Negotiation progress of a [`KeyState`].
///
/// Ordered: anything at or past [`KeyStateKind::Active`] carries data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyStateKind {
    /// Negotiation failed. The key state will be torn down.
    Error,
    Undef,
    /// Created, reset not yet queued.
    Initial,
    /// Reset queued, waiting for the peer's reset and our ack.
    PreStart,
    /// TLS handshake in progress.
    Start,
    /// Our key message is written.
    SentKey,
    /// The peer's key message is read.
    GotKey,
    /// Keys installed in both directions.
    Active,
    /// Handshake window has passed.
    NormalOp,
}

impl KeyStateKind {
    pub fn name(&self) -> &'static str {
        match self {
            KeyStateKind::Error => "S_ERROR",
            KeyStateKind::Undef => "S_UNDEF",
            KeyStateKind::Initial => "S_INITIAL",
            KeyStateKind::PreStart => "S_PRE_START",
            KeyStateKind::Start => "S_START",
            KeyStateKind::SentKey => "S_SENT_KEY",
            KeyStateKind::GotKey => "S_GOT_KEY",
            KeyStateKind::Active => "S_ACTIVE",
            KeyStateKind::NormalOp => "S_NORMAL_OP",
        }
    }
}

impl fmt::Display for KeyStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Things the owner of a key state must hear about.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum KeyEvent {
    /// Keys installed, data can flow.
    Active,
    /// An application control message from the peer.
    ControlMessage(Buf),
    /// The peer presented a different common name, certificate or
    /// username than it locked in. The whole tunnel must stop.
    IdentityChanged,
}

/// Session level context a key state needs while processing.
pub(crate) struct ProcessCtx<'a> {
    pub local_sid: SessionId,
    pub remote_sid: Option<SessionId>,
    pub rng: &'a mut SeededRng,
    pub lock: &'a mut IdentityLock,
    /// Last id handed to a username/password verifier.
    pub auth_ids: &'a mut u32,
}

/// A username/password verdict the application still owes.
#[derive(Debug, Clone, Copy)]
struct PendingAuth {
    id: u32,
    expires: Instant,
}

pub(crate) struct KeyState {
    config: Arc<Config>,
    role: Role,
    state: KeyStateKind,
    key_id: u8,
    reset_opcode: Opcode,

    tls: Box<dyn TlsEngine>,
    reliable: ReliableQueue,
    /// Ciphertext from the engine not yet in the reliable send window.
    tls_out: Vec<u8>,
    /// Plaintext from the engine not yet consumed.
    plain_in: Vec<u8>,
    peer_reset_received: bool,

    local_source: Option<KeySource>,
    local_key1: Option<KeyMaterial>,
    remote_key: Option<KeyMessage>,
    remote_options_hash: Option<[u8; 32]>,
    peer_identity: Option<PeerIdentity>,
    authenticated: bool,
    auth_pending: Option<PendingAuth>,

    send_pid: PacketIdSend,
    recv_pid: PacketIdRecv,
    encrypt: Option<CipherPipeline>,
    decrypt: Option<CipherPipeline>,

    now: Instant,
    established: Option<Instant>,
    must_negotiate: Instant,
    must_die: Option<Instant>,
    last_received: Option<Instant>,
    n_bytes: u64,
    n_packets: u64,

    events: Vec<KeyEvent>,
}

impl KeyState {
    pub fn new(
        config: Arc<Config>,
        role: Role,
        key_id: u8,
        reset_opcode: Opcode,
        factory: &mut dyn TlsEngineFactory,
        now: Instant,
    ) -> Result<Self, Error> {
        let tls = factory.create_session(role)?;
        let policy = *config.data_policy();
        let reliable = ReliableQueue::new(config.packet_timeout(), config.retransmit_doublings());
        let must_negotiate = now + config.handshake_window();
        let recv_pid = PacketIdRecv::new(policy.long_form, config.replay_window());

        Ok(KeyState {
            role,
            state: KeyStateKind::Initial,
            key_id,
            reset_opcode,
            tls,
            reliable,
            tls_out: Vec::new(),
            plain_in: Vec::new(),
            peer_reset_received: false,
            local_source: None,
            local_key1: None,
            remote_key: None,
            remote_options_hash: None,
            peer_identity: None,
            authenticated: false,
            auth_pending: None,
            send_pid: PacketIdSend::new(policy.long_form),
            recv_pid,
            encrypt: None,
            decrypt: None,
            now,
            established: None,
            must_negotiate,
            must_die: None,
            last_received: None,
            n_bytes: 0,
            n_packets: 0,
            events: Vec::new(),
            config,
        })
    }

    #[inline(always)]
    pub fn key_id(&self) -> u8 {
        self.key_id
    }

    #[inline(always)]
    pub fn state(&self) -> KeyStateKind {
        self.state
    }

    pub fn remote_options_hash(&self) -> Option<[u8; 32]> {
        self.remote_options_hash
    }

    #[cfg(test)]
    pub(crate) fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Authenticated and not waiting on a deferred verdict.
    pub fn is_authorized(&self) -> bool {
        self.authenticated && self.auth_pending.is_none()
    }

    /// Waiting on [`KeyState::settle_auth`].
    pub fn is_auth_pending(&self) -> bool {
        self.authenticated && self.auth_pending.is_some()
    }

    pub fn deauthenticate(&mut self) {
        if self.authenticated {
            info!("Deauthenticating key id {}", self.key_id);
        }
        self.authenticated = false;
        self.auth_pending = None;
    }

    /// Apply the application's verdict on a deferred username/password
    /// check. False if this key is not waiting on `auth_id`.
    pub fn settle_auth(&mut self, auth_id: u32, accept: bool) -> bool {
        match self.auth_pending {
            Some(p) if p.id == auth_id => {}
            _ => return false,
        }
        self.auth_pending = None;
        if accept {
            info!("Deferred authentication {} succeeded on key id {}", auth_id, self.key_id);
        } else {
            warn!("Deferred authentication {} failed on key id {}", auth_id, self.key_id);
            self.authenticated = false;
        }
        true
    }

    pub fn fail(&mut self) {
        if self.state != KeyStateKind::Error {
            trace!("{:?} -> {:?}", self.state, KeyStateKind::Error);
            self.state = KeyStateKind::Error;
        }
    }

    pub fn must_die(&self) -> Option<Instant> {
        self.must_die
    }

    pub fn set_must_die(&mut self, at: Instant) {
        self.must_die = Some(at);
    }

    pub fn take_events(&mut self) -> std::vec::Drain<'_, KeyEvent> {
        self.events.drain(..)
    }

    /// Keys are installed and the peer is known to have ours.
    ///
    /// The client has its keys once the server's key message is read. The
    /// server must also have sent its own, since the client derives from it.
    pub fn is_decrypt_enabled(&self) -> bool {
        self.has_keys() && self.is_authorized()
    }

    /// Keys installed, regardless of whether the peer may use them.
    pub fn has_keys(&self) -> bool {
        let min = if self.role.is_client() {
            KeyStateKind::GotKey
        } else {
            KeyStateKind::SentKey
        };
        self.decrypt.is_some() && self.state >= min
    }

    pub fn can_encrypt(&self) -> bool {
        self.encrypt.is_some() && self.is_authorized() && self.state >= KeyStateKind::Active
    }

    /// Take an incoming control packet into the reliable layer.
    ///
    /// Acks are applied first. The message itself is buffered and acked,
    /// or acked again if it is a duplicate. Delivery to TLS happens in
    /// [`KeyState::process`].
    pub fn receive(&mut self, packet: &ControlPacket, now: Instant) -> Result<(), DropReason> {
        if self.state == KeyStateKind::Error {
            return Err(DropReason::KeyStateFailed);
        }

        for id in &packet.acks {
            self.reliable.send.acknowledge(*id);
        }

        let Some(message_id) = packet.message_id else {
            self.last_received = Some(now);
            return Ok(());
        };

        match self.reliable.recv.classify(message_id) {
            RecvVerdict::New => {
                if !self.reliable.acks.has_room() {
                    return Err(DropReason::WindowFull);
                }
                if !self
                    .reliable
                    .recv
                    .insert(message_id, packet.opcode, packet.payload)
                {
                    return Err(DropReason::WindowFull);
                }
                self.reliable.acks.push(message_id);
            }
            RecvVerdict::Duplicate => {
                trace!("Duplicate message {} on key id {}", message_id, self.key_id);
                if !self.reliable.acks.push(message_id) {
                    return Err(DropReason::WindowFull);
                }
            }
            RecvVerdict::OutOfWindow => {
                debug!("Message {} outside receive window", message_id);
                return Err(DropReason::WindowFull);
            }
        }

        self.last_received = Some(now);
        Ok(())
    }

    /// Deliver buffered control messages, move the TLS negotiation along
    /// and put whatever needs sending into `out`.
    pub fn process(
        &mut self,
        now: Instant,
        ctx: &mut ProcessCtx,
        out: &mut Vec<Buf>,
    ) -> Result<(), Error> {
        if self.state == KeyStateKind::Error {
            return Ok(());
        }
        self.now = now;

        let result = self.deliver().and_then(|_| self.make_progress(ctx));
        if let Err(e) = result {
            self.fail();
            return Err(e);
        }

        if self.state < KeyStateKind::Active && now >= self.must_negotiate {
            self.fail();
            return Err(Error::NegotiationFailed(format!(
                "TLS key negotiation failed to occur within {} seconds",
                self.config.handshake_window().as_secs()
            )));
        }

        if let Some(p) = self.auth_pending {
            if now >= p.expires {
                warn!("Deferred authentication {} on key id {} timed out", p.id, self.key_id);
                self.auth_pending = None;
                self.authenticated = false;
            }
        }

        self.flush(ctx, out);
        Ok(())
    }

    fn deliver(&mut self) -> Result<(), Error> {
        while let Some(entry) = self.reliable.recv.pop_in_order() {
            if entry.opcode.is_reset() {
                debug!(
                    "Peer {} on key id {}",
                    entry.opcode, self.key_id
                );
                self.peer_reset_received = true;
            } else if entry.opcode == Opcode::ControlV1 {
                self.tls.feed_ciphertext(&entry.payload)?;
            }
        }
        Ok(())
    }

    fn make_progress(&mut self, ctx: &mut ProcessCtx) -> Result<(), Error> {
        loop {
            self.pump_tls(ctx.rng)?;

            let prev_state = self.state;
            let new_state = self.step(ctx)?;
            if prev_state != new_state {
                self.state = new_state;
                trace!("{:?} -> {:?}", prev_state, new_state);
            } else {
                break;
            }
        }
        Ok(())
    }

    fn step(&mut self, ctx: &mut ProcessCtx) -> Result<KeyStateKind, Error> {
        let client = self.role.is_client();
        match self.state {
            KeyStateKind::Error | KeyStateKind::Undef => Ok(self.state),
            KeyStateKind::Initial => self.send_reset(ctx),
            KeyStateKind::PreStart => self.await_reset(),
            KeyStateKind::Start if client => self.send_key(ctx, KeyStateKind::SentKey),
            KeyStateKind::Start => self.await_key(ctx, KeyStateKind::GotKey),
            KeyStateKind::SentKey if client => self.await_key(ctx, KeyStateKind::GotKey),
            KeyStateKind::GotKey if !client => self.send_key(ctx, KeyStateKind::SentKey),
            KeyStateKind::SentKey | KeyStateKind::GotKey => self.await_drained(),
            KeyStateKind::Active => self.await_normal_op(),
            KeyStateKind::NormalOp => self.read_control_messages(),
        }
    }

    fn send_reset(&mut self, ctx: &mut ProcessCtx) -> Result<KeyStateKind, Error> {
        let queued = self
            .reliable
            .send
            .queue(self.reset_opcode, &[], self.now, ctx.rng);
        if queued.is_none() {
            return Ok(self.state);
        }
        debug!("Queued {} on key id {}", self.reset_opcode, self.key_id);
        Ok(KeyStateKind::PreStart)
    }

    fn await_reset(&mut self) -> Result<KeyStateKind, Error> {
        if self.peer_reset_received && self.reliable.send.is_empty() {
            Ok(KeyStateKind::Start)
        } else {
            Ok(self.state)
        }
    }

    fn send_key(&mut self, ctx: &mut ProcessCtx, next: KeyStateKind) -> Result<KeyStateKind, Error> {
        if !self.tls.is_handshake_complete() {
            return Ok(self.state);
        }
        if self.peer_identity.is_none() {
            self.verify_peer(ctx.lock);
        }

        let client = self.role.is_client();
        let options = self.config.options_string().unwrap_or("");
        let policy = *self.config.data_policy();
        let mut msg = Vec::new();
        match self.config.key_method() {
            KeyMethod::V1 => {
                let key = KeyMaterial::random(ctx.rng);
                key_method::write_v1(&key, &policy, options, &mut msg);
                self.local_key1 = Some(key);
            }
            KeyMethod::V2 => {
                let source = KeySource::random(ctx.rng, client);
                let credentials = self.config.credentials();
                key_method::write_v2(&source, client, options, credentials, &mut msg);
                self.local_source = Some(source);
            }
        }
        self.tls.write_plaintext(&msg)?;

        // The server has the client's key already and can finish now.
        if let Some(remote) = self.remote_key.take() {
            self.install_keys(remote, ctx)?;
        }

        Ok(next)
    }

    fn await_key(&mut self, ctx: &mut ProcessCtx, next: KeyStateKind) -> Result<KeyStateKind, Error> {
        if !self.tls.is_handshake_complete() {
            return Ok(self.state);
        }
        if self.peer_identity.is_none() {
            self.verify_peer(ctx.lock);
        }

        self.tls.read_plaintext(&mut self.plain_in)?;
        let from_client = !self.role.is_client();
        let parsed = key_method::parse(
            &self.plain_in,
            self.config.key_method(),
            self.config.data_policy(),
            from_client,
        )?;
        let Some((mut remote, used)) = parsed else {
            return Ok(self.state);
        };
        self.plain_in.drain(..used);

        self.check_options(remote.options())?;
        if from_client {
            self.verify_user_pass(remote.take_credentials(), ctx);
        }

        if self.local_source.is_some() || self.local_key1.is_some() {
            self.install_keys(remote, ctx)?;
        } else {
            self.remote_key = Some(remote);
        }

        Ok(next)
    }

    fn await_drained(&mut self) -> Result<KeyStateKind, Error> {
        if !self.reliable.send.is_empty() || !self.tls_out.is_empty() {
            return Ok(self.state);
        }
        self.established = Some(self.now);
        info!(
            "Key id {} active ({})",
            self.key_id,
            self.peer_identity
                .as_ref()
                .and_then(|p| p.common_name.as_deref())
                .unwrap_or("no common name")
        );
        self.events.push(KeyEvent::Active);
        Ok(KeyStateKind::Active)
    }

    fn await_normal_op(&mut self) -> Result<KeyStateKind, Error> {
        self.read_control_messages()?;
        if self.now >= self.must_negotiate {
            Ok(KeyStateKind::NormalOp)
        } else {
            Ok(self.state)
        }
    }

    fn read_control_messages(&mut self) -> Result<KeyStateKind, Error> {
        self.tls.read_plaintext(&mut self.plain_in)?;
        while let Some(nul) = self.plain_in.iter().position(|b| *b == 0) {
            let msg = Buf::from_slice(&self.plain_in[..nul]);
            self.plain_in.drain(..=nul);
            if !msg.is_empty() {
                self.events.push(KeyEvent::ControlMessage(msg));
            }
        }
        Ok(self.state)
    }

    fn verify_peer(&mut self, lock: &mut IdentityLock) {
        let identity = self.tls.peer_identity().unwrap_or_default();
        self.authenticated = lock.check(&identity);
        if !self.authenticated {
            warn!("Peer identity rejected on key id {}", self.key_id);
            self.events.push(KeyEvent::IdentityChanged);
        }
        self.peer_identity = Some(identity);
    }

    /// Server side username/password check, when a verifier is configured.
    fn verify_user_pass(&mut self, credentials: Option<Credentials>, ctx: &mut ProcessCtx) {
        let config = self.config.clone();
        let Some(verifier) = config.user_pass_verifier() else {
            return;
        };
        if !self.authenticated {
            return;
        }
        let Some(credentials) = credentials.filter(|c| !c.username().is_empty()) else {
            warn!("Client sent no username on key id {}", self.key_id);
            self.authenticated = false;
            return;
        };

        let username = sanitize_common_name(credentials.username());
        *ctx.auth_ids = ctx.auth_ids.wrapping_add(1);
        let auth_id = *ctx.auth_ids;
        let common_name = self
            .peer_identity
            .as_ref()
            .and_then(|p| p.common_name.as_deref())
            .map(sanitize_common_name);
        let verdict = verifier.verify(&UserPassRequest {
            auth_id,
            username: &username,
            password: credentials.password(),
            common_name: common_name.as_deref(),
        });

        if verdict == AuthVerdict::Reject {
            warn!("Username/password rejected for '{}' on key id {}", username, self.key_id);
            self.authenticated = false;
            return;
        }
        if !ctx.lock.check_username(&username) {
            self.authenticated = false;
            self.events.push(KeyEvent::IdentityChanged);
            return;
        }
        if verdict == AuthVerdict::Defer {
            self.auth_pending = Some(PendingAuth {
                id: auth_id,
                expires: self.now + self.config.handshake_window(),
            });
        }
        info!(
            "Username/password {} for '{}' on key id {}",
            if verdict == AuthVerdict::Defer { "deferred" } else { "accepted" },
            username,
            self.key_id
        );
    }

    fn check_options(&mut self, remote: &str) -> Result<(), Error> {
        self.remote_options_hash = Some(Sha256::digest(remote.as_bytes()).into());

        let local = self.config.options_string().unwrap_or("");
        if !local.is_empty() && !remote.is_empty() && local != remote {
            return Err(Error::OptionsMismatch {
                local: local.to_string(),
                remote: remote.to_string(),
            });
        }
        Ok(())
    }

    fn install_keys(&mut self, remote: KeyMessage, ctx: &ProcessCtx) -> Result<(), Error> {
        let client = self.role.is_client();
        let (send, recv) = match remote {
            KeyMessage::V1 { key, .. } => {
                let local = self
                    .local_key1
                    .take()
                    .ok_or_else(|| Error::NegotiationFailed("No local key".into()))?;
                (local, key)
            }
            KeyMessage::V2 { source, .. } => {
                let key2 = match self.config.key_derivation() {
                    KeyDerivation::Prf => self.expand_keys(&source, ctx)?,
                    KeyDerivation::TlsExporter => {
                        let block = self.tls.export_keying_material(EXPORTER_LABEL, Key2::LEN)?;
                        Key2::from_block(&block)?
                    }
                };
                self.local_source = None;
                let direction = if client {
                    KeyDirection::Normal
                } else {
                    KeyDirection::Inverse
                };
                let idx = direction.indices();
                (key2.key(idx.send).clone(), key2.key(idx.recv).clone())
            }
        };

        let policy = *self.config.data_policy();
        self.encrypt = Some(CipherPipeline::new(policy, &send));
        self.decrypt = Some(CipherPipeline::new(policy, &recv));
        debug!("Installed data channel keys for key id {}", self.key_id);
        Ok(())
    }

    fn expand_keys(&self, remote: &KeySource, ctx: &ProcessCtx) -> Result<Key2, Error> {
        let local = self
            .local_source
            .as_ref()
            .ok_or_else(|| Error::NegotiationFailed("No local key source".into()))?;
        let remote_sid = ctx
            .remote_sid
            .ok_or_else(|| Error::NegotiationFailed("Remote session id unknown".into()))?;

        let key2 = if self.role.is_client() {
            generate_key_expansion(local, remote, &ctx.local_sid, &remote_sid)?
        } else {
            generate_key_expansion(remote, local, &remote_sid, &ctx.local_sid)?
        };
        Ok(key2)
    }

    /// Move TLS ciphertext into the reliable send window.
    fn pump_tls(&mut self, rng: &mut SeededRng) -> Result<(), Error> {
        self.tls.drain_ciphertext(&mut self.tls_out)?;
        if self.state < KeyStateKind::Start {
            return Ok(());
        }

        let max = self.config.control_payload_max();
        while !self.tls_out.is_empty() && self.reliable.send.can_queue() {
            let n = self.tls_out.len().min(max);
            if self
                .reliable
                .send
                .queue(Opcode::ControlV1, &self.tls_out[..n], self.now, rng)
                .is_none()
            {
                break;
            }
            self.tls_out.drain(..n);
        }
        Ok(())
    }

    /// Write due packets, with piggybacked acks, then any acks left over.
    fn flush(&mut self, ctx: &mut ProcessCtx, out: &mut Vec<Buf>) {
        let remote_sid = ctx.remote_sid;
        let reliable = &mut self.reliable;

        while let Some((message_id, opcode, payload)) = reliable.send.poll_due(self.now, ctx.rng) {
            let acks = match remote_sid {
                Some(_) => reliable.acks.take(),
                None => Default::default(),
            };
            let packet = ControlPacket {
                opcode,
                key_id: self.key_id,
                session_id: ctx.local_sid,
                remote_session_id: if acks.is_empty() { None } else { remote_sid },
                acks,
                message_id: Some(message_id),
                payload,
            };
            let mut buf = Buf::new();
            packet.serialize(&mut buf);
            out.push(buf);
        }

        let Some(remote_sid) = remote_sid else {
            return;
        };
        while !reliable.acks.is_empty() {
            let packet = ControlPacket {
                opcode: Opcode::AckV1,
                key_id: self.key_id,
                session_id: ctx.local_sid,
                acks: reliable.acks.take(),
                remote_session_id: Some(remote_sid),
                message_id: None,
                payload: &[],
            };
            let mut buf = Buf::new();
            packet.serialize(&mut buf);
            out.push(buf);
        }
    }

    /// Queue an application control message to the peer.
    pub fn send_control_message(&mut self, message: &str) -> Result<(), Error> {
        if self.state < KeyStateKind::Active {
            return Err(Error::NotConnected);
        }
        let mut msg = Vec::with_capacity(message.len() + 1);
        msg.extend_from_slice(message.as_bytes());
        msg.push(0);
        self.tls.write_plaintext(&msg)?;
        Ok(())
    }

    /// Protect `plaintext` as a data packet, appending it to `out`.
    pub fn encrypt(
        &mut self,
        now: Instant,
        rng: &mut SeededRng,
        plaintext: &[u8],
        out: &mut Buf,
    ) -> Result<(), Error> {
        let Some(pipeline) = &self.encrypt else {
            return Err(Error::NotConnected);
        };
        let start = out.len();
        out.push(header_byte(Opcode::DataV1, self.key_id));
        let result = pipeline.encrypt(&mut self.send_pid, now.to_unix_secs(), rng, plaintext, out);
        match result {
            Ok(()) => {
                self.n_bytes += plaintext.len() as u64;
                self.n_packets += 1;
                Ok(())
            }
            Err(e) => {
                out.truncate(start);
                match e {
                    CryptoError::PacketIdExhausted => Err(Error::PacketIdExhausted),
                    e => Err(e.into()),
                }
            }
        }
    }

    /// Verify and decrypt a data packet body (without the opcode byte).
    pub fn decrypt(&mut self, now: Instant, body: &[u8], out: &mut Buf) -> Result<(), CryptoError> {
        let Some(pipeline) = &self.decrypt else {
            return Err(CryptoError::DecryptFailed);
        };
        let start = out.len();
        pipeline.decrypt(&mut self.recv_pid, body, out)?;
        self.n_bytes += (out.len() - start) as u64;
        self.n_packets += 1;
        self.last_received = Some(now);
        Ok(())
    }

    /// Whether this key has lived long enough to be replaced.
    pub fn should_renegotiate(&self, now: Instant) -> bool {
        if self.state < KeyStateKind::Active || self.must_die.is_some() {
            return false;
        }
        let by_time = match (self.established, self.config.renegotiate_seconds()) {
            (Some(at), Some(secs)) => now >= at + secs,
            _ => false,
        };
        let by_bytes = self
            .config
            .renegotiate_bytes()
            .map_or(false, |limit| self.n_bytes >= limit);
        let by_packets = self
            .config
            .renegotiate_packets()
            .map_or(false, |limit| self.n_packets >= limit);

        if by_time || by_bytes || by_packets || self.send_pid.close_to_wrapping() {
            debug!(
                "Renegotiation due on key id {} (time {}, bytes {}, packets {})",
                self.key_id, by_time, by_bytes, by_packets
            );
            return true;
        }
        false
    }

    pub fn next_wakeup(&self) -> Option<Instant> {
        if self.state == KeyStateKind::Error {
            return None;
        }
        let mut next = self.reliable.next_wakeup();
        let mut consider = |t: Option<Instant>| {
            next = match (next, t) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
        };
        if self.state <= KeyStateKind::Active {
            consider(Some(self.must_negotiate));
        }
        consider(self.auth_pending.map(|p| p.expires));
        if self.must_die.is_none() {
            if let (Some(at), Some(secs)) = (self.established, self.config.renegotiate_seconds()) {
                consider(Some(at + secs));
            }
        }
        consider(self.must_die);
        next
    }

    #[cfg(test)]
    pub(crate) fn send_pid_mut(&mut self) -> &mut PacketIdSend {
        &mut self.send_pid
    }
}

impl fmt::Debug for KeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyState")
            .field("state", &self.state)
            .field("key_id", &self.key_id)
            .field("authenticated", &self.authenticated)
            .field("auth_pending", &self.auth_pending)
            .field("last_received", &self.last_received)
            .field("reliable", &self.reliable)
            .field("n_bytes", &self.n_bytes)
            .field("n_packets", &self.n_packets)
            .finish()
    }
}
