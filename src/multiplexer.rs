//! The top level of a tunnel endpoint.
//!
//! A [`TlsMultiplexer`] owns up to three sessions with one peer:
//!
//! * `ACTIVE`: the trusted session carrying traffic.
//! * `UNTRUSTED`: a server's session for a client that restarted with a
//!   new session id. It takes over once it negotiates a key.
//! * `LAME_DUCK`: the previous active session, kept until its keys expire
//!   so packets in flight still decrypt.
//!
//! It is sans-IO. Feed it datagrams with [`TlsMultiplexer::handle_packet`],
//! drive time with [`TlsMultiplexer::handle_timeout`] and collect what it
//! wants sent with [`TlsMultiplexer::poll_output`].

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buffer::{Buf, BufferPool};
use crate::dump::PacketDump;
use crate::event::LocalEvent;
use crate::key_state::{KeyEvent, KeyStateKind};
use crate::session::{TlsSession, KS_LAME_DUCK, KS_PRIMARY};
use crate::session_id::SessionId;
use crate::stats::Stats;
use crate::tls::{Role, TlsEngineFactory};
use crate::transport::Transport;
use crate::verify::IdentityLock;
use crate::wire::{split_header, Opcode};
use crate::{Config, DropReason, Error, KeyMethod, Output, SeededRng};

const ACTIVE: usize = 0;
const UNTRUSTED: usize = 1;
const LAME_DUCK: usize = 2;

/// Wakeup when nothing is scheduled.
const IDLE_WAKEUP: Duration = Duration::from_secs(15);

/// Keys that may carry data, in order of preference for sending.
const DATA_KEYS: [(usize, usize); 3] = [
    (ACTIVE, KS_PRIMARY),
    (ACTIVE, KS_LAME_DUCK),
    (LAME_DUCK, KS_PRIMARY),
];

fn slot_name(slot: usize) -> &'static str {
    match slot {
        ACTIVE => "active",
        UNTRUSTED => "untrusted",
        _ => "lame duck",
    }
}

/// What became of an incoming datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    /// Control packet accepted.
    Control,
    /// Data packet decrypted into the output buffer.
    Data,
    /// Datagram discarded.
    Dropped(DropReason),
}

/// Whether the peer is allowed to pass traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    /// A key carrying data is fully authenticated.
    Succeeded,
    /// Keys are in place but none is authenticated. The peer was rejected,
    /// changed identity or a deferred check failed.
    Failed,
    /// Still negotiating, or waiting on
    /// [`TlsMultiplexer::authenticate_key`].
    Deferred,
}

pub struct TlsMultiplexer {
    config: Arc<Config>,
    role: Role,
    factory: Box<dyn TlsEngineFactory>,
    rng: SeededRng,

    /// Where a client connects to.
    remote: Option<SocketAddr>,
    sessions: [Option<TlsSession>; 3],
    lock: IdentityLock,
    auth_ids: u32,

    queue_tx: VecDeque<(SocketAddr, Buf)>,
    pool: BufferPool,
    events: VecDeque<LocalEvent>,

    last_now: Option<Instant>,
    stats: Stats,
    started: bool,
    connected: bool,
    closed: bool,
}

impl TlsMultiplexer {
    /// Client connecting to `remote`. The first [`handle_timeout`] sends
    /// the initial reset.
    ///
    /// [`handle_timeout`]: TlsMultiplexer::handle_timeout
    pub fn new_client(
        config: Arc<Config>,
        remote: SocketAddr,
        factory: Box<dyn TlsEngineFactory>,
    ) -> Self {
        Self::new(config, Role::Client, Some(remote), factory)
    }

    /// Server waiting for a client's initial reset.
    pub fn new_server(config: Arc<Config>, factory: Box<dyn TlsEngineFactory>) -> Self {
        Self::new(config, Role::Server, None, factory)
    }

    fn new(
        config: Arc<Config>,
        role: Role,
        remote: Option<SocketAddr>,
        factory: Box<dyn TlsEngineFactory>,
    ) -> Self {
        TlsMultiplexer {
            rng: SeededRng::new(config.rng_seed()),
            lock: IdentityLock::new(config.lock_peer_identity()),
            auth_ids: 0,
            config,
            role,
            factory,
            remote,
            sessions: [None, None, None],
            queue_tx: VecDeque::new(),
            pool: BufferPool::default(),
            events: VecDeque::new(),
            last_now: None,
            stats: Stats::default(),
            started: false,
            connected: false,
            closed: false,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// A key of the active session can send data.
    pub fn is_connected(&self) -> bool {
        self.sessions[ACTIVE]
            .as_ref()
            .map_or(false, |s| s.keys().any(|k| k.can_encrypt()))
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// State of the newest key in the active session.
    pub fn primary_state(&self) -> Option<KeyStateKind> {
        self.sessions[ACTIVE].as_ref()?.primary_state()
    }

    /// Sanitized common name of the peer, once known.
    pub fn common_name(&self) -> Option<&str> {
        self.lock.common_name()
    }

    /// Sanitized username the client authenticated with, on a server that
    /// checks usernames and passwords.
    pub fn username(&self) -> Option<&str> {
        self.lock.username()
    }

    /// SHA-256 of the options string the peer sent.
    pub fn remote_options_hash(&self) -> Option<[u8; 32]> {
        self.sessions[ACTIVE].as_ref()?.options_hash()
    }

    /// Merged verdict over the keys that may carry data.
    ///
    /// One authorized key is enough to succeed. Otherwise a pending
    /// deferred check, or no keys at all yet, is deferred. Keys that are
    /// all unauthenticated mean failure.
    pub fn authentication_status(&self) -> AuthStatus {
        if self.closed {
            return AuthStatus::Failed;
        }
        let mut has_keys = false;
        let mut pending = false;
        for (s, k) in DATA_KEYS {
            let Some(ks) = self.sessions[s].as_ref().and_then(|session| session.key(k)) else {
                continue;
            };
            if !ks.has_keys() {
                continue;
            }
            has_keys = true;
            if ks.is_authorized() {
                return AuthStatus::Succeeded;
            }
            pending |= ks.is_auth_pending();
        }
        if !has_keys || pending {
            AuthStatus::Deferred
        } else {
            AuthStatus::Failed
        }
    }

    /// Settle a deferred username/password check. `auth_id` is the one
    /// handed to the [`UserPassVerifier`][crate::UserPassVerifier].
    ///
    /// Returns false if no key is waiting on `auth_id`.
    pub fn authenticate_key(&mut self, auth_id: u32, accept: bool) -> bool {
        let mut found = false;
        for session in self.sessions.iter_mut().flatten() {
            for ks in session.keys_mut() {
                found |= ks.settle_auth(auth_id, accept);
            }
        }
        if !found {
            debug!("No key waits on authentication {}", auth_id);
            return false;
        }
        if let Some(now) = self.last_now {
            self.promote_untrusted(now);
        }
        self.note_connected();
        true
    }

    /// Stop passing data on every key. Control traffic continues.
    pub fn deauthenticate(&mut self) {
        for session in self.sessions.iter_mut().flatten() {
            session.deauthenticate();
        }
    }

    fn note_connected(&mut self) {
        if !self.connected && self.is_connected() {
            self.connected = true;
            self.events.push_back(LocalEvent::Connected);
        }
    }

    /// Process one incoming datagram.
    ///
    /// A decrypted data packet ends up in `out`. An `Err` means the active
    /// session failed and the tunnel is closed.
    pub fn handle_packet(
        &mut self,
        now: Instant,
        from: SocketAddr,
        packet: &[u8],
        out: &mut Buf,
    ) -> Result<Inbound, Error> {
        self.last_now = Some(now);
        out.clear();
        if self.closed {
            return Err(Error::NotConnected);
        }
        trace!(
            "RX {} from {}",
            PacketDump::new(packet, self.config.tls_auth().map(|a| a.digest)),
            from
        );

        let inbound = match packet.first().map(|b| split_header(*b)) {
            None => Inbound::Dropped(DropReason::BadOpcode),
            Some((op, key_id)) => match Opcode::from_u8(op) {
                None => Inbound::Dropped(DropReason::BadOpcode),
                Some(Opcode::DataV1) => self.handle_data(now, from, key_id, &packet[1..], out),
                Some(opcode) => self.handle_control(now, from, opcode, key_id, packet)?,
            },
        };

        match inbound {
            Inbound::Dropped(reason) => {
                self.stats.record_drop(reason);
                match reason {
                    DropReason::HmacFailed
                    | DropReason::TlsAuthFailed
                    | DropReason::AddressMismatch
                    | DropReason::SessionIdMismatch => {
                        warn!("Dropped packet from {}: {}", from, reason)
                    }
                    _ => debug!("Dropped packet from {}: {}", from, reason),
                }
            }
            Inbound::Control => self.stats.control_rx += 1,
            Inbound::Data => {}
        }

        self.promote_untrusted(now);
        Ok(inbound)
    }

    fn handle_data(
        &mut self,
        now: Instant,
        from: SocketAddr,
        key_id: u8,
        body: &[u8],
        out: &mut Buf,
    ) -> Inbound {
        // A restarted client reuses key id 0, so keep looking on a
        // mismatched address.
        let mut wrong_addr = false;
        for (s, k) in DATA_KEYS {
            let Some(session) = self.sessions[s].as_mut() else {
                continue;
            };
            let addr = session.remote_addr();
            let Some(ks) = session.key_mut(k) else {
                continue;
            };
            if ks.key_id() != key_id || !ks.is_decrypt_enabled() {
                continue;
            }
            if addr != from {
                wrong_addr = true;
                continue;
            }
            return match ks.decrypt(now, body, out) {
                Ok(()) => {
                    self.stats.rx_packets += 1;
                    self.stats.rx_bytes += out.len() as u64;
                    Inbound::Data
                }
                Err(e) => Inbound::Dropped(DropReason::from_crypto(&e)),
            };
        }
        if wrong_addr {
            Inbound::Dropped(DropReason::AddressMismatch)
        } else {
            Inbound::Dropped(DropReason::UnknownKeyId)
        }
    }

    fn handle_control(
        &mut self,
        now: Instant,
        from: SocketAddr,
        opcode: Opcode,
        key_id: u8,
        packet: &[u8],
    ) -> Result<Inbound, Error> {
        let Ok((_, sid)) = SessionId::parse(&packet[1..]) else {
            return Ok(Inbound::Dropped(DropReason::Malformed));
        };

        if opcode.is_hard_reset_client() || opcode.is_hard_reset_server() {
            let v1 = matches!(opcode, Opcode::HardResetClientV1 | Opcode::HardResetServerV1);
            if v1 != (self.config.key_method() == KeyMethod::V1) {
                debug!(
                    "{} from {} does not match key method {}",
                    opcode,
                    from,
                    self.config.key_method().as_u8()
                );
                return Ok(Inbound::Dropped(DropReason::BadOpcode));
            }
        }

        let matched = (0..self.sessions.len()).find(|i| {
            self.sessions[*i]
                .as_ref()
                .map_or(false, |s| s.remote_sid() == Some(sid) && s.remote_addr() == from)
        });

        let slot = match (matched, self.role) {
            (Some(slot), _) => slot,
            (None, Role::Client) => {
                let unbound = self.sessions[ACTIVE]
                    .as_ref()
                    .map_or(false, |s| s.remote_sid().is_none() && s.remote_addr() == from);
                if !(unbound && opcode.is_hard_reset_server()) {
                    return Ok(Inbound::Dropped(DropReason::Unroutable));
                }
                ACTIVE
            }
            (None, Role::Server) => {
                if !(opcode.is_hard_reset_client() && key_id == 0) {
                    return Ok(Inbound::Dropped(DropReason::Unroutable));
                }
                return self.accept_session(now, from, packet);
            }
        };

        let Some(session) = self.sessions[slot].as_mut() else {
            return Ok(Inbound::Dropped(DropReason::Unroutable));
        };
        let inbound = match session.handle_control(now, packet, &mut *self.factory) {
            Ok(inbound) => inbound,
            Err(e) => {
                self.fail_session(slot, e)?;
                return Ok(Inbound::Dropped(DropReason::KeyStateFailed));
            }
        };
        self.process_session(slot, now)?;
        Ok(inbound)
    }

    /// Provision a session for a client's initial reset.
    fn accept_session(
        &mut self,
        now: Instant,
        from: SocketAddr,
        packet: &[u8],
    ) -> Result<Inbound, Error> {
        let slot = if self.sessions[ACTIVE].is_none() {
            ACTIVE
        } else if self.config.single_session() {
            debug!("Refusing second session from {}", from);
            return Ok(Inbound::Dropped(DropReason::Unroutable));
        } else {
            UNTRUSTED
        };

        let created = TlsSession::new(
            self.config.clone(),
            Role::Server,
            from,
            now,
            &mut *self.factory,
            &mut self.rng,
        );
        let mut session = match created {
            Ok(session) => session,
            Err(e) => {
                warn!("Cannot set up session for {}: {}", from, e);
                return Ok(Inbound::Dropped(DropReason::SessionSetupFailed));
            }
        };
        session.arm_first_packet();

        let inbound = match session.handle_control(now, packet, &mut *self.factory) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("Reset from {} failed: {}", from, e);
                return Ok(Inbound::Dropped(DropReason::SessionSetupFailed));
            }
        };
        if let Inbound::Dropped(_) = inbound {
            return Ok(inbound);
        }

        if let Some(old) = self.sessions[slot].replace(session) {
            debug!("Replaced {} session {}", slot_name(slot), old.local_sid());
        }
        info!("Accepted {} session from {}", slot_name(slot), from);
        self.process_session(slot, now)?;
        Ok(inbound)
    }

    /// Drive timers and state for every session.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<(), Error> {
        self.last_now = Some(now);
        if self.closed {
            return Ok(());
        }

        if !self.started {
            self.started = true;
            if let Some(remote) = self.remote {
                let session = TlsSession::new(
                    self.config.clone(),
                    self.role,
                    remote,
                    now,
                    &mut *self.factory,
                    &mut self.rng,
                )?;
                self.sessions[ACTIVE] = Some(session);
            }
        }

        for slot in [ACTIVE, UNTRUSTED, LAME_DUCK] {
            self.process_session(slot, now)?;
        }
        self.promote_untrusted(now);
        Ok(())
    }

    fn process_session(&mut self, slot: usize, now: Instant) -> Result<(), Error> {
        let Some(session) = self.sessions[slot].as_mut() else {
            return Ok(());
        };
        let result = session.process(
            now,
            &mut self.rng,
            &mut self.lock,
            &mut self.auth_ids,
            &mut *self.factory,
            &mut self.pool,
            &mut self.queue_tx,
        );
        let events: Vec<_> = session.take_events().collect();
        let empty = session.is_empty();
        let local_sid = session.local_sid();

        let mut identity_changed = false;
        for (key_id, event) in events {
            match event {
                KeyEvent::Active => {
                    self.note_connected();
                    self.events.push_back(LocalEvent::KeyActive(key_id));
                }
                KeyEvent::ControlMessage(msg) => {
                    self.events.push_back(LocalEvent::ControlMessage(msg));
                }
                KeyEvent::IdentityChanged => {
                    warn!("Peer identity changed on key id {}, tunnel disabled", key_id);
                    identity_changed = true;
                }
            }
        }
        if identity_changed {
            self.deauthenticate();
        }

        if let Err(e) = result {
            return self.fail_session(slot, e);
        }

        if empty {
            debug!("{} session {} has no keys left", slot_name(slot), local_sid);
            self.sessions[slot] = None;
        }
        Ok(())
    }

    /// Only a failed active session is fatal. Others just go away.
    fn fail_session(&mut self, slot: usize, e: Error) -> Result<(), Error> {
        self.sessions[slot] = None;
        if slot != ACTIVE {
            warn!("Dropping {} session: {}", slot_name(slot), e);
            return Ok(());
        }
        warn!("Active session failed: {}", e);
        self.closed = true;
        self.events.push_back(LocalEvent::Closed);
        Err(Error::SessionFailed(e.to_string()))
    }

    /// An untrusted session that negotiated a key replaces the active one.
    fn promote_untrusted(&mut self, now: Instant) {
        let ready = self.sessions[UNTRUSTED]
            .as_ref()
            .map_or(false, |s| s.keys().any(|k| k.can_encrypt()));
        if !ready {
            return;
        }
        let promoted = self.sessions[UNTRUSTED].take();
        if let Some(mut old) = std::mem::replace(&mut self.sessions[ACTIVE], promoted) {
            old.retire(now + self.config.transition_window());
            self.sessions[LAME_DUCK] = Some(old);
        }
        info!("Untrusted session promoted to active");
    }

    /// Encrypt `plaintext` with the newest usable key. The packet ends up in
    /// `out`, to be sent to the returned address.
    pub fn encrypt(
        &mut self,
        now: Instant,
        plaintext: &[u8],
        out: &mut Buf,
    ) -> Result<SocketAddr, Error> {
        out.clear();
        if self.closed {
            return Err(Error::NotConnected);
        }
        for (s, k) in DATA_KEYS {
            let Some(session) = self.sessions[s].as_mut() else {
                continue;
            };
            let addr = session.remote_addr();
            let Some(ks) = session.key_mut(k) else {
                continue;
            };
            if !ks.can_encrypt() {
                continue;
            }
            ks.encrypt(now, &mut self.rng, plaintext, out)?;
            self.stats.tx_packets += 1;
            self.stats.tx_bytes += plaintext.len() as u64;
            return Ok(addr);
        }
        Err(Error::NotConnected)
    }

    /// Start a new key on the active session now.
    pub fn renegotiate(&mut self, now: Instant) -> Result<(), Error> {
        self.last_now = Some(now);
        let Some(session) = self.sessions[ACTIVE].as_mut() else {
            return Err(Error::NotConnected);
        };
        let established = session
            .key(KS_PRIMARY)
            .map_or(false, |k| k.state() >= KeyStateKind::Active);
        if !established {
            return Err(Error::NotConnected);
        }
        if let Err(e) = session.soft_reset(now, None, &mut *self.factory) {
            return self.fail_session(ACTIVE, e);
        }
        self.process_session(ACTIVE, now)
    }

    /// Send an application control message, such as a push request, over
    /// the active key's TLS channel.
    pub fn send_control_message(&mut self, message: &str) -> Result<(), Error> {
        let Some(session) = self.sessions[ACTIVE].as_mut() else {
            return Err(Error::NotConnected);
        };
        let ks = [KS_PRIMARY, KS_LAME_DUCK]
            .into_iter()
            .find(|slot| session.key(*slot).map_or(false, |k| k.can_encrypt()))
            .and_then(|slot| session.key_mut(slot))
            .ok_or(Error::NotConnected)?;
        ks.send_control_message(message)?;

        if let Some(now) = self.last_now {
            self.process_session(ACTIVE, now)?;
        }
        Ok(())
    }

    pub fn poll_output<'a>(&mut self, buf: &'a mut [u8]) -> Output<'a> {
        if let Some(event) = self.events.pop_front() {
            return event.into_output(buf);
        }

        if let Some((addr, packet)) = self.queue_tx.pop_front() {
            let l = packet.len();
            assert!(l <= buf.len(), "Buffer too small for packet");
            buf[..l].copy_from_slice(&packet);
            self.pool.push(packet);
            return Output::Packet(addr, &buf[..l]);
        }

        Output::Timeout(self.next_wakeup())
    }

    fn next_wakeup(&self) -> Instant {
        let last_now = self
            .last_now
            .expect("need handle_timeout before poll_output");
        self.sessions
            .iter()
            .flatten()
            .filter_map(|s| s.next_wakeup())
            .min()
            .unwrap_or(last_now + IDLE_WAKEUP)
    }

    /// Send every queued packet through `transport`. Returns how many were
    /// sent. Events stay queued for [`poll_output`].
    ///
    /// [`poll_output`]: TlsMultiplexer::poll_output
    pub fn flush<T: Transport>(&mut self, transport: &mut T) -> Result<usize, Error> {
        let mut n = 0;
        while let Some((addr, packet)) = self.queue_tx.pop_front() {
            transport.send_datagram(addr, &packet)?;
            self.pool.push(packet);
            n += 1;
        }
        Ok(n)
    }
}

impl std::fmt::Debug for TlsMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsMultiplexer")
            .field("role", &self.role)
            .field("sessions", &self.sessions)
            .field("queue_tx", &self.queue_tx.len())
            .field("closed", &self.closed)
            .finish()
    }
}
