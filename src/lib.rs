//! tlsmux is a sans-IO engine for TLS negotiated datagram tunnels.
//!
//! One UDP flow carries two channels. The control channel runs a TLS
//! handshake over a small reliability layer and uses it to agree on keys.
//! The data channel encrypts and authenticates tunneled packets with those
//! keys. Keys are renegotiated periodically while the old key keeps
//! working for a transition window.
//!
//! TLS itself is not implemented here. Plug in an engine through
//! [`TlsEngine`] and [`TlsEngineFactory`].
//!
//! The engine never touches a socket or a clock:
//!
//! * [`TlsMultiplexer::handle_packet`] takes datagrams from the network.
//! * [`TlsMultiplexer::handle_timeout`] moves time forward.
//! * [`TlsMultiplexer::poll_output`] hands back datagrams to send, events
//!   and the next time to call `handle_timeout`.
//! * [`TlsMultiplexer::encrypt`] turns tunnel payload into data packets.
//!
//! For pre-shared key tunnels without a control channel, see
//! [`StaticKeyTunnel`].

#![forbid(unsafe_code)]
#![warn(clippy::all)]

#[macro_use]
extern crate log;

use std::net::SocketAddr;
use std::time::Instant;

mod buffer;
pub use buffer::Buf;

mod config;
pub use config::{Config, ConfigBuilder, KeyDerivation, KeyMethod};

mod crypto;
pub use crypto::{
    CipherKind, CipherPipeline, CryptoError, CryptoPolicy, DigestKind, Key2, KeyDirection,
    KeyIndices, KeyMaterial,
};

mod dump;
pub use dump::PacketDump;

mod error;
pub use error::{DropReason, Error};

mod event;

mod key_method;
pub use key_method::{EXPORTER_LABEL, TLS_OPTIONS_LEN, USER_PASS_LEN};

mod key_state;
pub use key_state::KeyStateKind;

mod keyfile;
pub use keyfile::KeyFile;

mod multiplexer;
pub use multiplexer::{AuthStatus, Inbound, TlsMultiplexer};

mod packet_id;
pub use packet_id::{PacketId, PacketIdRecv, PacketIdSend, ReplayError};

mod reliable;

mod rng;
pub use rng::SeededRng;

mod session;

mod session_id;
pub use session_id::SessionId;

mod static_key;
pub use static_key::StaticKeyTunnel;

mod stats;
pub use stats::Stats;

mod time_tricks;

mod timer;

mod tls;
pub use tls::{PeerIdentity, Role, TlsEngine, TlsEngineFactory, TlsError};

mod tls_auth;
pub use tls_auth::{TlsAuthKey, TlsAuthStandalone};

mod transport;
pub use transport::Transport;

mod verify;
pub use verify::{
    sanitize_common_name, AuthVerdict, Credentials, UserPassRequest, UserPassVerifier,
};

mod wire;

/// Output from [`TlsMultiplexer::poll_output`].
#[derive(Debug)]
pub enum Output<'a> {
    /// A datagram to send.
    Packet(SocketAddr, &'a [u8]),
    /// Nothing more right now. Call `handle_timeout` at this time.
    Timeout(Instant),
    /// The first key is active. Data can flow.
    Connected,
    /// A key with this id became active, after a renegotiation too.
    KeyActive(u8),
    /// Application control message from the peer.
    ControlMessage(&'a [u8]),
    /// The active session failed. The tunnel is down.
    Closed,
}
