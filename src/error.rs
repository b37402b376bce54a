use std::fmt;

use thiserror::Error;

use crate::crypto::{CryptoError, KeyDirection};
use crate::tls::TlsError;

/// Errors surfaced by the public API.
///
/// Per-packet problems are not errors: they come back as
/// [`Inbound::Dropped`][crate::Inbound::Dropped] with a [`DropReason`].
/// An `Err` from [`TlsMultiplexer`][crate::TlsMultiplexer] means the
/// trusted session failed and the tunnel must be torn down.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("Key direction mismatch: local {0:?}, remote {1:?}")]
    KeyDirectionMismatch(KeyDirection, KeyDirection),

    #[error("Packet id space exhausted")]
    PacketIdExhausted,

    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    #[error("Key negotiation failed: {0}")]
    NegotiationFailed(String),

    #[error("Options mismatch: local '{local}', remote '{remote}'")]
    OptionsMismatch { local: String, remote: String },

    #[error("Session failed: {0}")]
    SessionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Key file error: {0}")]
    KeyFileError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why an incoming datagram was discarded.
///
/// Drops are expected on a hostile network and are never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Empty datagram or an opcode we do not know.
    BadOpcode,
    /// Too short or otherwise unparseable.
    Malformed,
    /// tls-auth HMAC or replay check on a control packet failed.
    TlsAuthFailed,
    /// Data packet HMAC did not verify.
    HmacFailed,
    /// Data packet id was replayed, too old or invalid.
    Replay,
    /// Cipher rejected the payload (bad padding or length).
    DecryptFailed,
    /// No decrypt-enabled key carries this key id.
    UnknownKeyId,
    /// Key matched but the datagram came from another address.
    AddressMismatch,
    /// Control packet did not belong to any session and could not start one.
    Unroutable,
    /// The acknowledged session id is not ours.
    SessionIdMismatch,
    /// Reliable receive window or ack list has no room.
    WindowFull,
    /// The key state addressed has failed.
    KeyStateFailed,
    /// A new session for a client's reset could not be set up.
    SessionSetupFailed,
}

impl DropReason {
    pub(crate) fn from_crypto(e: &CryptoError) -> Self {
        match e {
            CryptoError::HmacMismatch => DropReason::HmacFailed,
            CryptoError::Replay(_) => DropReason::Replay,
            CryptoError::Truncated => DropReason::Malformed,
            _ => DropReason::DecryptFailed,
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DropReason::BadOpcode => "bad opcode",
            DropReason::Malformed => "malformed",
            DropReason::TlsAuthFailed => "tls-auth failed",
            DropReason::HmacFailed => "HMAC failed",
            DropReason::Replay => "replay",
            DropReason::DecryptFailed => "decrypt failed",
            DropReason::UnknownKeyId => "unknown key id",
            DropReason::AddressMismatch => "address mismatch",
            DropReason::Unroutable => "unroutable",
            DropReason::SessionIdMismatch => "session id mismatch",
            DropReason::WindowFull => "window full",
            DropReason::KeyStateFailed => "key state failed",
            DropReason::SessionSetupFailed => "session setup failed",
        };
        f.write_str(s)
    }
}
