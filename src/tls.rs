//! The TLS engine seam.
//!
//! The multiplexer never implements TLS itself. Each key state owns one
//! engine, created by the user supplied [`TlsEngineFactory`], and shuttles
//! bytes between it and the reliable control channel. Engines are memory
//! based: ciphertext goes in and out through buffers, never a socket.

use std::fmt;

/// Which end of the tunnel we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn is_client(&self) -> bool {
        matches!(self, Role::Client)
    }
}

/// Who the TLS engine says is on the other end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Common name from the peer certificate.
    pub common_name: Option<String>,
    /// SHA-1 fingerprint of the peer certificate.
    pub cert_hash: Option<[u8; 20]>,
}

/// Failure reported by a TLS engine. Fatal for the key state using it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct TlsError(pub String);

impl TlsError {
    pub fn new(msg: impl fmt::Display) -> Self {
        TlsError(msg.to_string())
    }
}

/// One in-memory TLS session.
pub trait TlsEngine: Send {
    /// Hand TLS records received from the peer to the engine.
    fn feed_ciphertext(&mut self, data: &[u8]) -> Result<(), TlsError>;

    /// Move pending outgoing TLS records into `out`. Returns the number of
    /// bytes appended.
    fn drain_ciphertext(&mut self, out: &mut Vec<u8>) -> Result<usize, TlsError>;

    /// Queue application plaintext for sending. Only valid once the
    /// handshake is complete.
    fn write_plaintext(&mut self, data: &[u8]) -> Result<(), TlsError>;

    /// Move received application plaintext into `out`. Returns the number
    /// of bytes appended.
    fn read_plaintext(&mut self, out: &mut Vec<u8>) -> Result<usize, TlsError>;

    fn is_handshake_complete(&self) -> bool;

    /// RFC 5705 keying material exporter.
    fn export_keying_material(&self, label: &str, len: usize) -> Result<Vec<u8>, TlsError>;

    /// Identity of the verified peer, once the handshake is complete.
    fn peer_identity(&self) -> Option<PeerIdentity>;
}

/// Creates TLS engines for new key states.
pub trait TlsEngineFactory: Send {
    fn create_session(&mut self, role: Role) -> Result<Box<dyn TlsEngine>, TlsError>;
}
