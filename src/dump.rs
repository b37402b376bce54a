//! One-line packet descriptions for trace logging.

use std::fmt;

use crate::crypto::DigestKind;
use crate::packet_id::PacketId;
use crate::session_id::SessionId;
use crate::tls_auth::auth_len;
use crate::wire::{split_header, ControlPacket, Opcode};

/// Renders a datagram without decrypting anything.
///
/// ```
/// # use tlsmux::PacketDump;
/// let p = [0x30, 0, 0, 0, 1];
/// assert_eq!(PacketDump::new(&p, None).to_string(), "P_DATA_V1 kid=0 len=4");
/// ```
pub struct PacketDump<'a> {
    packet: &'a [u8],
    tls_auth: Option<DigestKind>,
}

impl<'a> PacketDump<'a> {
    /// `tls_auth` is the digest of the tls-auth key, if control packets
    /// carry one.
    pub fn new(packet: &'a [u8], tls_auth: Option<DigestKind>) -> Self {
        PacketDump { packet, tls_auth }
    }
}

impl fmt::Display for PacketDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(first) = self.packet.first() else {
            return f.write_str("empty");
        };
        let (op, key_id) = split_header(*first);
        let Some(opcode) = Opcode::from_u8(op) else {
            return write!(f, "unknown opcode {} len={}", op, self.packet.len());
        };

        if opcode == Opcode::DataV1 {
            return write!(f, "{} kid={} len={}", opcode, key_id, self.packet.len() - 1);
        }

        // Strip the tls-auth block so the rest parses as a plain packet.
        let mut plain;
        let mut packet = self.packet;
        let mut auth_pid = None;
        if let Some(digest) = self.tls_auth {
            let header = 1 + SessionId::LEN;
            let auth = auth_len(digest);
            if packet.len() < header + auth {
                return write!(f, "{} kid={} truncated", opcode, key_id);
            }
            let pid_at = header + digest.output_len();
            auth_pid = PacketId::parse(&packet[pid_at..], true).ok().map(|(_, p)| p);
            plain = packet[..header].to_vec();
            plain.extend_from_slice(&packet[header + auth..]);
            packet = &plain;
        }

        let Ok((_, p)) = ControlPacket::parse(packet) else {
            return write!(f, "{} kid={} malformed", opcode, key_id);
        };

        write!(f, "{} kid={} sid={}", p.opcode, p.key_id, p.session_id)?;
        if let Some(pid) = auth_pid {
            write!(f, " pid=[{} {}]", pid.id, pid.time)?;
        }
        if !p.acks.is_empty() {
            write!(f, " acks={:?}", &p.acks[..])?;
        }
        if let Some(rsid) = p.remote_session_id {
            write!(f, " rsid={}", rsid)?;
        }
        if let Some(id) = p.message_id {
            write!(f, " mid={}", id)?;
        }
        write!(f, " len={}", p.payload.len())
    }
}
