//! Opcodes and the control packet codec.
//!
//! Every datagram starts with one byte: the opcode in the high five bits and
//! the key id in the low three.
//!
//! A control packet (tls-auth already removed) looks like:
//!
//! ```text
//! op/key_id         u8
//! session_id        [u8; 8]
//! ack_count         u8
//! acks              u32 * ack_count
//! remote_session_id [u8; 8]   only when ack_count > 0
//! message_id        u32       absent in P_ACK_V1
//! payload           ..
//! ```

use std::fmt;

use arrayvec::ArrayVec;
use nom::bytes::complete::take;
use nom::number::complete::{be_u32, be_u8};
use nom::IResult;

use crate::buffer::Buf;
use crate::reliable::RELIABLE_ACK_SIZE;
use crate::session_id::SessionId;

pub const P_KEY_ID_MASK: u8 = 0x07;
pub const P_OPCODE_SHIFT: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    HardResetClientV1 = 1,
    HardResetServerV1 = 2,
    SoftResetV1 = 3,
    ControlV1 = 4,
    AckV1 = 5,
    DataV1 = 6,
    HardResetClientV2 = 7,
    HardResetServerV2 = 8,
}

impl Opcode {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Opcode::HardResetClientV1,
            2 => Opcode::HardResetServerV1,
            3 => Opcode::SoftResetV1,
            4 => Opcode::ControlV1,
            5 => Opcode::AckV1,
            6 => Opcode::DataV1,
            7 => Opcode::HardResetClientV2,
            8 => Opcode::HardResetServerV2,
            _ => return None,
        })
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    pub fn is_hard_reset_client(&self) -> bool {
        matches!(self, Opcode::HardResetClientV1 | Opcode::HardResetClientV2)
    }

    pub fn is_hard_reset_server(&self) -> bool {
        matches!(self, Opcode::HardResetServerV1 | Opcode::HardResetServerV2)
    }

    /// Any of the messages that open a key state.
    pub fn is_reset(&self) -> bool {
        self.is_hard_reset_client() || self.is_hard_reset_server() || *self == Opcode::SoftResetV1
    }

    pub fn name(&self) -> &'static str {
        match self {
            Opcode::HardResetClientV1 => "P_CONTROL_HARD_RESET_CLIENT_V1",
            Opcode::HardResetServerV1 => "P_CONTROL_HARD_RESET_SERVER_V1",
            Opcode::SoftResetV1 => "P_CONTROL_SOFT_RESET_V1",
            Opcode::ControlV1 => "P_CONTROL_V1",
            Opcode::AckV1 => "P_ACK_V1",
            Opcode::DataV1 => "P_DATA_V1",
            Opcode::HardResetClientV2 => "P_CONTROL_HARD_RESET_CLIENT_V2",
            Opcode::HardResetServerV2 => "P_CONTROL_HARD_RESET_SERVER_V2",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Split the leading byte into raw opcode and key id.
pub fn split_header(byte: u8) -> (u8, u8) {
    (byte >> P_OPCODE_SHIFT, byte & P_KEY_ID_MASK)
}

pub fn header_byte(op: Opcode, key_id: u8) -> u8 {
    (op.as_u8() << P_OPCODE_SHIFT) | (key_id & P_KEY_ID_MASK)
}

/// Next key id after `id`. Zero is reserved for the first key of a session.
pub fn next_key_id(id: u8) -> u8 {
    match (id + 1) & P_KEY_ID_MASK {
        0 => 1,
        n => n,
    }
}

/// A parsed control channel packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPacket<'a> {
    pub opcode: Opcode,
    pub key_id: u8,
    pub session_id: SessionId,
    pub acks: ArrayVec<u32, RELIABLE_ACK_SIZE>,
    pub remote_session_id: Option<SessionId>,
    pub message_id: Option<u32>,
    pub payload: &'a [u8],
}

impl<'a> ControlPacket<'a> {
    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], ControlPacket<'a>> {
        let (input, header) = be_u8(input)?;
        let (op, key_id) = split_header(header);
        let opcode = match Opcode::from_u8(op) {
            Some(o) if o != Opcode::DataV1 => o,
            _ => return Err(verify_error(input)),
        };

        let (input, session_id) = SessionId::parse(input)?;

        let (mut input, ack_count) = be_u8(input)?;
        if ack_count as usize > RELIABLE_ACK_SIZE {
            return Err(verify_error(input));
        }
        let mut acks = ArrayVec::new();
        for _ in 0..ack_count {
            let (rest, id) = be_u32(input)?;
            acks.push(id);
            input = rest;
        }

        let (input, remote_session_id) = if ack_count > 0 {
            let (input, sid) = SessionId::parse(input)?;
            (input, Some(sid))
        } else {
            (input, None)
        };

        let (input, message_id) = if opcode == Opcode::AckV1 {
            (input, None)
        } else {
            let (input, id) = be_u32(input)?;
            (input, Some(id))
        };

        let (rest, payload) = take(input.len())(input)?;

        Ok((
            rest,
            ControlPacket {
                opcode,
                key_id,
                session_id,
                acks,
                remote_session_id,
                message_id,
                payload,
            },
        ))
    }

    pub fn serialize(&self, output: &mut Buf) {
        output.push(header_byte(self.opcode, self.key_id));
        self.session_id.serialize(output);
        output.push(self.acks.len() as u8);
        for id in &self.acks {
            output.extend_from_slice(&id.to_be_bytes());
        }
        if !self.acks.is_empty() {
            self.remote_session_id.unwrap_or_default().serialize(output);
        }
        if let Some(id) = self.message_id {
            output.extend_from_slice(&id.to_be_bytes());
        }
        output.extend_from_slice(self.payload);
    }
}

fn verify_error(input: &[u8]) -> nom::Err<nom::error::Error<&[u8]>> {
    nom::Err::Error(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Verify,
    ))
}
