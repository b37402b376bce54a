//! Packet ids and the sliding replay window.
//!
//! Every authenticated packet carries a 32-bit id, optionally preceded by a
//! 32-bit timestamp (the long form). The sender counts up from 1 and never
//! reuses an id under the same key. The receiver keeps the highest id seen
//! plus a bitmap of the ids just below it, and rejects anything it has seen
//! or that has fallen out of the window.

use nom::number::complete::be_u32;
use nom::IResult;

use crate::buffer::Buf;
use crate::crypto::CryptoError;

/// Largest replay window a receiver can be configured with.
pub const MAX_REPLAY_WINDOW: usize = 1024;

/// Default replay window.
pub const DEFAULT_REPLAY_WINDOW: usize = 64;

const WORDS: usize = MAX_REPLAY_WINDOW / 64;

// Renegotiate well before the short form wraps.
const WRAP_MARGIN: u32 = 0x0100_0000;

/// A packet id as carried on the wire.
///
/// `time` is zero in the short form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PacketId {
    pub time: u32,
    pub id: u32,
}

impl PacketId {
    pub fn wire_len(long_form: bool) -> usize {
        if long_form {
            8
        } else {
            4
        }
    }

    pub fn parse(input: &[u8], long_form: bool) -> IResult<&[u8], Self> {
        let (input, id) = be_u32(input)?;
        if !long_form {
            return Ok((input, PacketId { time: 0, id }));
        }
        let (input, time) = be_u32(input)?;
        Ok((input, PacketId { time, id }))
    }

    pub fn serialize(&self, long_form: bool, output: &mut Buf) {
        output.extend_from_slice(&self.id.to_be_bytes());
        if long_form {
            output.extend_from_slice(&self.time.to_be_bytes());
        }
    }
}

/// Why a receiver refused a packet id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error("packet id 0 is invalid")]
    Invalid,
    #[error("packet id too old")]
    Expired,
    #[error("packet id replayed")]
    Replayed,
}

/// Sender side of a packet id sequence.
#[derive(Debug)]
pub struct PacketIdSend {
    long_form: bool,
    time: u32,
    id: u32,
}

impl PacketIdSend {
    pub fn new(long_form: bool) -> Self {
        PacketIdSend {
            long_form,
            time: 0,
            id: 0,
        }
    }

    /// Allocate the next id.
    ///
    /// `now_secs` stamps the long form. When the 32-bit id space runs out,
    /// the long form restarts at id 1 under a newer timestamp; the short
    /// form has nowhere to go and fails.
    pub fn next(&mut self, now_secs: u32) -> Result<PacketId, CryptoError> {
        if self.time == 0 {
            self.time = now_secs;
        }
        match self.id.checked_add(1) {
            Some(id) => self.id = id,
            None if self.long_form && now_secs > self.time => {
                self.time = now_secs;
                self.id = 1;
            }
            None => return Err(CryptoError::PacketIdExhausted),
        }
        let time = if self.long_form { self.time } else { 0 };
        Ok(PacketId { time, id: self.id })
    }

    /// True when the sequence should be replaced by renegotiating.
    pub fn close_to_wrapping(&self) -> bool {
        !self.long_form && self.id >= u32::MAX - WRAP_MARGIN
    }

    #[cfg(test)]
    pub(crate) fn set_id(&mut self, id: u32) {
        self.id = id;
    }
}

/// Receiver side of a packet id sequence.
///
/// `test` never mutates, `add` records an id once the packet it arrived on
/// has been fully accepted.
pub struct PacketIdRecv {
    long_form: bool,
    window: usize,
    initialized: bool,
    time: u32,
    highest: u32,
    // Bit n is set when `highest - n` has been seen.
    seen: [u64; WORDS],
    ignore_once: bool,
}

impl PacketIdRecv {
    pub fn new(long_form: bool, window: usize) -> Self {
        PacketIdRecv {
            long_form,
            window: window.clamp(1, MAX_REPLAY_WINDOW),
            initialized: false,
            time: 0,
            highest: 0,
            seen: [0; WORDS],
            ignore_once: false,
        }
    }

    /// Exempt the next accepted packet from replay checking.
    ///
    /// Used for the first unauthenticated packet of a session, before any
    /// state exists to check it against.
    pub fn ignore_next(&mut self) {
        self.ignore_once = true;
    }

    pub(crate) fn is_ignoring(&self) -> bool {
        self.ignore_once
    }

    pub(crate) fn clear_ignore(&mut self) {
        self.ignore_once = false;
    }

    pub fn test(&self, pin: PacketId) -> Result<(), ReplayError> {
        if pin.id == 0 {
            return Err(ReplayError::Invalid);
        }
        if !self.initialized {
            return Ok(());
        }
        if self.long_form {
            if pin.time > self.time {
                return Ok(());
            }
            if pin.time < self.time {
                return Err(ReplayError::Expired);
            }
        }
        if pin.id > self.highest {
            return Ok(());
        }
        let offset = (self.highest - pin.id) as usize;
        if offset >= self.window {
            return Err(ReplayError::Expired);
        }
        if self.is_seen(offset) {
            return Err(ReplayError::Replayed);
        }
        Ok(())
    }

    pub fn add(&mut self, pin: PacketId) {
        let new_epoch = self.long_form && pin.time > self.time;
        if !self.initialized || new_epoch {
            self.initialized = true;
            self.time = pin.time;
            self.highest = pin.id;
            self.seen = [0; WORDS];
            self.seen[0] = 1;
            return;
        }
        if pin.id > self.highest {
            self.shift(pin.id - self.highest);
            self.highest = pin.id;
            self.seen[0] |= 1;
            return;
        }
        let offset = (self.highest - pin.id) as usize;
        if offset < self.window {
            self.seen[offset / 64] |= 1 << (offset % 64);
        }
    }

    /// Check and record in one step.
    pub fn check_and_update(&mut self, pin: PacketId) -> Result<(), ReplayError> {
        self.test(pin)?;
        self.add(pin);
        Ok(())
    }

    fn is_seen(&self, offset: usize) -> bool {
        self.seen[offset / 64] & (1 << (offset % 64)) != 0
    }

    fn shift(&mut self, delta: u32) {
        let delta = delta as usize;
        if delta >= MAX_REPLAY_WINDOW {
            self.seen = [0; WORDS];
            return;
        }
        let words = delta / 64;
        let bits = delta % 64;
        for i in (0..WORDS).rev() {
            let mut v = if i >= words {
                self.seen[i - words] << bits
            } else {
                0
            };
            if bits > 0 && i > words {
                v |= self.seen[i - words - 1] >> (64 - bits);
            }
            self.seen[i] = v;
        }
    }
}

impl std::fmt::Debug for PacketIdRecv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketIdRecv")
            .field("long_form", &self.long_form)
            .field("window", &self.window)
            .field("time", &self.time)
            .field("highest", &self.highest)
            .finish()
    }
}
