//! Reliable, ordered delivery of control packets over an unreliable link.
//!
//! Each key state owns one [`ReliableQueue`]. Outgoing packets get a
//! monotonically increasing message id and stay in a small send window
//! until acknowledged, being retransmitted with exponential backoff.
//! Incoming packets are acknowledged on every receipt (including
//! duplicates, since the earlier ack may have been lost), buffered in a
//! receive window and released strictly in message id order.

use std::time::{Duration, Instant};

use arrayvec::ArrayVec;

use crate::buffer::Buf;
use crate::timer::ExponentialBackoff;
use crate::wire::Opcode;
use crate::SeededRng;

/// Packets in flight before the sender must wait for acks.
pub const RELIABLE_SEND_BUFFERS: usize = 4;

/// Out-of-order packets a receiver will hold.
pub const RELIABLE_RECV_BUFFERS: usize = 8;

/// Pending acks a receiver remembers.
pub const RELIABLE_ACK_SIZE: usize = 8;

/// Acks piggybacked on a single outgoing control packet.
pub const CONTROL_SEND_ACK_MAX: usize = 4;

/// Acks owed to the peer.
#[derive(Debug, Default)]
pub struct AckList {
    ids: ArrayVec<u32, RELIABLE_ACK_SIZE>,
}

impl AckList {
    /// Remember `id` for acknowledgement. False if there is no room.
    pub fn push(&mut self, id: u32) -> bool {
        if self.ids.contains(&id) {
            return true;
        }
        self.ids.try_push(id).is_ok()
    }

    pub fn has_room(&self) -> bool {
        !self.ids.is_full()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Remove and return up to `CONTROL_SEND_ACK_MAX` ids, oldest first.
    pub fn take(&mut self) -> ArrayVec<u32, RELIABLE_ACK_SIZE> {
        let n = self.ids.len().min(CONTROL_SEND_ACK_MAX);
        self.ids.drain(..n).collect()
    }
}

struct SendEntry {
    message_id: u32,
    opcode: Opcode,
    payload: Buf,
    next_try: Instant,
    backoff: ExponentialBackoff,
    sent: usize,
}

/// Sender half.
pub struct ReliableSend {
    entries: ArrayVec<SendEntry, RELIABLE_SEND_BUFFERS>,
    next_id: u32,
    start_rto: Duration,
    doublings: usize,
}

impl ReliableSend {
    pub fn new(start_rto: Duration, doublings: usize) -> Self {
        ReliableSend {
            entries: ArrayVec::new(),
            next_id: 0,
            start_rto,
            doublings,
        }
    }

    /// Whether another packet may enter the window.
    ///
    /// The window is measured from the oldest unacknowledged id, so one
    /// lost packet stalls the sender even if later ones were acked.
    pub fn can_queue(&self) -> bool {
        match self.entries.first() {
            None => true,
            Some(oldest) => {
                !self.entries.is_full()
                    && self.next_id - oldest.message_id < RELIABLE_SEND_BUFFERS as u32
            }
        }
    }

    /// Queue a packet for immediate transmission. Returns its message id, or
    /// `None` if the window is full.
    pub fn queue(
        &mut self,
        opcode: Opcode,
        payload: &[u8],
        now: Instant,
        rng: &mut SeededRng,
    ) -> Option<u32> {
        if !self.can_queue() {
            return None;
        }
        let message_id = self.next_id;
        self.entries.push(SendEntry {
            message_id,
            opcode,
            payload: Buf::from_slice(payload),
            next_try: now,
            backoff: ExponentialBackoff::new(self.start_rto, self.doublings, rng),
            sent: 0,
        });
        self.next_id += 1;
        Some(message_id)
    }

    /// Forget an acknowledged packet. False if it was not in flight.
    pub fn acknowledge(&mut self, message_id: u32) -> bool {
        let Some(pos) = self
            .entries
            .iter()
            .position(|e| e.message_id == message_id)
        else {
            return false;
        };
        let e = self.entries.remove(pos);
        trace!("Acked message {} after {} sends", e.message_id, e.sent);
        true
    }

    /// Next packet due for (re)transmission, rescheduling it.
    pub fn poll_due(&mut self, now: Instant, rng: &mut SeededRng) -> Option<(u32, Opcode, &[u8])> {
        let e = self.entries.iter_mut().find(|e| e.next_try <= now)?;
        if e.sent > 0 {
            e.backoff.attempt(rng);
            debug!(
                "Retransmit {} message {} (attempt {}{})",
                e.opcode,
                e.message_id,
                e.sent + 1,
                if e.backoff.is_max() { ", max backoff" } else { "" }
            );
        }
        e.sent += 1;
        e.next_try = now + e.backoff.rto();
        Some((e.message_id, e.opcode, &e.payload[..]))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_wakeup(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.next_try).min()
    }
}

/// What to do with an incoming message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvVerdict {
    /// Not seen before and inside the window.
    New,
    /// Already delivered or buffered. Ack again, do not deliver.
    Duplicate,
    /// Too far ahead to buffer without breaking ordering. Drop without ack.
    OutOfWindow,
}

pub struct RecvEntry {
    pub message_id: u32,
    pub opcode: Opcode,
    pub payload: Buf,
}

/// Receiver half.
#[derive(Default)]
pub struct ReliableRecv {
    entries: ArrayVec<RecvEntry, RELIABLE_RECV_BUFFERS>,
    next_id: u32,
}

impl ReliableRecv {
    pub fn classify(&self, message_id: u32) -> RecvVerdict {
        if message_id < self.next_id || self.entries.iter().any(|e| e.message_id == message_id) {
            return RecvVerdict::Duplicate;
        }
        if message_id - self.next_id >= RELIABLE_RECV_BUFFERS as u32 {
            return RecvVerdict::OutOfWindow;
        }
        RecvVerdict::New
    }

    /// Buffer a packet previously classified as [`RecvVerdict::New`].
    pub fn insert(&mut self, message_id: u32, opcode: Opcode, payload: &[u8]) -> bool {
        self.entries
            .try_push(RecvEntry {
                message_id,
                opcode,
                payload: Buf::from_slice(payload),
            })
            .is_ok()
    }

    /// Release the next packet in sequence, if it has arrived.
    pub fn pop_in_order(&mut self) -> Option<RecvEntry> {
        let pos = self
            .entries
            .iter()
            .position(|e| e.message_id == self.next_id)?;
        self.next_id += 1;
        Some(self.entries.remove(pos))
    }
}

/// Both halves plus the acks owed, for one key state.
pub struct ReliableQueue {
    pub send: ReliableSend,
    pub recv: ReliableRecv,
    pub acks: AckList,
}

impl ReliableQueue {
    pub fn new(start_rto: Duration, doublings: usize) -> Self {
        ReliableQueue {
            send: ReliableSend::new(start_rto, doublings),
            recv: ReliableRecv::default(),
            acks: AckList::default(),
        }
    }

    pub fn next_wakeup(&self) -> Option<Instant> {
        self.send.next_wakeup()
    }
}

impl std::fmt::Debug for ReliableQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableQueue")
            .field("in_flight", &self.send.entries.len())
            .field("next_send_id", &self.send.next_id)
            .field("buffered", &self.recv.entries.len())
            .field("next_recv_id", &self.recv.next_id)
            .field("acks", &self.acks.ids.len())
            .finish()
    }
}
