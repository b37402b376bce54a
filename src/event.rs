//! Local events queued for delivery via `poll_output`.

use crate::buffer::Buf;
use crate::Output;

/// Events queued by the multiplexer for delivery to the application.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum LocalEvent {
    /// First key became active.
    Connected,
    /// A key with this id became active.
    KeyActive(u8),
    /// Application control message from the peer.
    ControlMessage(Buf),
    /// The active session failed.
    Closed,
}

impl LocalEvent {
    /// Convert this event into an `Output` for delivery to the application.
    ///
    /// * `buf` - Buffer to copy control message bytes into.
    pub(crate) fn into_output(self, buf: &mut [u8]) -> Output<'_> {
        match self {
            LocalEvent::Connected => Output::Connected,
            LocalEvent::KeyActive(key_id) => Output::KeyActive(key_id),
            LocalEvent::ControlMessage(msg) => {
                let l = msg.len();
                assert!(l <= buf.len(), "Buffer too small for control message");
                buf[..l].copy_from_slice(&msg);
                Output::ControlMessage(&buf[..l])
            }
            LocalEvent::Closed => Output::Closed,
        }
    }
}
