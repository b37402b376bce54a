use std::time::{Duration, Instant, SystemTime};

use once_cell::sync::Lazy;

// All time in tlsmux comes from the caller as `Instant`. Long-form packet
// ids carry wall-clock seconds, so we need a way from an Instant to unix
// time. We pin one Instant and one SystemTime taken together, and measure
// every later Instant relative to that pair.
//
// The anchor is placed up to an hour in the past so Instants handed to us
// slightly before the first call still land after it.
static ANCHOR: Lazy<(Instant, SystemTime)> = Lazy::new(|| {
    let now = Instant::now();
    let now_sys = SystemTime::now();

    let back = (1..=3600)
        .rev()
        .map(Duration::from_secs)
        .find(|d| now.checked_sub(*d).is_some())
        .unwrap_or(Duration::ZERO);

    (now - back, now_sys - back)
});

pub trait InstantExt {
    /// Wall-clock time since the unix epoch for this Instant.
    ///
    /// Instants before the anchor are clamped to it.
    fn to_unix_duration(&self) -> Duration;

    /// Seconds since the unix epoch, truncated to 32 bits as used on the wire.
    fn to_unix_secs(&self) -> u32 {
        self.to_unix_duration().as_secs() as u32
    }
}

impl InstantExt for Instant {
    fn to_unix_duration(&self) -> Duration {
        let (anchor, anchor_sys) = *ANCHOR;
        if *self < anchor {
            warn!("Instant before time anchor, clamping");
        }
        let wall = anchor_sys + self.saturating_duration_since(anchor);
        wall.duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    }
}
