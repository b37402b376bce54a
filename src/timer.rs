use std::ops::Mul;
use std::time::Duration;

use crate::SeededRng;

// Fraction of the current rto.
const JITTER_FRACTION: f32 = 0.2;

/// Retransmit timer for a single reliable control packet.
///
/// Doubles the timeout on every attempt until `doublings` attempts have been
/// made, after which the timeout stays at its maximum. Abandoning a packet is
/// left to the handshake window of the owning key state.
pub struct ExponentialBackoff {
    rto: Duration,
    jitter: f32,
    left: usize,
}

impl ExponentialBackoff {
    pub fn new(start_rto: Duration, doublings: usize, rng: &mut SeededRng) -> Self {
        Self {
            rto: start_rto,
            jitter: Self::jitter(rng),
            left: doublings,
        }
    }

    pub fn rto(&self) -> Duration {
        let offset = self.rto.mul_f32(self.jitter.abs());
        if self.jitter < 0.0 {
            self.rto.saturating_sub(offset)
        } else {
            self.rto + offset
        }
        .max(Duration::from_millis(50))
    }

    // A value between -0.1 and 0.1
    fn jitter(rng: &mut SeededRng) -> f32 {
        rng.random::<f32>() * JITTER_FRACTION - (JITTER_FRACTION / 2.0)
    }

    pub fn attempt(&mut self, rng: &mut SeededRng) {
        let (n, overflow) = self.left.overflowing_sub(1);

        if overflow {
            return;
        }

        self.left = n;
        self.jitter = Self::jitter(rng);
        self.rto = self.rto.mul(2);
    }

    pub fn is_max(&self) -> bool {
        self.left == 0
    }
}

impl std::fmt::Debug for ExponentialBackoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExponentialBackoff")
            .field("rto", &self.rto)
            .field("left", &self.left)
            .finish()
    }
}
