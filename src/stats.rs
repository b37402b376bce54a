//! Traffic and drop counters.

use std::collections::HashMap;

use crate::DropReason;

/// Counters kept by a [`TlsMultiplexer`][crate::TlsMultiplexer].
#[derive(Debug, Default, Clone)]
pub struct Stats {
    /// Data packets encrypted.
    pub tx_packets: u64,
    /// Plaintext bytes encrypted.
    pub tx_bytes: u64,
    /// Data packets decrypted.
    pub rx_packets: u64,
    /// Plaintext bytes decrypted.
    pub rx_bytes: u64,
    /// Control packets accepted.
    pub control_rx: u64,
    drops: HashMap<DropReason, u64>,
}

impl Stats {
    /// Datagrams dropped for `reason`.
    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.drops.get(&reason).copied().unwrap_or(0)
    }

    /// Datagrams dropped for any reason.
    pub fn total_dropped(&self) -> u64 {
        self.drops.values().sum()
    }

    pub(crate) fn record_drop(&mut self, reason: DropReason) {
        *self.drops.entry(reason).or_insert(0) += 1;
    }
}
