//! Server-exposed control knobs (spec §6 "Server-exposed control knobs",
//! §5, §9). One struct instead of scattered constants so binaries can wire
//! them up from `clap` flags.

use std::time::Duration;

/// Tunable parameters of the replication engine and reliability layer.
/// Defaults match the values spec.md states explicitly.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// How often the replication engine's periodic broadcast fires
    /// (spec §4.6: "every 1/21 s").
    pub broadcast_hz: f64,
    /// Retransmit timeout for reliable sends (spec §4.3/§5: 100 ms).
    pub retransmit_timeout: Duration,
    /// Retry cap before declaring delivery abandoned (spec §4.3/§5: 5).
    pub retry_cap: u32,
    /// Repeat count for fire-and-forget K-redundant sends (spec §4.3: 3).
    pub k_redundancy: usize,
    /// How long an incomplete fragment group is kept (spec §3/§4.2: 5 s).
    pub reassembly_timeout: Duration,
    /// Minimum (and maximum, per spec §4.5) players for a room to admit
    /// events (spec §4.6: default 4).
    pub required_players: u8,
    /// Capacity of a room's rolling `updates` deque, and the threshold
    /// beyond which a lagging client is promoted to a full snapshot
    /// instead of a delta (spec §3/§4.6/§9: 10).
    pub updates_window: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broadcast_hz: 21.0,
            retransmit_timeout: esp_proto::reliability::RETRANSMIT_TIMEOUT,
            retry_cap: esp_proto::reliability::RETRY_CAP,
            k_redundancy: esp_proto::reliability::K_REDUNDANCY,
            reassembly_timeout: esp_proto::reassembly::REASSEMBLY_TIMEOUT,
            required_players: 4,
            updates_window: 10,
        }
    }
}

impl Config {
    #[must_use]
    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.broadcast_hz)
    }
}
