//! C6: decides what the tick-driven broadcast sends, and what a lagging
//! member's ACK should trigger — the delta/snapshot-fallback policy at the
//! heart of eventual convergence (spec §4.6, §9 "Snapshot vs updates
//! threshold").
//!
//! Deliberately pure and socket-free: [`crate::server::Server`] is the only
//! caller, and these functions are exercised directly in tests without
//! standing up a `Room` inside a full server.

use esp_proto::{body::UpdateEntry, ids::SnapshotId};

use crate::rooms::Room;

/// What a member needs sent to them, decided from their last-known
/// `snapshot_id` against the room's current one (spec §4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationAction {
    /// The member's `snapshot_id` already matches the room's; nothing to
    /// send.
    UpToDate,
    /// Lag is within the updates window: send exactly these trailing
    /// entries as a targeted `UPDATES` message.
    SendUpdates(Vec<UpdateEntry>),
    /// Lag exceeds the updates window (or the member never had a
    /// snapshot); the rolling deque cannot cover it, so fall back to a
    /// full `SNAPSHOT`.
    SendSnapshot,
}

/// Decides the targeted catch-up action for a member who has ACKed an
/// `UPDATES` message reporting `member_snapshot_id` (spec §4.6, second
/// bullet).
#[must_use]
pub fn catch_up(room: &Room, member_snapshot_id: SnapshotId) -> ReplicationAction {
    let lag = room.snapshot_id.gap_since(member_snapshot_id);
    if lag == 0 {
        ReplicationAction::UpToDate
    } else if (lag as usize) <= room.updates_len() {
        ReplicationAction::SendUpdates(room.recent_updates(lag as usize))
    } else {
        ReplicationAction::SendSnapshot
    }
}

/// Decides the action following a `SNAPSHOT_ACK` reporting
/// `acked_snapshot_id`: symmetrically, a fresh `SNAPSHOT` only if the room
/// has advanced since that snapshot was generated (spec §4.6, third
/// bullet). Never resolves to `SendUpdates` — once a member needed a
/// snapshot, the next catch-up is another snapshot, not a delta.
#[must_use]
pub fn snapshot_ack_action(room: &Room, acked_snapshot_id: SnapshotId) -> ReplicationAction {
    if room.snapshot_id.gap_since(acked_snapshot_id) > 0 {
        ReplicationAction::SendSnapshot
    } else {
        ReplicationAction::UpToDate
    }
}

/// What the periodic tick broadcasts to every member of a full room: the
/// last `min(k, updates_len)` entries (spec §4.6, "Periodic broadcast").
#[must_use]
pub fn periodic_broadcast(room: &Room, k: usize) -> Vec<UpdateEntry> {
    room.recent_updates(k.min(room.updates_len()))
}
