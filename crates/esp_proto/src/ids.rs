//! Newtypes for the integer identifiers that appear throughout the wire
//! protocol and the replication engine built on top of it.
//!
//! Bare `u32`/`u8` values are easy to mix up (a `room_id` passed where a
//! `player_id` was expected compiles silently); wrapping each in its own type
//! turns that mistake into a compile error.

use derive_more::{Display, From};

/// Globally unique identifier of a connected peer. `0` is reserved to mean
/// "no player" and is never assigned to a real peer.
#[derive(Debug, Display, From, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlayerId(pub u32);

impl PlayerId {
    /// Sentinel meaning "no player" (used as the empty-cell owner and as the
    /// `local_id = 0` rejection marker on [`EVENT`](crate::body::EventBody)).
    pub const NONE: Self = Self(0);

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Identifier of a room. `0` means "the lobby" (not in any room).
///
/// Wire-encoded as a single byte (spec §6: `CREATE_ACK`/`JOIN_ROOM`'s
/// `room_id(1)`), which caps the live room count to 1..255 at any moment —
/// ample for the "hundreds, not millions" deployment scale spec §1
/// describes.
#[derive(Debug, Display, From, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoomId(pub u8);

impl RoomId {
    /// Sentinel meaning "the lobby".
    pub const LOBBY: Self = Self(0);

    #[must_use]
    pub const fn is_lobby(self) -> bool {
        self.0 == 0
    }
}

/// 1..N index of a player within a room, distinct from [`PlayerId`]. `0`
/// means "not seated in this room".
#[derive(Debug, Display, From, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalId(pub u8);

impl LocalId {
    /// Sentinel meaning "no local seat" / "acquisition rejected".
    pub const NONE: Self = Self(0);

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Groups all fragments belonging to one logical message.
#[derive(Debug, Display, From, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PacketId(pub u32);

/// Per-peer monotonic fragment sequence number.
#[derive(Debug, Display, From, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeqNum(pub u32);

impl SeqNum {
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

/// Monotonic count of state-changing events applied to a room.
#[derive(Debug, Display, From, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SnapshotId(pub u32);

impl SnapshotId {
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Number of events `other` is behind `self` (`self` is assumed to be the
    /// more up-to-date snapshot, e.g. the server's). Saturates at zero
    /// instead of wrapping if `other` is somehow ahead.
    #[must_use]
    pub fn gap_since(self, other: Self) -> u32 {
        self.0.saturating_sub(other.0)
    }
}
