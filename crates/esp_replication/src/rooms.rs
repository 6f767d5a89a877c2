//! C5 Room Manager and C7 Conflict Resolver: room lifecycle, membership,
//! and the first-writer-wins cell acquisition rule (spec §3 "Room",
//! §4.5, §4.7).

use std::collections::BTreeMap;

use ahash::AHashMap;
use esp_proto::{
    body::{MemberInfo, RoomSummary, UpdateEntry, EVENT_TYPE_ACQUIRE, GRID_CELLS},
    ids::{LocalId, PlayerId, RoomId, SnapshotId},
};
use rand::Rng;
use ringbuf::{
    traits::{Observer, RingBuffer},
    HeapRb,
};
use thiserror::Error;

use crate::colors::pick_color;

/// One seated room member: their global identity and their room-unique
/// color (spec §3 "Room", §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub player_id: PlayerId,
    pub color: (u8, u8, u8),
}

/// Outcome of a `CELL_ACQUISITION` request, decided by [`Room::acquire`]
/// (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// `cell_idx` was out of `[0, 400)`: no-op, no snapshot advance.
    OutOfRange,
    /// The cell was already owned; the grid is unchanged and the existing
    /// owner is returned so the caller can still broadcast a reflecting
    /// `EVENT`.
    AlreadyOwned(LocalId),
    /// The cell was empty and is now owned by the requester.
    Acquired,
}

/// A single room's authoritative state (spec §3 "Room").
pub struct Room {
    pub room_id: RoomId,
    pub name: String,
    /// The player who first joined this room while it was still empty,
    /// kept for informational `LIST_ROOMS`/debugging surfaces only — not
    /// part of the wire protocol and never consulted for arbitration
    /// (`[supplement, from original_source/grid_clash]`, see `DESIGN.md`).
    pub host_id: PlayerId,
    pub snapshot_id: SnapshotId,
    /// `local_id -> Member`. `local_id` ranges `1..=required_players`.
    players: BTreeMap<u8, Member>,
    pub grid: [u8; GRID_CELLS],
    updates: HeapRb<UpdateEntry>,
}

impl Room {
    fn new(room_id: RoomId, name: String, host_id: PlayerId, updates_window: usize) -> Self {
        Self {
            room_id,
            name,
            host_id,
            snapshot_id: SnapshotId::default(),
            players: BTreeMap::new(),
            grid: [0u8; GRID_CELLS],
            updates: HeapRb::new(updates_window.max(1)),
        }
    }

    #[must_use]
    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    #[must_use]
    pub fn is_full(&self, required_players: u8) -> bool {
        self.players.len() as u8 >= required_players
    }

    fn free_local_id(&self, required_players: u8) -> Option<LocalId> {
        (1..=required_players)
            .find(|slot| !self.players.contains_key(slot))
            .map(LocalId)
    }

    /// Seats `player_id`, assigning the lowest free local-id slot and a
    /// color not already held in this room (spec §4.5). Returns `None` if
    /// the room has no free slot.
    pub fn join(&mut self, player_id: PlayerId, required_players: u8, rng: &mut impl Rng) -> Option<LocalId> {
        let local_id = self.free_local_id(required_players)?;
        let used: Vec<_> = self.players.values().map(|m| m.color).collect();
        let color = pick_color(&used, rng);
        self.players.insert(local_id.0, Member { player_id, color });
        Some(local_id)
    }

    /// Vacates whichever seat `player_id` holds, if any. Returns the
    /// vacated [`LocalId`].
    pub fn leave(&mut self, player_id: PlayerId) -> Option<LocalId> {
        let local_id = self
            .players
            .iter()
            .find(|(_, m)| m.player_id == player_id)
            .map(|(&slot, _)| slot)?;
        self.players.remove(&local_id);
        if self.host_id == player_id {
            if let Some(next_host) = self.players.values().next() {
                self.host_id = next_host.player_id;
            }
        }
        Some(LocalId(local_id))
    }

    #[must_use]
    pub fn members(&self) -> Vec<MemberInfo> {
        self.players
            .iter()
            .map(|(&local_id, m)| MemberInfo {
                player_id: m.player_id,
                local_id: LocalId(local_id),
                color: m.color,
            })
            .collect()
    }

    fn push_update(&mut self, entry: UpdateEntry) {
        self.updates.push_overwrite(entry);
    }

    /// The most recent `n` updates (or fewer if the deque holds less),
    /// oldest first — exactly what a periodic `UPDATES` broadcast or a
    /// targeted catch-up sends (spec §4.6).
    #[must_use]
    pub fn recent_updates(&self, n: usize) -> Vec<UpdateEntry> {
        let len = self.updates.occupied_len();
        let skip = len.saturating_sub(n);
        self.updates.iter().skip(skip).copied().collect()
    }

    #[must_use]
    pub fn updates_len(&self) -> usize {
        self.updates.occupied_len()
    }

    /// C7: the first-writer-wins conflict resolver. On success, advances
    /// `snapshot_id` by exactly one and records the update (spec §4.7).
    pub fn acquire(&mut self, local_id: LocalId, cell_idx: u16) -> AcquireOutcome {
        let Ok(idx) = usize::try_from(cell_idx) else {
            return AcquireOutcome::OutOfRange;
        };
        if idx >= GRID_CELLS {
            return AcquireOutcome::OutOfRange;
        }
        let current = self.grid[idx];
        if current != 0 {
            return AcquireOutcome::AlreadyOwned(LocalId(current));
        }
        self.grid[idx] = local_id.0;
        self.snapshot_id = self.snapshot_id.next();
        self.push_update(UpdateEntry {
            event_type: EVENT_TYPE_ACQUIRE,
            local_id,
            cell_idx,
        });
        AcquireOutcome::Acquired
    }
}

/// Errors from [`RoomTable`] operations, all of which the caller turns
/// into a silent drop per spec §7 ("out-of-state request").
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RoomError {
    #[error("room does not exist")]
    NotFound,
    #[error("room has no free seat")]
    Full,
    #[error("room name exceeds 255 bytes")]
    NameTooLong,
}

/// C5: creates, looks up, and tears down rooms (spec §4.5).
#[derive(Default)]
pub struct RoomTable {
    next_room_id: u16,
    rooms: AHashMap<RoomId, Room>,
}

impl RoomTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_room_id: 1,
            ..Default::default()
        }
    }

    /// `CREATE_ROOM`: allocates the next `room_id` and stores `name`. The
    /// creator is NOT automatically joined (spec §4.5). `host_id` is
    /// recorded only as the informational "first joiner" seed — see
    /// [`Room::host_id`] — and is overwritten by the first real `join`.
    pub fn create(&mut self, name: String, host_id: PlayerId, updates_window: usize) -> Result<RoomId, RoomError> {
        if name.as_bytes().len() > 255 {
            return Err(RoomError::NameTooLong);
        }
        // Wire `room_id` is one byte (spec §6); 0 is the lobby sentinel.
        if self.next_room_id > u16::from(u8::MAX) {
            return Err(RoomError::Full);
        }
        let room_id = RoomId(self.next_room_id as u8);
        self.next_room_id += 1;
        self.rooms.insert(room_id, Room::new(room_id, name, host_id, updates_window));
        Ok(room_id)
    }

    #[must_use]
    pub fn get(&self, room_id: RoomId) -> Option<&Room> {
        self.rooms.get(&room_id)
    }

    pub fn get_mut(&mut self, room_id: RoomId) -> Option<&mut Room> {
        self.rooms.get_mut(&room_id)
    }

    /// `JOIN_ROOM`: seats `player_id` in `room_id` if it exists and has a
    /// free slot. The first player ever seated in a room becomes its
    /// `host_id` (spec §4.5, `[supplement]`).
    pub fn join(&mut self, room_id: RoomId, player_id: PlayerId, required_players: u8, rng: &mut impl Rng) -> Result<LocalId, RoomError> {
        let room = self.rooms.get_mut(&room_id).ok_or(RoomError::NotFound)?;
        if room.players.is_empty() {
            room.host_id = player_id;
        }
        room.join(player_id, required_players, rng).ok_or(RoomError::Full)
    }

    /// `LEAVE_ROOM`: vacates `player_id`'s seat. Lazily destroys the room
    /// once empty (spec §3 "Room" lifecycle), returning `true` if it was.
    pub fn leave(&mut self, room_id: RoomId, player_id: PlayerId) -> (Option<LocalId>, bool) {
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return (None, false);
        };
        let vacated = room.leave(player_id);
        let destroyed = if room.players.is_empty() {
            self.rooms.remove(&room_id);
            true
        } else {
            false
        };
        (vacated, destroyed)
    }

    /// `LIST_ROOMS`: `(room_id, player_count, name)` for every live room
    /// (spec §4.5).
    #[must_use]
    pub fn list(&self) -> Vec<RoomSummary> {
        let mut rooms: Vec<_> = self
            .rooms
            .values()
            .map(|r| RoomSummary {
                room_id: r.room_id,
                player_count: r.player_count() as u8,
                name: r.name.clone(),
            })
            .collect();
        rooms.sort_by_key(|r| r.room_id.0);
        rooms
    }

    pub fn rooms_mut(&mut self) -> impl Iterator<Item = &mut Room> {
        self.rooms.values_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn rng() -> StdRng {
        StdRng::seed_from_u64(42)
    }

    #[test]
    fn create_does_not_auto_join() {
        let mut table = RoomTable::new();
        let room_id = table.create("arena".into(), PlayerId(1), 10).unwrap();
        assert_eq!(table.get(room_id).unwrap().player_count(), 0);
    }

    #[test]
    fn join_assigns_lowest_free_local_id() {
        let mut table = RoomTable::new();
        let room_id = table.create("arena".into(), PlayerId(0), 10).unwrap();
        let mut r = rng();
        let a = table.join(room_id, PlayerId(1), 4, &mut r).unwrap();
        let b = table.join(room_id, PlayerId(2), 4, &mut r).unwrap();
        assert_eq!(a, LocalId(1));
        assert_eq!(b, LocalId(2));
    }

    #[test]
    fn join_reuses_vacated_lowest_slot() {
        let mut table = RoomTable::new();
        let room_id = table.create("arena".into(), PlayerId(0), 10).unwrap();
        let mut r = rng();
        let a = table.join(room_id, PlayerId(1), 4, &mut r).unwrap();
        let _b = table.join(room_id, PlayerId(2), 4, &mut r).unwrap();
        table.leave(room_id, PlayerId(1));
        let c = table.join(room_id, PlayerId(3), 4, &mut r).unwrap();
        assert_eq!(c, a, "vacated slot 1 is reassigned before a new slot 3");
    }

    #[test]
    fn full_room_rejects_join() {
        let mut table = RoomTable::new();
        let room_id = table.create("arena".into(), PlayerId(0), 10).unwrap();
        let mut r = rng();
        for i in 1..=4u32 {
            table.join(room_id, PlayerId(i), 4, &mut r).unwrap();
        }
        assert_eq!(table.join(room_id, PlayerId(99), 4, &mut r), Err(RoomError::Full));
    }

    #[test]
    fn leave_destroys_room_once_empty() {
        let mut table = RoomTable::new();
        let room_id = table.create("arena".into(), PlayerId(0), 10).unwrap();
        let mut r = rng();
        table.join(room_id, PlayerId(1), 4, &mut r).unwrap();
        let (vacated, destroyed) = table.leave(room_id, PlayerId(1));
        assert_eq!(vacated, Some(LocalId(1)));
        assert!(destroyed);
        assert!(table.get(room_id).is_none());
    }

    #[test]
    fn acquire_first_writer_wins() {
        let mut room = Room::new(RoomId(1), "r".into(), PlayerId(0), 10);
        assert_eq!(room.acquire(LocalId(2), 37), AcquireOutcome::Acquired);
        assert_eq!(room.grid[37], 2);
        assert_eq!(room.snapshot_id, SnapshotId(1));
        assert_eq!(room.acquire(LocalId(3), 37), AcquireOutcome::AlreadyOwned(LocalId(2)));
        assert_eq!(room.grid[37], 2, "ownership never changes once claimed");
        assert_eq!(room.snapshot_id, SnapshotId(1), "no-op does not advance snapshot_id");
    }

    #[test]
    fn acquire_rejects_out_of_range_index() {
        let mut room = Room::new(RoomId(1), "r".into(), PlayerId(0), 10);
        assert_eq!(room.acquire(LocalId(1), 400), AcquireOutcome::OutOfRange);
        assert_eq!(room.snapshot_id, SnapshotId(0));
    }

    #[test]
    fn updates_deque_is_bounded_and_drops_oldest() {
        let mut room = Room::new(RoomId(1), "r".into(), PlayerId(0), 3);
        for i in 0..5u16 {
            room.acquire(LocalId(1), i);
        }
        assert_eq!(room.updates_len(), 3);
        let recent = room.recent_updates(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].cell_idx, 2, "oldest two entries were dropped");
        assert_eq!(recent[2].cell_idx, 4);
    }

    #[test]
    fn name_too_long_is_rejected() {
        let mut table = RoomTable::new();
        let long_name = "x".repeat(256);
        assert_eq!(table.create(long_name, PlayerId(0), 10), Err(RoomError::NameTooLong));
    }
}
