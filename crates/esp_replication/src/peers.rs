//! C4: maps peer datagram address to player identity, owns the per-peer
//! outbound fragment-sequence counter, and tracks each peer's lifecycle
//! (spec §3 "Peer Identity", §4.4).

use std::{net::SocketAddr, time::Instant};

use ahash::AHashMap;
use esp_proto::ids::{LocalId, PlayerId, RoomId, SeqNum};

/// One connected peer, exclusively owned by [`PeerRegistry`]; every other
/// component holds only the [`PlayerId`] key (spec §3).
pub struct Peer {
    pub player_id: PlayerId,
    pub addr: SocketAddr,
    /// `0` (the lobby) until a `JOIN_ROOM` succeeds.
    pub room_id: RoomId,
    /// `0` while not seated in a room.
    pub local_id: LocalId,
    next_seq: SeqNum,
    pub last_seen: Instant,
}

impl Peer {
    /// Allocates and returns the next per-peer outbound fragment sequence
    /// number; this counter is this peer's single-writer property
    /// (spec §5, §9 "Global monotonic counters").
    pub fn alloc_seq(&mut self) -> SeqNum {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.next();
        seq
    }

    /// Reserves `count` consecutive sequence numbers atomically (one per
    /// fragment of a multi-fragment send) and returns the first. Spec §3
    /// requires the `F` fragments of one logical message to bear
    /// *consecutive* sequence numbers, so a multi-fragment send must not
    /// interleave with any other allocation from this peer's counter.
    pub fn reserve_seq_range(&mut self, count: usize) -> SeqNum {
        let start = self.next_seq;
        self.next_seq = SeqNum(self.next_seq.0.wrapping_add(count as u32));
        start
    }

    #[must_use]
    pub fn in_room(&self) -> bool {
        !self.room_id.is_lobby()
    }
}

/// Tracks every connected peer, keyed by both address and [`PlayerId`].
/// Not shared across threads: owned exclusively by the single-threaded
/// server event loop (spec §5).
#[derive(Default)]
pub struct PeerRegistry {
    next_player_id: u32,
    by_addr: AHashMap<SocketAddr, PlayerId>,
    by_id: AHashMap<PlayerId, Peer>,
}

impl PeerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_player_id: 1,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn by_addr(&self, addr: SocketAddr) -> Option<&Peer> {
        self.by_addr.get(&addr).and_then(|id| self.by_id.get(id))
    }

    #[must_use]
    pub fn get(&self, id: PlayerId) -> Option<&Peer> {
        self.by_id.get(&id)
    }

    pub fn get_mut(&mut self, id: PlayerId) -> Option<&mut Peer> {
        self.by_id.get_mut(&id)
    }

    /// Handles an `INIT` from `addr`: allocates the next `player_id` and
    /// registers the peer, starting its outbound sequence counter at 1
    /// (spec §4.4). Re-sending `INIT` from an address already registered
    /// is idempotent and returns the existing identity, rather than
    /// minting a second one for the same socket.
    pub fn init(&mut self, addr: SocketAddr, now: Instant) -> PlayerId {
        if let Some(&existing) = self.by_addr.get(&addr) {
            return existing;
        }
        let player_id = PlayerId(self.next_player_id);
        self.next_player_id += 1;
        self.by_addr.insert(addr, player_id);
        self.by_id.insert(
            player_id,
            Peer {
                player_id,
                addr,
                room_id: RoomId::LOBBY,
                local_id: LocalId::NONE,
                next_seq: SeqNum(1),
                last_seen: now,
            },
        );
        player_id
    }

    pub fn set_room(&mut self, id: PlayerId, room_id: RoomId, local_id: LocalId) {
        if let Some(peer) = self.by_id.get_mut(&id) {
            peer.room_id = room_id;
            peer.local_id = local_id;
        }
    }

    /// Removes the peer entirely (spec §4.4: `DISCONNECT` or abandonment).
    /// Callers are responsible for also purging room membership,
    /// reassembly state, and the reliability outbox for this peer.
    pub fn remove(&mut self, id: PlayerId) -> Option<Peer> {
        let peer = self.by_id.remove(&id)?;
        self.by_addr.remove(&peer.addr);
        Some(peer)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.by_id.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
    }

    #[test]
    fn init_allocates_monotonic_player_ids() {
        let mut reg = PeerRegistry::new();
        let now = Instant::now();
        let a = reg.init(addr(1), now);
        let b = reg.init(addr(2), now);
        assert_eq!(a, PlayerId(1));
        assert_eq!(b, PlayerId(2));
        assert_ne!(a, b);
    }

    #[test]
    fn repeated_init_from_same_address_is_idempotent() {
        let mut reg = PeerRegistry::new();
        let now = Instant::now();
        let first = reg.init(addr(1), now);
        let second = reg.init(addr(1), now);
        assert_eq!(first, second);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn sequence_counter_starts_at_one_and_increments() {
        let mut reg = PeerRegistry::new();
        let id = reg.init(addr(1), Instant::now());
        let peer = reg.get_mut(id).unwrap();
        assert_eq!(peer.alloc_seq(), SeqNum(1));
        assert_eq!(peer.alloc_seq(), SeqNum(2));
    }

    #[test]
    fn reserve_seq_range_is_contiguous_and_atomic() {
        let mut reg = PeerRegistry::new();
        let id = reg.init(addr(1), Instant::now());
        let peer = reg.get_mut(id).unwrap();
        let start = peer.reserve_seq_range(3);
        assert_eq!(start, SeqNum(1));
        assert_eq!(peer.alloc_seq(), SeqNum(4), "next allocation continues after the reserved range");
    }

    #[test]
    fn remove_clears_both_indices() {
        let mut reg = PeerRegistry::new();
        let id = reg.init(addr(1), Instant::now());
        assert!(reg.remove(id).is_some());
        assert!(reg.by_addr(addr(1)).is_none());
        assert!(reg.get(id).is_none());
        assert!(reg.remove(id).is_none(), "double remove is a no-op");
    }
}
