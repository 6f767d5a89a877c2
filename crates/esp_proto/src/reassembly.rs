//! C2: groups fragments by `(peer address, packet id)` and delivers the
//! concatenated body exactly once, in order, when a group completes.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    time::{Duration, Instant},
};

use ahash::AHashMap;

use crate::{
    codec::Packet,
    header::MAX_FRAGMENT_BODY,
    ids::{PacketId, SeqNum},
};

/// How long an incomplete group is kept before being evicted (spec §3/§4.2).
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    addr: SocketAddr,
    pkt_id: PacketId,
}

struct Group {
    /// Fragment bodies keyed by sequence number, ordered for cheap
    /// contiguity checks and concatenation.
    fragments: BTreeMap<u32, bytes::Bytes>,
    total_bytes: usize,
    /// Set once a fragment shorter than [`MAX_FRAGMENT_BODY`] (the terminal
    /// fragment) has been received.
    terminal_seq: Option<u32>,
    last_touch: Instant,
    msg_type_raw: u8,
    snapshot_id: crate::ids::SnapshotId,
    timestamp_nanos: u64,
}

/// A fully reassembled logical message, ready for dispatch.
#[derive(Debug)]
pub struct Reassembled {
    pub msg_type_raw: u8,
    pub snapshot_id: crate::ids::SnapshotId,
    pub timestamp_nanos: u64,
    /// Sequence numbers of every fragment that made up this message, in
    /// order — callers that must ACK per-fragment (spec §4.8) iterate this.
    pub seqs: Vec<SeqNum>,
    pub body: Vec<u8>,
}

/// Accumulates in-flight fragment groups for one endpoint (server or
/// client). Not `Send`/shared: owned exclusively by the single-threaded
/// event loop, per spec §5.
#[derive(Default)]
pub struct Reassembler {
    groups: AHashMap<GroupKey, Group>,
}

impl Reassembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one decoded fragment in. Returns `Some` the instant the group
    /// it belongs to becomes complete (contiguous coverage from its lowest
    /// sequence number up to and including a terminal short fragment).
    ///
    /// A fragment whose sequence number is already present in its group is
    /// a duplicate and is discarded, per spec §4.2/§4.3.
    pub fn receive(&mut self, addr: SocketAddr, packet: &Packet, now: Instant) -> Option<Reassembled> {
        let key = GroupKey {
            addr,
            pkt_id: packet.pkt_id,
        };
        let group = self.groups.entry(key.clone()).or_insert_with(|| Group {
            fragments: BTreeMap::new(),
            total_bytes: 0,
            terminal_seq: None,
            last_touch: now,
            msg_type_raw: packet.msg_type_raw,
            snapshot_id: packet.snapshot_id,
            timestamp_nanos: packet.timestamp_nanos,
        });

        group.last_touch = now;
        if group.fragments.contains_key(&packet.seq_num.0) {
            return None; // duplicate fragment-sequence within an existing group
        }
        group.total_bytes += packet.body.len();
        if packet.body.len() < MAX_FRAGMENT_BODY {
            group.terminal_seq = Some(packet.seq_num.0);
        }
        group.fragments.insert(packet.seq_num.0, packet.body.clone());

        let Some(terminal) = group.terminal_seq else {
            return None;
        };
        if !is_contiguous_up_to(&group.fragments, terminal) {
            return None;
        }

        let group = self.groups.remove(&key).expect("just inserted above");
        let seqs = group.fragments.keys().copied().map(SeqNum).collect();
        let mut body = Vec::with_capacity(group.total_bytes);
        for bytes in group.fragments.values() {
            body.extend_from_slice(bytes);
        }
        Some(Reassembled {
            msg_type_raw: group.msg_type_raw,
            snapshot_id: group.snapshot_id,
            timestamp_nanos: group.timestamp_nanos,
            seqs,
            body,
        })
    }

    /// Evicts any group untouched for longer than [`REASSEMBLY_TIMEOUT`].
    /// Must be invoked periodically by C9; evicted groups yield no delivery.
    pub fn expire(&mut self, now: Instant) {
        self.expire_after(now, REASSEMBLY_TIMEOUT);
    }

    /// Same as [`Self::expire`] but with a caller-supplied timeout, for
    /// callers that expose the fragment-reassembly timeout as a config knob
    /// (spec §6 "Server-exposed control knobs").
    pub fn expire_after(&mut self, now: Instant, timeout: Duration) {
        self.groups.retain(|_, group| now.duration_since(group.last_touch) < timeout);
    }

    /// Drops every in-flight group belonging to `addr` (peer cleanup on
    /// disconnect/abandonment, spec §4.4).
    pub fn purge_peer(&mut self, addr: SocketAddr) {
        self.groups.retain(|key, _| key.addr != addr);
    }

    #[must_use]
    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }
}

/// Whether `fragments`' keys cover `0..=terminal` with no gaps, starting
/// from its own lowest key (a group need not start at sequence 0 — it
/// starts at whatever sequence the sender began this logical message at).
fn is_contiguous_up_to(fragments: &BTreeMap<u32, bytes::Bytes>, terminal: u32) -> bool {
    let Some(&first) = fragments.keys().next() else {
        return false;
    };
    if terminal < first {
        return false;
    }
    let expected_count = (terminal - first + 1) as usize;
    if fragments.len() != expected_count {
        return false;
    }
    fragments
        .keys()
        .copied()
        .eq((first..=terminal).collect::<Vec<_>>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::{decode_packet, encode_message},
        header::MsgType,
        ids::{PacketId, SnapshotId},
    };
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn addr() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9000))
    }

    fn packets_for(body: &[u8]) -> Vec<Packet> {
        encode_message(MsgType::Updates, PacketId(5), SeqNum(1), SnapshotId(0), 0, body)
            .iter()
            .map(|bytes| decode_packet(bytes).unwrap())
            .collect()
    }

    #[test]
    fn delivers_once_when_all_fragments_arrive_in_order() {
        let body = vec![9u8; MAX_FRAGMENT_BODY + 50];
        let packets = packets_for(&body);
        let mut reasm = Reassembler::new();
        let now = Instant::now();
        assert!(reasm.receive(addr(), &packets[0], now).is_none());
        let done = reasm.receive(addr(), &packets[1], now).expect("completes here");
        assert_eq!(done.body, body);
        assert_eq!(done.seqs, vec![SeqNum(1), SeqNum(2)]);
    }

    #[test]
    fn delivers_once_when_fragments_arrive_out_of_order() {
        let body = vec![3u8; MAX_FRAGMENT_BODY * 2 + 1];
        let packets = packets_for(&body);
        assert_eq!(packets.len(), 3);
        let mut reasm = Reassembler::new();
        let now = Instant::now();
        assert!(reasm.receive(addr(), &packets[2], now).is_none());
        assert!(reasm.receive(addr(), &packets[0], now).is_none());
        let done = reasm.receive(addr(), &packets[1], now).expect("now contiguous");
        assert_eq!(done.body, body);
    }

    #[test]
    fn duplicate_fragment_is_discarded() {
        let packets = packets_for(b"short");
        let mut reasm = Reassembler::new();
        let now = Instant::now();
        let first = reasm.receive(addr(), &packets[0], now);
        assert!(first.is_some());
        // Re-feeding the same (addr, pkt_id, seq) after completion starts a
        // fresh group (the old one was already removed on completion) —
        // verify within-one-group duplicates specifically:
        let mut reasm2 = Reassembler::new();
        let multi = packets_for(&vec![1u8; MAX_FRAGMENT_BODY + 1]);
        assert!(reasm2.receive(addr(), &multi[0], now).is_none());
        assert!(reasm2.receive(addr(), &multi[0], now).is_none(), "dup must not complete");
        assert_eq!(reasm2.pending_groups(), 1);
    }

    #[test]
    fn missing_fragment_never_delivers_and_expires() {
        let body = vec![1u8; MAX_FRAGMENT_BODY + 1];
        let packets = packets_for(&body);
        let mut reasm = Reassembler::new();
        let now = Instant::now();
        assert!(reasm.receive(addr(), &packets[0], now).is_none());
        // fragment 1 (the short terminal one) never arrives
        assert_eq!(reasm.pending_groups(), 1);
        reasm.expire(now + REASSEMBLY_TIMEOUT + Duration::from_millis(1));
        assert_eq!(reasm.pending_groups(), 0);
    }

    #[test]
    fn purge_peer_drops_only_that_peers_groups() {
        let a = addr();
        let b = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9001));
        let body = vec![1u8; MAX_FRAGMENT_BODY + 1];
        let packets = packets_for(&body);
        let mut reasm = Reassembler::new();
        let now = Instant::now();
        reasm.receive(a, &packets[0], now);
        reasm.receive(b, &packets[0], now);
        assert_eq!(reasm.pending_groups(), 2);
        reasm.purge_peer(a);
        assert_eq!(reasm.pending_groups(), 1);
    }
}
