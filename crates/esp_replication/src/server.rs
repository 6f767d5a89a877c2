//! Wires the Peer Registry (C4), Room Manager (C5), Conflict Resolver
//! (C7), and Replication Engine (C6) together behind one sans-IO facade
//! driven by the event loop (C9, in the `esp-server` binary).
//!
//! Like `esp_proto`, nothing here touches a socket: [`Server::handle_datagram`]
//! takes the raw bytes of one inbound datagram and returns the raw bytes of
//! every outbound datagram it provokes; [`Server::tick`] does the same for
//! periodic work. The binary owns the actual `UdpSocket` and the timer loop.

use std::{
    net::SocketAddr,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use esp_proto::{
    body::{self, EVENT_TYPE_ACQUIRE},
    codec::{self, decode_packet},
    header::MsgType,
    ids::{LocalId, PacketId, PlayerId, RoomId, SnapshotId},
    reassembly::Reassembler,
    reliability::{self, Outbox},
};
use rand::{rngs::StdRng, SeedableRng};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    replication::{self, ReplicationAction},
    rooms::{AcquireOutcome, RoomTable},
};

/// One datagram the caller must send: destination address and raw bytes.
pub type Outgoing = (SocketAddr, Vec<u8>);

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// The authoritative server: every table spec §5 says the server owns,
/// behind no lock, because scheduling is single-threaded cooperative.
pub struct Server {
    config: Config,
    peers: crate::peers::PeerRegistry,
    rooms: RoomTable,
    reassembler: Reassembler,
    outbox: Outbox,
    next_pkt_id: u32,
    last_broadcast: Instant,
    rng: StdRng,
}

impl Server {
    #[must_use]
    pub fn new(config: Config, now: Instant) -> Self {
        Self::with_rng(config, now, StdRng::from_entropy())
    }

    /// Constructs a server with a caller-supplied RNG (for deterministic
    /// color-assignment in tests).
    #[must_use]
    pub fn with_rng(config: Config, now: Instant, rng: StdRng) -> Self {
        Self {
            config,
            peers: crate::peers::PeerRegistry::new(),
            rooms: RoomTable::new(),
            reassembler: Reassembler::new(),
            outbox: Outbox::new(),
            next_pkt_id: 0,
            last_broadcast: now,
            rng,
        }
    }

    fn alloc_pkt_id(&mut self) -> PacketId {
        let id = PacketId(self.next_pkt_id);
        self.next_pkt_id = self.next_pkt_id.wrapping_add(1);
        id
    }

    fn snapshot_id_for(&self, room_id: RoomId) -> SnapshotId {
        self.rooms.get(room_id).map_or(SnapshotId::default(), |r| r.snapshot_id)
    }

    /// Encodes `body` as `msg_type` addressed to `player_id` and appends
    /// every resulting fragment to `out`. [`MsgType::is_reliable`] selects
    /// between outbox-tracked (ACK-or-retransmit) and K-redundant
    /// fire-and-forget emission — the two modes are disjoint (spec §9).
    fn send(&mut self, player_id: PlayerId, msg_type: MsgType, body: &[u8], now: Instant, out: &mut Vec<Outgoing>) {
        let Some(peer) = self.peers.get(player_id) else {
            return;
        };
        let addr = peer.addr;
        let room_id = peer.room_id;
        let snapshot_id = self.snapshot_id_for(room_id);

        let pkt_id = self.alloc_pkt_id();
        let frag_count = codec::fragment_count(body.len());
        let start_seq = self.peers.get_mut(player_id).expect("checked above").reserve_seq_range(frag_count);
        let packets = codec::encode_message(msg_type, pkt_id, start_seq, snapshot_id, now_nanos(), body);

        for (i, bytes) in packets.into_iter().enumerate() {
            if msg_type.is_reliable() {
                let seq = esp_proto::ids::SeqNum(start_seq.0.wrapping_add(i as u32));
                self.outbox.track(player_id, seq, msg_type, bytes.clone(), now);
                out.push((addr, bytes));
            } else {
                for copy in reliability::k_redundant(&bytes, self.config.k_redundancy) {
                    out.push((addr, copy.to_vec()));
                }
            }
        }
    }

    /// Handles one inbound datagram, returning every outbound datagram it
    /// provokes (spec §2 "Control flow").
    pub fn handle_datagram(&mut self, addr: SocketAddr, bytes: &[u8], now: Instant) -> Vec<Outgoing> {
        let mut out = Vec::new();
        let packet = match decode_packet(bytes) {
            Ok(p) => p,
            Err(err) => {
                debug!(?err, "dropping malformed packet");
                return out;
            }
        };

        if packet.msg_type_raw == MsgType::TRANSPORT_ACK {
            if let Some(player_id) = self.peers.by_addr(addr).map(|p| p.player_id) {
                if let Ok(acked_seq) = body::decode_transport_ack(&packet.body) {
                    self.outbox.ack(player_id, esp_proto::ids::SeqNum(acked_seq));
                }
            }
            return out;
        }

        let is_init = packet.msg_type_raw == MsgType::Init.as_u8();
        if !is_init && self.peers.by_addr(addr).is_none() {
            debug!(%addr, "dropping non-INIT packet from unknown peer");
            return out;
        }

        let Some(reassembled) = self.reassembler.receive(addr, &packet, now) else {
            return out;
        };
        let Some(msg_type) = MsgType::from_u8(reassembled.msg_type_raw) else {
            return out;
        };

        self.dispatch(addr, msg_type, &reassembled.body, reassembled.snapshot_id, now, &mut out);
        out
    }

    #[allow(clippy::too_many_lines)]
    fn dispatch(&mut self, addr: SocketAddr, msg_type: MsgType, body: &[u8], client_snapshot_id: SnapshotId, now: Instant, out: &mut Vec<Outgoing>) {
        match msg_type {
            MsgType::Init => {
                let player_id = self.peers.init(addr, now);
                info!(%player_id, %addr, "player initialized");
                let peer = self.peers.get_mut(player_id).expect("just registered");
                let seq = peer.reserve_seq_range(1).0;
                let ack_body = body::encode_init_ack(seq, player_id);
                self.send(player_id, MsgType::InitAck, &ack_body, now, out);
            }
            MsgType::CreateRoom => {
                let Some(player_id) = self.peers.by_addr(addr).map(|p| p.player_id) else { return };
                let Ok(name) = body::decode_create_room(body) else { return };
                match self.rooms.create(name, player_id, self.config.updates_window) {
                    Ok(room_id) => {
                        info!(%room_id, %player_id, "room created");
                        let peer = self.peers.get_mut(player_id).expect("exists");
                        let seq = peer.reserve_seq_range(1).0;
                        let ack_body = body::encode_create_ack(seq, room_id);
                        self.send(player_id, MsgType::CreateAck, &ack_body, now, out);
                    }
                    Err(err) => debug!(?err, "create_room rejected"),
                }
            }
            MsgType::JoinRoom => {
                let Some(player_id) = self.peers.by_addr(addr).map(|p| p.player_id) else { return };
                let Ok(room_id) = body::decode_join_room(body) else { return };
                match self.rooms.join(room_id, player_id, self.config.required_players, &mut self.rng) {
                    Ok(local_id) => {
                        self.peers.set_room(player_id, room_id, local_id);
                        info!(%room_id, %player_id, %local_id, "player joined room");
                        self.fan_out_roster(room_id, MsgType::JoinAck, Some((player_id, local_id)), now, out);
                    }
                    Err(err) => debug!(?err, %room_id, "join_room rejected"),
                }
            }
            MsgType::LeaveRoom => {
                let Some(player_id) = self.peers.by_addr(addr).map(|p| p.player_id) else { return };
                let Some(peer) = self.peers.get(player_id) else { return };
                let room_id = peer.room_id;
                if room_id.is_lobby() {
                    return; // out-of-state request, spec §7
                }
                let (vacated, _destroyed) = self.rooms.leave(room_id, player_id);
                if vacated.is_some() {
                    self.peers.set_room(player_id, RoomId::LOBBY, LocalId::NONE);
                    info!(%room_id, %player_id, "player left room");
                    self.fan_out_roster(room_id, MsgType::LeaveAck, None, now, out);
                }
            }
            MsgType::ListRooms => {
                let Some(player_id) = self.peers.by_addr(addr).map(|p| p.player_id) else { return };
                let rooms = self.rooms.list();
                let peer = self.peers.get_mut(player_id).expect("exists");
                let seq = peer.reserve_seq_range(1).0;
                let ack_body = body::encode_list_rooms_ack(seq, &rooms);
                self.send(player_id, MsgType::ListRoomsAck, &ack_body, now, out);
            }
            MsgType::Event => {
                let Some(player_id) = self.peers.by_addr(addr).map(|p| p.player_id) else { return };
                let Ok((_event_type, room_id, local_id, cell_idx)) = body::decode_event(body) else { return };
                let Some(peer) = self.peers.get(player_id) else { return };
                if peer.room_id != room_id || peer.local_id != local_id || room_id.is_lobby() {
                    return; // out-of-state request, spec §7
                }
                self.handle_acquisition(room_id, local_id, cell_idx, now, out);
            }
            MsgType::UpdatesAck => {
                let Some(player_id) = self.peers.by_addr(addr).map(|p| p.player_id) else { return };
                let Ok(acked_seq) = body::decode_fragment_ack(body) else { return };
                self.outbox.ack(player_id, esp_proto::ids::SeqNum(acked_seq));
                self.reconcile_member(player_id, client_snapshot_id, now, out);
            }
            MsgType::SnapshotAck => {
                let Some(player_id) = self.peers.by_addr(addr).map(|p| p.player_id) else { return };
                let Ok(acked_seq) = body::decode_fragment_ack(body) else { return };
                self.outbox.ack(player_id, esp_proto::ids::SeqNum(acked_seq));
                let Some(peer) = self.peers.get(player_id) else { return };
                let room_id = peer.room_id;
                if room_id.is_lobby() {
                    return;
                }
                let Some(room) = self.rooms.get(room_id) else { return };
                if replication::snapshot_ack_action(room, client_snapshot_id) == ReplicationAction::SendSnapshot {
                    self.send_snapshot(player_id, now, out);
                }
            }
            MsgType::Disconnect => {
                let Some(player_id) = self.peers.by_addr(addr).map(|p| p.player_id) else { return };
                self.disconnect_player(player_id, now, out);
            }
            MsgType::InitAck | MsgType::CreateAck | MsgType::JoinAck | MsgType::LeaveAck | MsgType::ListRoomsAck | MsgType::Updates | MsgType::Snapshot => {
                // server-to-client only; never legitimately inbound.
                debug!(?msg_type, "dropping server-originated message type received from a client");
            }
        }
    }

    fn handle_acquisition(&mut self, room_id: RoomId, local_id: LocalId, cell_idx: u16, now: Instant, out: &mut Vec<Outgoing>) {
        let required = self.config.required_players;
        let Some(is_full) = self.rooms.get(room_id).map(|r| r.is_full(required)) else { return };

        if !is_full {
            // spec §4.6: rejected, requester-only, local_id=0, K-redundant.
            let event_body = body::encode_event(EVENT_TYPE_ACQUIRE, room_id, LocalId::NONE, cell_idx);
            if let Some(player_id) = self.player_for_seat(room_id, local_id) {
                self.send(player_id, MsgType::Event, &event_body, now, out);
            }
            return;
        }

        let Some(room) = self.rooms.get_mut(room_id) else { return };
        let outcome = room.acquire(local_id, cell_idx);
        let owner = match outcome {
            AcquireOutcome::OutOfRange => return,
            AcquireOutcome::Acquired => local_id,
            AcquireOutcome::AlreadyOwned(existing) => existing,
        };
        let members: Vec<PlayerId> = room.members().into_iter().map(|m| m.player_id).collect();
        let event_body = body::encode_event(EVENT_TYPE_ACQUIRE, room_id, owner, cell_idx);
        for player_id in members {
            self.send(player_id, MsgType::Event, &event_body, now, out);
        }
    }

    fn player_for_seat(&self, room_id: RoomId, local_id: LocalId) -> Option<PlayerId> {
        self.rooms
            .get(room_id)?
            .members()
            .into_iter()
            .find(|m| m.local_id == local_id)
            .map(|m| m.player_id)
    }

    /// Fans out a fresh `JOIN_ACK`/`LEAVE_ACK` roster to every member of
    /// `room_id`, K-redundantly (spec §4.5). For `JOIN_ACK`, `joiner` is
    /// `(player_id, their new local_id)` so that member specifically gets
    /// `your_local_id` filled in correctly; other members receive the same
    /// full roster body (spec §4.5 explicitly permits this instead of
    /// re-fragmenting a shorter body per-recipient — see `DESIGN.md`).
    fn fan_out_roster(&mut self, room_id: RoomId, msg_type: MsgType, joiner: Option<(PlayerId, LocalId)>, now: Instant, out: &mut Vec<Outgoing>) {
        let Some(room) = self.rooms.get(room_id) else { return };
        let members = room.members();
        let member_ids: Vec<PlayerId> = members.iter().map(|m| m.player_id).collect();

        for &player_id in &member_ids {
            let body_bytes = match msg_type {
                MsgType::JoinAck => {
                    let your_local_id = if Some(player_id) == joiner.map(|(p, _)| p) {
                        joiner.map_or(LocalId::NONE, |(_, l)| l)
                    } else {
                        members.iter().find(|m| m.player_id == player_id).map_or(LocalId::NONE, |m| m.local_id)
                    };
                    body::encode_join_ack(0, room_id, your_local_id, &members)
                }
                MsgType::LeaveAck => body::encode_leave_ack(0, &members),
                _ => unreachable!("fan_out_roster only used for JOIN_ACK/LEAVE_ACK"),
            };
            self.send(player_id, msg_type, &body_bytes, now, out);
        }
    }

    /// Called from `UPDATES_ACK`: decides whether the member needs a
    /// targeted catch-up `UPDATES` or a full `SNAPSHOT` (spec §4.6).
    fn reconcile_member(&mut self, player_id: PlayerId, client_snapshot_id: SnapshotId, now: Instant, out: &mut Vec<Outgoing>) {
        let Some(peer) = self.peers.get(player_id) else { return };
        let room_id = peer.room_id;
        if room_id.is_lobby() {
            return;
        }
        let Some(room) = self.rooms.get(room_id) else { return };
        match replication::catch_up(room, client_snapshot_id) {
            ReplicationAction::UpToDate => {}
            ReplicationAction::SendUpdates(entries) => {
                let updates_body = body::encode_updates(&entries);
                self.send(player_id, MsgType::Updates, &updates_body, now, out);
            }
            ReplicationAction::SendSnapshot => self.send_snapshot(player_id, now, out),
        }
    }

    fn send_snapshot(&mut self, player_id: PlayerId, now: Instant, out: &mut Vec<Outgoing>) {
        let Some(peer) = self.peers.get(player_id) else { return };
        let room_id = peer.room_id;
        let Some(room) = self.rooms.get(room_id) else { return };
        let grid_body = body::encode_snapshot(&room.grid);
        self.send(player_id, MsgType::Snapshot, &grid_body, now, out);
    }

    fn disconnect_player(&mut self, player_id: PlayerId, now: Instant, out: &mut Vec<Outgoing>) {
        if let Some(peer) = self.peers.get(player_id) {
            let room_id = peer.room_id;
            if !room_id.is_lobby() {
                let (_, _) = self.rooms.leave(room_id, player_id);
                self.fan_out_roster(room_id, MsgType::LeaveAck, None, now, out);
            }
        }
        if let Some(peer) = self.peers.get(player_id) {
            self.reassembler.purge_peer(peer.addr);
        }
        self.outbox.purge_peer(player_id);
        self.peers.remove(player_id);
        info!(%player_id, "player disconnected");
    }

    /// Drives every periodic task (spec §4.9 "Periodic tasks"): reliable
    /// retransmits, reassembly expiry, and the tick-rate broadcast.
    pub fn tick(&mut self, now: Instant) -> Vec<Outgoing> {
        let mut out = Vec::new();

        let (to_resend, abandoned) =
            self.outbox
                .due_for_retransmit(now, self.config.retransmit_timeout, self.config.retry_cap);
        for (player_id, bytes) in to_resend {
            if let Some(peer) = self.peers.get(player_id) {
                out.push((peer.addr, bytes));
            }
        }
        for giveup in abandoned {
            warn!(player_id = %giveup.player_id, msg_type = ?giveup.msg_type, "delivery abandoned, cleaning up peer");
            self.disconnect_player(giveup.player_id, now, &mut out);
        }

        self.reassembler.expire_after(now, self.config.reassembly_timeout);

        if now.duration_since(self.last_broadcast) >= self.config.broadcast_interval() {
            self.last_broadcast = now;
            self.broadcast_tick(now, &mut out);
        }

        out
    }

    fn broadcast_tick(&mut self, now: Instant, out: &mut Vec<Outgoing>) {
        let required = self.config.required_players;
        let k = self.config.k_redundancy;
        let mut targets: Vec<(Vec<PlayerId>, Vec<body::UpdateEntry>)> = Vec::new();
        for room in self.rooms.rooms_mut() {
            if !room.is_full(required) {
                continue;
            }
            let entries = replication::periodic_broadcast(room, k);
            if entries.is_empty() {
                continue;
            }
            let members: Vec<PlayerId> = room.members().into_iter().map(|m| m.player_id).collect();
            targets.push((members, entries));
        }
        for (members, entries) in targets {
            let updates_body = body::encode_updates(&entries);
            for player_id in members {
                self.send(player_id, MsgType::Updates, &updates_body, now, out);
            }
        }
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.list().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use esp_proto::codec::{decode_packet, encode_message};
    use esp_proto::ids::SeqNum;

    fn srv() -> (Server, Instant) {
        let now = Instant::now();
        (Server::with_rng(Config { required_players: 2, ..Config::default() }, now, StdRng::seed_from_u64(7)), now)
    }

    fn client_addr(port: u16) -> SocketAddr {
        SocketAddr::V4(std::net::SocketAddrV4::new(std::net::Ipv4Addr::LOCALHOST, port))
    }

    fn init_packet() -> Vec<u8> {
        encode_message(MsgType::Init, PacketId(0), SeqNum(1), SnapshotId(0), 0, &[]).remove(0)
    }

    #[test]
    fn init_handshake_assigns_distinct_player_ids() {
        let (mut server, now) = srv();
        let out1 = server.handle_datagram(client_addr(1), &init_packet(), now);
        assert_eq!(out1.len(), 1);
        let (_, ack_bytes) = &out1[0];
        let pkt = decode_packet(ack_bytes).unwrap();
        let (_, player_id) = body::decode_init_ack(&pkt.body).unwrap();
        assert_eq!(player_id, PlayerId(1));

        let out2 = server.handle_datagram(client_addr(2), &init_packet(), now);
        let pkt2 = decode_packet(&out2[0].1).unwrap();
        let (_, player_id2) = body::decode_init_ack(&pkt2.body).unwrap();
        assert_eq!(player_id2, PlayerId(2));
    }

    #[test]
    fn unknown_peer_non_init_is_dropped() {
        let (mut server, now) = srv();
        let list_rooms = encode_message(MsgType::ListRooms, PacketId(5), SeqNum(1), SnapshotId(0), 0, &[]).remove(0);
        let out = server.handle_datagram(client_addr(9), &list_rooms, now);
        assert!(out.is_empty());
    }
}
