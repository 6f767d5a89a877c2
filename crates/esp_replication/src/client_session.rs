//! Wire-facing wrapper around [`ClientGrid`] (C8), the client-side half of
//! the sans-IO facade that [`crate::server::Server`] provides on the other
//! end, driven by the event loop in the `esp-client` binary (C9).
//!
//! Unlike [`crate::server::Server`], a [`Client`] talks to exactly one peer
//! (the server), so there is no [`crate::peers::PeerRegistry`] — just one
//! fragment sequence counter, one [`Outbox`], and one [`Reassembler`].

use std::{
    net::SocketAddr,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use esp_proto::{
    body,
    codec::{self, decode_packet},
    header::MsgType,
    ids::{LocalId, PacketId, PlayerId, RoomId, SeqNum},
    reassembly::Reassembler,
    reliability::{self, Outbox, K_REDUNDANCY, RETRANSMIT_TIMEOUT, RETRY_CAP},
};
use tracing::{debug, info, warn};

use crate::{client::ClientGrid, rtt::RttEstimator};

/// Raw bytes of one outbound datagram; the caller always knows the
/// destination (there is only ever one: the server the [`Client`] was
/// constructed with).
pub type Outgoing = Vec<u8>;

/// The key every tracked send is filed under in [`Client`]'s [`Outbox`].
/// A client has exactly one correspondent, so the `PlayerId` half of the
/// `(SeqNum, PlayerId)` key the type was designed for is irrelevant here;
/// any fixed value works.
const SERVER: PlayerId = PlayerId::NONE;

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// What happened as a result of feeding in one inbound datagram, for the
/// event loop to log or act on beyond just the raw bytes to send back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Nothing application-visible happened (e.g. a duplicate fragment, a
    /// plain ACK, or a still-incomplete reassembly group).
    None,
    /// `INIT_ACK`: the server assigned us this identity.
    Connected(PlayerId),
    /// `CREATE_ACK`: a room we asked for now exists.
    RoomCreated(RoomId),
    /// `JOIN_ACK` naming us among the roster: we are now seated.
    Joined(RoomId, LocalId),
    /// `LEAVE_ACK` naming us as no longer in the roster.
    Left,
    /// `LIST_ROOMS_ACK`.
    RoomList(Vec<body::RoomSummary>),
}

/// The client-side runtime: identity, current room seat, and the
/// reconciled grid, wrapped with the fragmentation/reliability machinery
/// needed to actually talk to [`crate::server::Server`] over a socket.
pub struct Client {
    server_addr: SocketAddr,
    player_id: PlayerId,
    room_id: RoomId,
    local_id: LocalId,
    pub grid: ClientGrid,
    reassembler: Reassembler,
    outbox: Outbox,
    next_pkt_id: u32,
    next_seq: SeqNum,
    rtt: RttEstimator,
    init_sent_at: Option<Instant>,
}

impl Client {
    #[must_use]
    pub fn new(server_addr: SocketAddr) -> Self {
        Self {
            server_addr,
            player_id: PlayerId::NONE,
            room_id: RoomId::LOBBY,
            local_id: LocalId::NONE,
            grid: ClientGrid::new(),
            reassembler: Reassembler::new(),
            outbox: Outbox::new(),
            next_pkt_id: 0,
            next_seq: SeqNum(1),
            rtt: RttEstimator::new(),
            init_sent_at: None,
        }
    }

    #[must_use]
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// `None` until `INIT_ACK` has been received (spec §4.4).
    #[must_use]
    pub fn player_id(&self) -> Option<PlayerId> {
        (!self.player_id.is_none()).then_some(self.player_id)
    }

    #[must_use]
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    #[must_use]
    pub fn local_id(&self) -> LocalId {
        self.local_id
    }

    /// Diagnostic-only round-trip estimate from the `INIT`/`INIT_ACK`
    /// handshake (spec §4.4 `[supplement]`; see `DESIGN.md`).
    #[must_use]
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt.get()
    }

    fn alloc_pkt_id(&mut self) -> PacketId {
        let id = PacketId(self.next_pkt_id);
        self.next_pkt_id = self.next_pkt_id.wrapping_add(1);
        id
    }

    fn reserve_seq_range(&mut self, count: usize) -> SeqNum {
        let start = self.next_seq;
        self.next_seq = SeqNum(self.next_seq.0.wrapping_add(count as u32));
        start
    }

    /// Encodes `body` as `msg_type` to the server and appends every
    /// resulting fragment to `out`, choosing tracked-reliable or
    /// K-redundant emission the same way [`crate::server::Server::send`]
    /// does (spec §9).
    fn send(&mut self, msg_type: MsgType, body: &[u8], now: Instant, out: &mut Vec<Outgoing>) {
        let pkt_id = self.alloc_pkt_id();
        let frag_count = codec::fragment_count(body.len());
        let start_seq = self.reserve_seq_range(frag_count);
        let packets = codec::encode_message(msg_type, pkt_id, start_seq, self.grid.snapshot_id, now_nanos(), body);

        for (i, bytes) in packets.into_iter().enumerate() {
            if msg_type.is_reliable() {
                let seq = SeqNum(start_seq.0.wrapping_add(i as u32));
                self.outbox.track(SERVER, seq, msg_type, bytes.clone(), now);
                out.push(bytes);
            } else {
                for copy in reliability::k_redundant(&bytes, K_REDUNDANCY) {
                    out.push(copy.to_vec());
                }
            }
        }
    }

    /// `INIT`: requests a `player_id` from the server (spec §4.4).
    pub fn connect(&mut self, now: Instant) -> Vec<Outgoing> {
        let mut out = Vec::new();
        self.init_sent_at = Some(now);
        self.send(MsgType::Init, &[], now, &mut out);
        out
    }

    pub fn create_room(&mut self, name: &str, now: Instant) -> Vec<Outgoing> {
        let mut out = Vec::new();
        let body_bytes = body::encode_create_room(name);
        self.send(MsgType::CreateRoom, &body_bytes, now, &mut out);
        out
    }

    pub fn join_room(&mut self, room_id: RoomId, now: Instant) -> Vec<Outgoing> {
        let mut out = Vec::new();
        let body_bytes = body::encode_join_room(room_id);
        self.send(MsgType::JoinRoom, &body_bytes, now, &mut out);
        out
    }

    pub fn leave_room(&mut self, now: Instant) -> Vec<Outgoing> {
        let mut out = Vec::new();
        self.send(MsgType::LeaveRoom, &[], now, &mut out);
        out
    }

    pub fn list_rooms(&mut self, now: Instant) -> Vec<Outgoing> {
        let mut out = Vec::new();
        self.send(MsgType::ListRooms, &[], now, &mut out);
        out
    }

    /// Requests acquisition of `cell_idx`, if the local grid shows it empty
    /// and it is not already pending (spec §3 "Pending Cell Request",
    /// §4.7/§4.8). A no-op (no bytes emitted) otherwise.
    pub fn request_cell(&mut self, cell_idx: u16, now: Instant) -> Vec<Outgoing> {
        let mut out = Vec::new();
        if self.grid.request_cell(cell_idx, now) {
            self.emit_acquire_event(cell_idx, now, &mut out);
        }
        out
    }

    fn emit_acquire_event(&mut self, cell_idx: u16, now: Instant, out: &mut Vec<Outgoing>) {
        let body_bytes = body::encode_event(body::EVENT_TYPE_ACQUIRE, self.room_id, self.local_id, cell_idx);
        self.send(MsgType::Event, &body_bytes, now, out);
    }

    pub fn disconnect(&mut self, now: Instant) -> Vec<Outgoing> {
        let mut out = Vec::new();
        self.send(MsgType::Disconnect, &[], now, &mut out);
        out
    }

    /// Handles one inbound datagram from the server, returning every
    /// outbound datagram it provokes (acks, mostly) alongside the
    /// application-visible [`ClientEvent`], if any.
    pub fn handle_datagram(&mut self, bytes: &[u8], now: Instant) -> (Vec<Outgoing>, ClientEvent) {
        let mut out = Vec::new();
        let packet = match decode_packet(bytes) {
            Ok(p) => p,
            Err(err) => {
                debug!(?err, "dropping malformed packet");
                return (out, ClientEvent::None);
            }
        };

        if packet.msg_type_raw == MsgType::TRANSPORT_ACK {
            if let Ok(acked_seq) = body::decode_transport_ack(&packet.body) {
                self.outbox.ack(SERVER, SeqNum(acked_seq));
            }
            return (out, ClientEvent::None);
        }

        let Some(reassembled) = self.reassembler.receive(self.server_addr, &packet, now) else {
            return (out, ClientEvent::None);
        };
        let Some(msg_type) = MsgType::from_u8(reassembled.msg_type_raw) else {
            return (out, ClientEvent::None);
        };

        // Every fragment of a reliable message is ACKed individually — the
        // server's outbox tracks one seq per fragment (spec §4.8).
        for seq in &reassembled.seqs {
            self.ack_fragment(msg_type, seq.0, now, &mut out);
        }

        let event = self.apply(msg_type, &reassembled.body, reassembled.snapshot_id, now);
        (out, event)
    }

    /// ACKs one fragment of an inbound reliable message (spec §4.3/§4.8).
    /// `InitAck`/`CreateAck`/`ListRoomsAck` have no dedicated ack message of
    /// their own, so they get the transport-internal pseudo-ack instead of
    /// a typed `*_ACK`; ACKs are themselves untracked, fire-and-forget.
    fn ack_fragment(&mut self, msg_type: MsgType, seq: u32, now: Instant, out: &mut Vec<Outgoing>) {
        let ack_body = body::encode_fragment_ack(seq);
        match msg_type {
            MsgType::InitAck | MsgType::CreateAck | MsgType::ListRoomsAck => {
                let pkt_id = self.alloc_pkt_id();
                let ack_seq = self.reserve_seq_range(1);
                let packet = codec::encode_transport_ack_packet(pkt_id, ack_seq, now_nanos(), &ack_body);
                out.push(packet);
            }
            MsgType::Updates => self.send(MsgType::UpdatesAck, &ack_body, now, out),
            MsgType::Snapshot => self.send(MsgType::SnapshotAck, &ack_body, now, out),
            _ => {}
        }
    }

    fn apply(&mut self, msg_type: MsgType, body: &[u8], server_snapshot_id: esp_proto::ids::SnapshotId, now: Instant) -> ClientEvent {
        match msg_type {
            MsgType::InitAck => {
                let Ok((_seq, player_id)) = body::decode_init_ack(body) else { return ClientEvent::None };
                self.player_id = player_id;
                if let Some(sent_at) = self.init_sent_at.take() {
                    self.rtt.observe(now.duration_since(sent_at));
                }
                info!(%player_id, "connected");
                ClientEvent::Connected(player_id)
            }
            MsgType::CreateAck => {
                let Ok((_seq, room_id)) = body::decode_create_ack(body) else { return ClientEvent::None };
                info!(%room_id, "room created");
                ClientEvent::RoomCreated(room_id)
            }
            MsgType::JoinAck => {
                let Ok((_seq, room_id, your_local_id, _members)) = body::decode_join_ack(body) else { return ClientEvent::None };
                self.room_id = room_id;
                self.local_id = your_local_id;
                info!(%room_id, %your_local_id, "joined room");
                ClientEvent::Joined(room_id, your_local_id)
            }
            MsgType::LeaveAck => {
                let Ok((_seq, members)) = body::decode_leave_ack(body) else { return ClientEvent::None };
                let still_seated = self.player_id().is_some_and(|id| members.iter().any(|m| m.player_id == id));
                if !still_seated {
                    self.room_id = RoomId::LOBBY;
                    self.local_id = LocalId::NONE;
                }
                info!("left room");
                ClientEvent::Left
            }
            MsgType::ListRoomsAck => {
                let Ok((_seq, rooms)) = body::decode_list_rooms_ack(body) else { return ClientEvent::None };
                ClientEvent::RoomList(rooms)
            }
            MsgType::Event => {
                let Ok((_event_type, room_id, local_id, cell_idx)) = body::decode_event(body) else { return ClientEvent::None };
                if room_id == self.room_id {
                    self.grid.apply_event(cell_idx, local_id, server_snapshot_id);
                }
                ClientEvent::None
            }
            MsgType::Updates => {
                let Ok(entries) = body::decode_updates(body) else { return ClientEvent::None };
                self.grid.apply_updates(&entries, server_snapshot_id);
                ClientEvent::None
            }
            MsgType::Snapshot => {
                let Ok(grid) = body::decode_snapshot(body) else { return ClientEvent::None };
                self.grid.apply_snapshot(grid, server_snapshot_id);
                ClientEvent::None
            }
            _ => {
                debug!(?msg_type, "dropping client-originated message type received from the server");
                ClientEvent::None
            }
        }
    }

    /// Drives periodic client-side work (spec §4.8/§4.9): reliable
    /// retransmits and re-requesting cells that timed out waiting for an
    /// `EVENT` reply.
    pub fn tick(&mut self, now: Instant) -> Vec<Outgoing> {
        let mut out = Vec::new();

        let (to_resend, abandoned) = self.outbox.due_for_retransmit(now, RETRANSMIT_TIMEOUT, RETRY_CAP);
        for (_, bytes) in to_resend {
            out.push(bytes);
        }
        for giveup in abandoned {
            warn!(msg_type = ?giveup.msg_type, "server did not ack a reliable send within the retry cap");
        }

        self.reassembler.expire(now);

        for cell_idx in self.grid.cells_to_retry(now) {
            self.emit_acquire_event(cell_idx, now, &mut out);
        }

        out
    }
}
