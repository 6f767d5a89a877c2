//! End-to-end scenarios (spec §8) driving [`Server`] and [`Client`]
//! in-process, piping encoded bytes directly between them with no real
//! sockets — the same in-process-exchange style `aeronet_transport`'s own
//! integration tests use to drive two `Transport` halves against each other
//! without a socket in between.

use std::{
    collections::{HashSet, VecDeque},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::{Duration, Instant},
};

use esp_proto::{
    body::{self, MemberInfo},
    codec::{decode_packet, encode_message},
    header::MsgType,
    ids::{LocalId, PacketId, PlayerId, RoomId, SeqNum, SnapshotId},
    reassembly::Reassembler,
};
use esp_replication::{
    client_session::{Client, ClientEvent},
    config::Config,
    server::Server,
};
use rand::{rngs::StdRng, SeedableRng};

fn addr(port: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

enum QueueMsg {
    ToServer(SocketAddr, Vec<u8>),
    ToClient(SocketAddr, Vec<u8>),
}

/// Drives a [`Server`] and several [`Client`]s against each other without a
/// socket: every datagram either side would have sent is routed directly
/// to the other's `handle_datagram`, recursively, until the simulated
/// network goes quiet.
struct Harness {
    server: Server,
    clients: Vec<(SocketAddr, Client)>,
    now: Instant,
    muted: HashSet<SocketAddr>,
}

impl Harness {
    fn new(n_clients: usize, config: Config) -> Self {
        let now = Instant::now();
        let server = Server::with_rng(config, now, StdRng::seed_from_u64(1));
        let server_addr = addr(9999);
        let clients = (0..n_clients).map(|i| (addr(10_000 + i as u16), Client::new(server_addr))).collect();
        Self {
            server,
            clients,
            now,
            muted: HashSet::new(),
        }
    }

    fn index_of(&self, addr: SocketAddr) -> Option<usize> {
        self.clients.iter().position(|(a, _)| *a == addr)
    }

    fn advance(&mut self, dt: Duration) {
        self.now += dt;
    }

    fn mute(&mut self, idx: usize) {
        self.muted.insert(self.clients[idx].0);
    }

    fn unmute(&mut self, idx: usize) {
        self.muted.remove(&self.clients[idx].0);
    }

    /// Drains `queue` to quiescence, returning every application-visible
    /// event observed, tagged with the client index it happened to. A
    /// K-redundant send (spec §4.3) can complete the same logical message
    /// more than once on the receiving end, so callers should expect
    /// events to possibly repeat rather than assume exactly one per action.
    fn pump(&mut self, mut queue: VecDeque<QueueMsg>) -> Vec<(usize, ClientEvent)> {
        let mut events = Vec::new();
        let mut guard = 0u32;
        while let Some(msg) = queue.pop_front() {
            guard += 1;
            assert!(guard < 100_000, "simulated network did not converge");
            match msg {
                QueueMsg::ToServer(from, bytes) => {
                    for (dest, bytes) in self.server.handle_datagram(from, &bytes, self.now) {
                        queue.push_back(QueueMsg::ToClient(dest, bytes));
                    }
                }
                QueueMsg::ToClient(dest, bytes) => {
                    if self.muted.contains(&dest) {
                        continue;
                    }
                    let Some(idx) = self.index_of(dest) else { continue };
                    let (resp, event) = self.clients[idx].1.handle_datagram(&bytes, self.now);
                    if event != ClientEvent::None {
                        events.push((idx, event));
                    }
                    for bytes in resp {
                        queue.push_back(QueueMsg::ToServer(dest, bytes));
                    }
                }
            }
        }
        events
    }

    fn from_client(&mut self, idx: usize, packets: Vec<Vec<u8>>) -> Vec<(usize, ClientEvent)> {
        let from = self.clients[idx].0;
        let queue = packets.into_iter().map(|p| QueueMsg::ToServer(from, p)).collect();
        self.pump(queue)
    }

    /// Feeds several clients' outbound packets into one simulated network
    /// tick, in the given order — models simultaneous arrival at the
    /// server so the first action listed is the one the server observes
    /// first.
    fn batch(&mut self, actions: Vec<(usize, Vec<Vec<u8>>)>) -> Vec<(usize, ClientEvent)> {
        let mut queue = VecDeque::new();
        for (idx, packets) in actions {
            let from = self.clients[idx].0;
            queue.extend(packets.into_iter().map(|p| QueueMsg::ToServer(from, p)));
        }
        self.pump(queue)
    }

    fn server_tick(&mut self) -> Vec<(usize, ClientEvent)> {
        let out = self.server.tick(self.now);
        let queue = out.into_iter().map(|(dest, bytes)| QueueMsg::ToClient(dest, bytes)).collect();
        self.pump(queue)
    }

    fn connect(&mut self, idx: usize) -> Vec<(usize, ClientEvent)> {
        let out = self.clients[idx].1.connect(self.now);
        self.from_client(idx, out)
    }

    fn create_room(&mut self, idx: usize, name: &str) -> Vec<(usize, ClientEvent)> {
        let out = self.clients[idx].1.create_room(name, self.now);
        self.from_client(idx, out)
    }

    fn join_room(&mut self, idx: usize, room_id: RoomId) -> Vec<(usize, ClientEvent)> {
        let out = self.clients[idx].1.join_room(room_id, self.now);
        self.from_client(idx, out)
    }

    fn request_cell(&mut self, idx: usize, cell_idx: u16) -> Vec<Vec<u8>> {
        self.clients[idx].1.request_cell(cell_idx, self.now)
    }

    fn disconnect(&mut self, idx: usize) -> Vec<(usize, ClientEvent)> {
        let out = self.clients[idx].1.disconnect(self.now);
        self.from_client(idx, out)
    }
}

fn only_room_created(events: &[(usize, ClientEvent)]) -> RoomId {
    events
        .iter()
        .find_map(|(_, e)| match e {
            ClientEvent::RoomCreated(id) => Some(*id),
            _ => None,
        })
        .expect("CREATE_ACK observed")
}

// (a) INIT handshake assigns distinct player_ids to independently
// connecting clients (spec §4.4, §8).
#[test]
fn init_handshake_assigns_distinct_player_ids() {
    let mut h = Harness::new(2, Config::default());

    let events0 = h.connect(0);
    assert!(matches!(events0.as_slice(), [(0, ClientEvent::Connected(_))]));
    let events1 = h.connect(1);
    assert!(matches!(events1.as_slice(), [(1, ClientEvent::Connected(_))]));

    assert_eq!(h.clients[0].1.player_id(), Some(PlayerId(1)));
    assert_eq!(h.clients[1].1.player_id(), Some(PlayerId(2)));
    assert_ne!(h.clients[0].1.player_id(), h.clients[1].1.player_id());
}

// (b) a single room fills with its required player count and a cell
// acquisition propagates to every seated member (spec §4.5, §4.7, §8).
#[test]
fn four_players_fill_a_room_and_see_a_shared_acquisition() {
    let mut h = Harness::new(4, Config::default());
    for i in 0..4 {
        h.connect(i);
    }

    let room_id = only_room_created(&h.create_room(0, "arena"));

    for i in 0..4 {
        let events = h.join_room(i, room_id);
        let expected_local_id = LocalId((i + 1) as u8);
        assert!(
            events.iter().any(|(idx, e)| *idx == i && matches!(e, ClientEvent::Joined(r, l) if *r == room_id && *l == expected_local_id)),
            "client {i} observes its own JOIN_ACK with local_id {expected_local_id:?}"
        );
    }

    // room is now full (4/4): client 1 (local_id 2) claims cell 37.
    let out = h.request_cell(1, 37);
    assert!(!out.is_empty(), "request_cell must actually send when the cell is free");
    h.from_client(1, out);

    for i in 0..4 {
        assert_eq!(h.clients[i].1.grid.cells[37], 2, "client {i} converges to local_id 2 owning cell 37");
    }
}

// (c) two members race for the same cell; first-writer-wins, and the
// loser's pending request is resolved by the EVENT reflecting the actual
// owner rather than retried (spec §4.7, §8).
#[test]
fn conflicting_acquisitions_resolve_first_writer_wins() {
    let mut h = Harness::new(3, Config {
        required_players: 3,
        ..Config::default()
    });
    for i in 0..3 {
        h.connect(i);
    }
    let room_id = only_room_created(&h.create_room(0, "arena"));
    for i in 0..3 {
        h.join_room(i, room_id);
    }

    // client 1 (local_id 2) and client 2 (local_id 3) both want cell 100;
    // batch them in that order so the server observes client 1 first.
    let first = h.request_cell(1, 100);
    let second = h.request_cell(2, 100);
    assert!(h.clients[1].1.grid.is_pending(100));
    assert!(h.clients[2].1.grid.is_pending(100));
    h.batch(vec![(1, first), (2, second)]);

    for i in 0..3 {
        assert_eq!(h.clients[i].1.grid.cells[100], 2, "client {i} sees local_id 2 as the winner");
    }
    assert!(!h.clients[2].1.grid.is_pending(100), "the loser's pending request clears once the EVENT reflects the real owner");
}

// (d) a member who misses every delta falls far enough behind that the
// server promotes its next catch-up to a full SNAPSHOT instead of a
// partial UPDATES it could not safely apply (spec §4.6, §9, §8).
#[test]
fn lagging_member_is_promoted_from_updates_to_snapshot() {
    let mut h = Harness::new(2, Config {
        required_players: 2,
        updates_window: 10,
        ..Config::default()
    });
    h.connect(0);
    h.connect(1);
    let room_id = only_room_created(&h.create_room(0, "arena"));
    h.join_room(0, room_id);
    h.join_room(1, room_id);

    // client 1 goes dark: every EVENT broadcast from here on is dropped
    // before it reaches their socket.
    h.mute(1);

    for cell in 0..20u16 {
        let out = h.request_cell(0, cell);
        h.from_client(0, out);
    }
    assert_eq!(h.clients[0].1.grid.snapshot_id, SnapshotId(20));
    assert_eq!(h.clients[1].1.grid.snapshot_id, SnapshotId(0), "muted client observed nothing");

    // client 1 comes back; the next periodic broadcast only carries the
    // last k entries, which cannot cover a 20-event gap against a
    // 10-entry window, so the server must fall back to SNAPSHOT.
    h.unmute(1);
    h.advance(Duration::from_secs_f64(1.0 / Config::default().broadcast_hz) + Duration::from_millis(1));
    h.server_tick();

    assert_eq!(h.clients[1].1.grid.snapshot_id, SnapshotId(20), "SNAPSHOT caught the lagging client all the way up");
    for cell in 0..20u16 {
        assert_eq!(h.clients[1].1.grid.cells[cell as usize], 1, "reconciled grid matches the authoritative one");
    }
}

// (e) a JOIN_ACK roster large enough to exceed one fragment's body still
// reassembles into the exact original roster on the receiving end (spec
// §4.2, §4.5, §8).
#[test]
fn oversized_join_ack_roster_reassembles_across_fragments() {
    let members: Vec<MemberInfo> = (0..200u32)
        .map(|i| MemberInfo {
            player_id: PlayerId(i + 1),
            local_id: LocalId((i % 255) as u8),
            color: (i as u8, (i * 3) as u8, (i * 7) as u8),
        })
        .collect();
    let body_bytes = body::encode_join_ack(1, RoomId(1), LocalId(5), &members);

    let packets = encode_message(MsgType::JoinAck, PacketId(0), SeqNum(1), SnapshotId(0), 0, &body_bytes);
    assert!(packets.len() > 1, "200 members must not fit in a single fragment");

    let from = addr(1);
    let mut reasm = Reassembler::new();
    let now = Instant::now();
    let mut reassembled = None;
    for raw in &packets {
        let packet = decode_packet(raw).expect("well-formed fragment");
        reassembled = reasm.receive(from, &packet, now);
    }
    let reassembled = reassembled.expect("completes once every fragment has arrived");
    let (_, room_id, your_local_id, decoded_members) = body::decode_join_ack(&reassembled.body).unwrap();
    assert_eq!(room_id, RoomId(1));
    assert_eq!(your_local_id, LocalId(5));
    assert_eq!(decoded_members, members);
}

// (f) a graceful disconnect vacates the seat, fans a fresh roster out to
// whoever remains, and purges the departed peer's server-side state
// (spec §4.4, §4.5, §8).
#[test]
fn disconnect_vacates_seat_and_notifies_remaining_member() {
    let mut h = Harness::new(2, Config {
        required_players: 2,
        ..Config::default()
    });
    h.connect(0);
    h.connect(1);
    let room_id = only_room_created(&h.create_room(0, "arena"));
    h.join_room(0, room_id);
    h.join_room(1, room_id);
    assert_eq!(h.server.peer_count(), 2);

    let events = h.disconnect(0);
    assert!(events.iter().any(|(idx, e)| *idx == 1 && matches!(e, ClientEvent::Left)), "the remaining member is notified");

    assert_eq!(h.server.peer_count(), 1, "the disconnecting peer's server-side state is purged");
    assert_eq!(h.clients[1].1.room_id(), room_id, "the remaining member is still seated");
}
