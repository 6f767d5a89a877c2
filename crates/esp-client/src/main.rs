//! C9 event loop for the ESP grid client: binds one non-blocking
//! `UdpSocket` talking to a single server, and drives
//! [`esp_replication::Client`] (C8)'s reconciliation and periodic retries
//! (spec §4.8, §4.9, §5, §6).
//!
//! The graphical client is an explicit external collaborator (spec §1) —
//! this binary is the minimal driver that exercises the same reconciler:
//! it connects, lists rooms, creates-or-joins one, and then claims random
//! empty cells at a fixed cadence, logging every state transition instead
//! of rendering them.

use std::{
    io::ErrorKind,
    net::{SocketAddr, UdpSocket},
    time::{Duration, Instant},
};

use anyhow::Context;
use clap::Parser;
use esp_proto::body::GRID_CELLS;
use esp_replication::client_session::{Client, ClientEvent};
use rand::Rng;
use tracing::{debug, info, warn};

/// How long the socket read loop sleeps between poll attempts once it has
/// drained everything currently available (spec §4.9: "≈ 10 ms for
/// client").
const IDLE_SLEEP: Duration = Duration::from_millis(10);

/// How often the auto-play loop attempts to claim a random empty cell
/// once seated in a room. Purely a demo-driver cadence, not part of the
/// protocol.
const CLAIM_INTERVAL: Duration = Duration::from_millis(300);

const RECV_BUF_LEN: usize = esp_proto::header::MAX_PACKET_LEN * 2;

#[derive(Debug, Parser)]
#[command(name = "esp-client", about = "ESP grid client runtime")]
struct Args {
    /// Address of the `esp-server` to connect to.
    #[arg(long, default_value = "127.0.0.1:7777")]
    server: SocketAddr,

    /// Exit after this many seconds instead of running forever.
    #[arg(long)]
    duration: Option<u64>,

    /// Room name to create if `LIST_ROOMS` comes back empty.
    #[arg(long, default_value = "arena")]
    room_name: String,

    /// Increase log verbosity; repeatable (`-v`, `-vv`).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default_level = match verbose {
        0 => "esp_client=info,esp_replication=info,esp_proto=warn",
        1 => "esp_client=debug,esp_replication=debug,esp_proto=info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Demo auto-play state machine layered over [`Client`]'s protocol state,
/// tracking only what the driver needs to decide its next action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlayState {
    Connecting,
    AwaitingRoomList,
    /// We asked to create or join a room and are waiting for the ack.
    JoiningRoom,
    Seated,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    let socket = UdpSocket::bind("0.0.0.0:0").context("failed to bind client socket")?;
    socket.set_nonblocking(true).context("failed to set socket non-blocking")?;
    info!(server = %args.server, local = ?socket.local_addr().ok(), "esp-client starting");

    let loop_start = Instant::now();
    let deadline = args.duration.map(|secs| loop_start + Duration::from_secs(secs));

    let mut client = Client::new(args.server);
    let mut rng = rand::thread_rng();
    let mut buf = vec![0u8; RECV_BUF_LEN];
    let mut state = PlayState::Connecting;
    let mut last_claim = loop_start;

    for packet in client.connect(loop_start) {
        send_or_warn(&socket, args.server, &packet);
    }

    loop {
        let now = Instant::now();
        if deadline.is_some_and(|d| now >= d) {
            info!("--duration elapsed, disconnecting");
            for packet in client.disconnect(now) {
                send_or_warn(&socket, args.server, &packet);
            }
            return Ok(());
        }

        let mut drained_any = false;
        loop {
            match socket.recv_from(&mut buf) {
                Ok((len, from)) if from == args.server => {
                    drained_any = true;
                    let (outgoing, event) = client.handle_datagram(&buf[..len], now);
                    for packet in outgoing {
                        send_or_warn(&socket, args.server, &packet);
                    }
                    state = react(&mut client, event, state, &args.room_name, now, &socket, args.server);
                }
                Ok((_, from)) => debug!(%from, "dropping datagram from unexpected sender"),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(?err, "socket read error");
                    break;
                }
            }
        }

        for packet in client.tick(now) {
            send_or_warn(&socket, args.server, &packet);
        }

        if state == PlayState::Seated && now.duration_since(last_claim) >= CLAIM_INTERVAL {
            last_claim = now;
            if let Some(cell_idx) = random_empty_cell(&client, &mut rng) {
                for packet in client.request_cell(cell_idx, now) {
                    send_or_warn(&socket, args.server, &packet);
                }
            }
        }

        if !drained_any {
            std::thread::sleep(IDLE_SLEEP);
        }
    }
}

/// Reacts to one application-visible [`ClientEvent`], advancing the demo
/// driver's own [`PlayState`] and issuing the next request, if any.
fn react(client: &mut Client, event: ClientEvent, state: PlayState, room_name: &str, now: Instant, socket: &UdpSocket, server: SocketAddr) -> PlayState {
    match event {
        ClientEvent::Connected(player_id) => {
            info!(%player_id, "connected, requesting room list");
            for packet in client.list_rooms(now) {
                send_or_warn(socket, server, &packet);
            }
            PlayState::AwaitingRoomList
        }
        ClientEvent::RoomList(rooms) if state == PlayState::AwaitingRoomList => {
            if let Some(room) = rooms.first() {
                info!(room_id = %room.room_id, "joining existing room");
                for packet in client.join_room(room.room_id, now) {
                    send_or_warn(socket, server, &packet);
                }
            } else {
                info!(name = room_name, "no rooms yet, creating one");
                for packet in client.create_room(room_name, now) {
                    send_or_warn(socket, server, &packet);
                }
            }
            PlayState::JoiningRoom
        }
        ClientEvent::RoomCreated(room_id) => {
            info!(%room_id, "room created, joining it");
            for packet in client.join_room(room_id, now) {
                send_or_warn(socket, server, &packet);
            }
            PlayState::JoiningRoom
        }
        ClientEvent::Joined(room_id, local_id) => {
            info!(%room_id, %local_id, "seated, starting to claim cells");
            PlayState::Seated
        }
        ClientEvent::Left => {
            info!("left room, back to lobby");
            PlayState::Connecting
        }
        _ => state,
    }
}

/// Picks a uniformly random unowned cell, if any remain (spec §3 "Pending
/// Cell Request": never request a cell the local grid already shows
/// occupied).
fn random_empty_cell(client: &Client, rng: &mut impl Rng) -> Option<u16> {
    let empty: Vec<u16> = (0..GRID_CELLS as u16)
        .filter(|&idx| client.grid.cells[idx as usize] == 0 && !client.grid.is_pending(idx))
        .collect();
    if empty.is_empty() {
        return None;
    }
    Some(empty[rng.gen_range(0..empty.len())])
}

fn send_or_warn(socket: &UdpSocket, dest: SocketAddr, bytes: &[u8]) {
    if let Err(err) = socket.send_to(bytes, dest) {
        warn!(%dest, ?err, "failed to send datagram");
    }
}
