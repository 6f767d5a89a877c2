//! C9 event loop for the authoritative ESP grid server: binds one
//! non-blocking `UdpSocket`, drains it once per iteration, and drives
//! [`esp_replication::Server`]'s periodic tasks (spec §4.9, §5, §6).

use std::{
    io::ErrorKind,
    net::{SocketAddr, UdpSocket},
    time::{Duration, Instant},
};

use anyhow::Context;
use clap::Parser;
use esp_replication::{config::Config, server::Server};
use tracing::{info, warn};

/// How long the socket read loop sleeps between poll attempts once it has
/// drained everything currently available (spec §4.9 `[ambient]`).
const IDLE_SLEEP: Duration = Duration::from_micros(10);

/// Largest datagram this server will ever read; matches the wire protocol's
/// own cap with headroom, so a malformed oversized read never truncates a
/// legitimate packet.
const RECV_BUF_LEN: usize = esp_proto::header::MAX_PACKET_LEN * 2;

#[derive(Debug, Parser)]
#[command(name = "esp-server", about = "Authoritative ESP grid server")]
struct Args {
    /// Address to bind the UDP socket to.
    #[arg(long, default_value = "0.0.0.0:7777")]
    bind: SocketAddr,

    /// Exit after this many seconds instead of running forever.
    #[arg(long)]
    duration: Option<u64>,

    /// Players required to seat before a room admits `EVENT`s (spec §4.6).
    #[arg(long, default_value_t = 4)]
    required_players: u8,

    /// Periodic broadcast rate in Hz (spec §4.6).
    #[arg(long, default_value_t = 21.0)]
    tick_hz: f64,

    /// Capacity of each room's rolling updates deque (spec §3/§4.6).
    #[arg(long, default_value_t = 10)]
    updates_window: usize,

    /// Increase log verbosity; repeatable (`-v`, `-vv`).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default_level = match verbose {
        0 => "esp_server=info,esp_replication=info,esp_proto=warn",
        1 => "esp_server=debug,esp_replication=debug,esp_proto=info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    if args.required_players == 0 {
        anyhow::bail!("--required-players must be at least 1");
    }
    if args.tick_hz <= 0.0 {
        anyhow::bail!("--tick-hz must be positive");
    }

    let socket = UdpSocket::bind(args.bind).with_context(|| format!("failed to bind {}", args.bind))?;
    socket.set_nonblocking(true).context("failed to set socket non-blocking")?;
    info!(bind = %args.bind, "esp-server listening");

    let config = Config {
        broadcast_hz: args.tick_hz,
        required_players: args.required_players,
        updates_window: args.updates_window,
        ..Config::default()
    };

    let loop_start = Instant::now();
    let deadline = args.duration.map(|secs| loop_start + Duration::from_secs(secs));
    let mut server = Server::new(config, loop_start);
    let mut buf = vec![0u8; RECV_BUF_LEN];

    loop {
        let now = Instant::now();
        if deadline.is_some_and(|d| now >= d) {
            info!("--duration elapsed, shutting down");
            return Ok(());
        }

        let mut drained_any = false;
        loop {
            match socket.recv_from(&mut buf) {
                Ok((len, peer)) => {
                    drained_any = true;
                    for (dest, bytes) in server.handle_datagram(peer, &buf[..len], now) {
                        send_or_warn(&socket, dest, &bytes);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!(?err, "socket read error");
                    break;
                }
            }
        }

        for (dest, bytes) in server.tick(now) {
            send_or_warn(&socket, dest, &bytes);
        }

        if !drained_any {
            std::thread::sleep(IDLE_SLEEP);
        }
    }
}

fn send_or_warn(socket: &UdpSocket, dest: SocketAddr, bytes: &[u8]) {
    if let Err(err) = socket.send_to(bytes, dest) {
        warn!(%dest, ?err, "failed to send datagram");
    }
}
