//! Sans-IO wire protocol for ESP: fixed header + typed bodies, fragment
//! reassembly, and the reliability layer's unacked-packet tracking.
//!
//! Nothing in this crate touches a socket. The event loop (in the
//! `esp-server`/`esp-client` binaries) owns the actual `UdpSocket` and
//! drives these pieces; this crate only knows how to turn bytes into
//! typed messages and back, and how to decide when to resend one.

pub mod body;
pub mod codec;
pub mod header;
pub mod ids;
pub mod reassembly;
pub mod reliability;

pub use ids::{LocalId, PacketId, PlayerId, RoomId, SeqNum, SnapshotId};
