//! Room/peer lifecycle, the tick-driven replication engine, and the
//! client-side state reconciler built on top of `esp_proto`'s sans-IO
//! wire protocol.
//!
//! [`server::Server`] and [`client_session::Client`] are the two sans-IO
//! facades the `esp-server`/`esp-client` binaries drive: neither touches a
//! socket, each just turns inbound bytes into outbound bytes.

pub mod client;
pub mod client_session;
pub mod colors;
pub mod config;
pub mod peers;
pub mod replication;
pub mod rooms;
pub mod rtt;
pub mod server;

pub use client::ClientGrid;
pub use client_session::Client;
pub use config::Config;
pub use server::Server;
