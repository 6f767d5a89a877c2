//! C3: per-peer sequencing, the unacknowledged-packet table with
//! retransmit/retry-cap, and the disjoint K-redundant fire-and-forget mode.
//!
//! Reliable and K-redundant sends never overlap for the same packet: a send
//! either gets a slot in the unacked table (and is retransmitted on
//! timeout) or is blasted out `K` times with no tracking state retained —
//! never both (spec §9, "redundancy versus reliability").

use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::{
    header::MsgType,
    ids::{PlayerId, SeqNum},
};

/// How long to wait for an ACK before retransmitting (spec §4.3/§5).
pub const RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Number of retransmit attempts before declaring delivery abandoned.
pub const RETRY_CAP: u32 = 5;

/// Number of repeated sends for a K-redundant (fire-and-forget) message.
pub const K_REDUNDANCY: usize = 3;

struct UnackedEntry {
    bytes: Vec<u8>,
    last_send: Instant,
    send_count: u32,
    msg_type: MsgType,
}

/// A reliable send whose retry cap was reached without an ACK. The owning
/// component (spec §4.3/§4.4) decides what to do — typically peer cleanup.
#[derive(Debug, Clone, Copy)]
pub struct Abandoned {
    pub player_id: PlayerId,
    pub seq_num: SeqNum,
    pub msg_type: MsgType,
}

/// Tracks every in-flight reliable send. One instance lives on the sending
/// endpoint (the server owns one; a client, talking to a single peer, also
/// owns one).
#[derive(Default)]
pub struct Outbox {
    entries: AHashMap<(SeqNum, PlayerId), UnackedEntry>,
}

impl Outbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a packet that was just transmitted reliably, so it can be
    /// retransmitted until acknowledged or abandoned.
    pub fn track(&mut self, player_id: PlayerId, seq_num: SeqNum, msg_type: MsgType, bytes: Vec<u8>, now: Instant) {
        self.entries.insert(
            (seq_num, player_id),
            UnackedEntry {
                bytes,
                last_send: now,
                send_count: 1,
                msg_type,
            },
        );
    }

    /// Clears the entry for `(seq_num, player_id)` if present. Returns
    /// `true` if an entry was actually cleared; acking an already-cleared or
    /// unknown sequence is a silent no-op (idempotence, spec §4.3/§8).
    pub fn ack(&mut self, player_id: PlayerId, seq_num: SeqNum) -> bool {
        self.entries.remove(&(seq_num, player_id)).is_some()
    }

    /// Clears every tracked entry for `player_id` (peer cleanup).
    pub fn purge_peer(&mut self, player_id: PlayerId) {
        self.entries.retain(|(_, pid), _| *pid != player_id);
    }

    /// Scans for entries due for retransmit or abandonment. Returns the raw
    /// bytes to resend (caller is responsible for actually writing them to
    /// the socket) and any entries that just crossed the retry cap. `timeout`
    /// and `retry_cap` are normally [`RETRANSMIT_TIMEOUT`]/[`RETRY_CAP`], but
    /// callers may pass a [`crate`]-external config override (spec §6).
    pub fn due_for_retransmit(
        &mut self,
        now: Instant,
        timeout: Duration,
        retry_cap: u32,
    ) -> (Vec<(PlayerId, Vec<u8>)>, Vec<Abandoned>) {
        let mut to_resend = Vec::new();
        let mut abandoned = Vec::new();
        let mut drop_keys = Vec::new();

        for (&(seq_num, player_id), entry) in &mut self.entries {
            if now.duration_since(entry.last_send) < timeout {
                continue;
            }
            if entry.send_count >= retry_cap {
                drop_keys.push((seq_num, player_id));
                abandoned.push(Abandoned {
                    player_id,
                    seq_num,
                    msg_type: entry.msg_type,
                });
                continue;
            }
            entry.send_count += 1;
            entry.last_send = now;
            to_resend.push((player_id, entry.bytes.clone()));
        }

        for key in drop_keys {
            self.entries.remove(&key);
        }

        (to_resend, abandoned)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }
}

/// Repeats `packet` `k` times for a fire-and-forget send (normally
/// [`K_REDUNDANCY`], overridable via config, spec §6). No tracking state is
/// retained for these sends (spec §4.3).
pub fn k_redundant(packet: &[u8], k: usize) -> impl Iterator<Item = &[u8]> {
    std::iter::repeat(packet).take(k)
}
