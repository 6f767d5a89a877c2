//! C8: applies server deltas or full snapshots to the local grid, tracks
//! pending local cell requests and retries them, and discards stale
//! replays (spec §4.8).
//!
//! `ClientGrid` is the reconciler's pure state machine — no socket, no
//! fragmentation bookkeeping — so it can be driven directly in tests
//! (spec §8, property 5 "Convergence") and is what
//! [`crate::client_session::Client`] wraps with the wire-facing machinery.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use esp_proto::{
    body::{UpdateEntry, GRID_CELLS},
    ids::{LocalId, SnapshotId},
};

/// How long a local cell request waits for a server reply before being
/// retried (spec §3 "Pending Cell Request", §4.8, §5).
pub const PENDING_RETRY: Duration = Duration::from_millis(100);

/// The reconciled local view of one room's grid.
#[derive(Debug, Clone)]
pub struct ClientGrid {
    pub cells: [u8; GRID_CELLS],
    pub snapshot_id: SnapshotId,
    /// `cell_idx -> last-sent timestamp` (spec §3 "Pending Cell Request").
    pending: HashMap<u16, Instant>,
}

impl Default for ClientGrid {
    fn default() -> Self {
        Self {
            cells: [0u8; GRID_CELLS],
            snapshot_id: SnapshotId::default(),
            pending: HashMap::new(),
        }
    }
}

impl ClientGrid {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `EVENT`: `local_id == 0` is a rejection — clear the pending entry
    /// and leave the grid untouched. Otherwise apply the ownership change,
    /// clear the pending entry, and remember the server's `snapshot_id`
    /// (spec §4.8).
    pub fn apply_event(&mut self, cell_idx: u16, local_id: LocalId, server_snapshot_id: SnapshotId) {
        self.pending.remove(&cell_idx);
        if local_id.is_none() {
            return;
        }
        if let Some(cell) = self.cells.get_mut(usize::from(cell_idx)) {
            *cell = local_id.0;
        }
        self.snapshot_id = server_snapshot_id;
    }

    /// `UPDATES`: applies the trailing `required = server_snapshot_id -
    /// local_snapshot_id` entries if `0 < required <= entries.len()`.
    /// Returns whether deltas were actually applied — the caller must ACK
    /// every fragment sequence of the received message either way,
    /// idempotently, per spec §4.8.
    pub fn apply_updates(&mut self, entries: &[UpdateEntry], server_snapshot_id: SnapshotId) -> bool {
        let required = server_snapshot_id.gap_since(self.snapshot_id);
        if required == 0 {
            return false; // duplicate/stale replay, still ACK but do not re-apply
        }
        let required = required as usize;
        if required > entries.len() {
            return false; // can't safely apply; server will promote to SNAPSHOT on our next ACK
        }
        let start = entries.len() - required;
        for entry in &entries[start..] {
            if let Some(cell) = self.cells.get_mut(usize::from(entry.cell_idx)) {
                *cell = entry.local_id.0;
            }
            self.pending.remove(&entry.cell_idx);
        }
        self.snapshot_id = server_snapshot_id;
        true
    }

    /// `SNAPSHOT`: overwrites the entire local grid and adopts the
    /// packet's `snapshot_id` (spec §4.8). Any pending request whose cell
    /// the snapshot now shows occupied is dropped — the acquisition has
    /// already been decided, successfully or not, by whoever's owner byte
    /// landed there.
    pub fn apply_snapshot(&mut self, grid: [u8; GRID_CELLS], server_snapshot_id: SnapshotId) {
        self.cells = grid;
        self.snapshot_id = server_snapshot_id;
        let cells = self.cells;
        self.pending.retain(|&idx, _| cells[usize::from(idx)] == 0);
    }

    /// Records a local acquisition request as pending, but only if the
    /// local grid currently shows `cell_idx` empty (spec §3 "Pending Cell
    /// Request"). Returns `false` (and does not record anything) if the
    /// cell is already locally owned.
    pub fn request_cell(&mut self, cell_idx: u16, now: Instant) -> bool {
        if self.cells.get(usize::from(cell_idx)).copied().unwrap_or(1) != 0 {
            return false;
        }
        self.pending.insert(cell_idx, now);
        true
    }

    /// Cells that have been pending longer than [`PENDING_RETRY`] and
    /// still show empty locally are due for a fire-and-forget re-request;
    /// cells that became occupied in the meantime are silently dropped
    /// from tracking instead (spec §4.8, scenario (c)).
    pub fn cells_to_retry(&mut self, now: Instant) -> Vec<u16> {
        let mut due = Vec::new();
        self.pending.retain(|&idx, sent_at| {
            if now.duration_since(*sent_at) < PENDING_RETRY {
                return true;
            }
            if self.cells[usize::from(idx)] != 0 {
                return false; // resolved elsewhere; suppress the retry
            }
            due.push(idx);
            true
        });
        for idx in &due {
            self.pending.insert(*idx, now);
        }
        due
    }

    #[must_use]
    pub fn is_pending(&self, cell_idx: u16) -> bool {
        self.pending.contains_key(&cell_idx)
    }

    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_rejection_clears_pending_without_mutating_grid() {
        let mut grid = ClientGrid::new();
        grid.request_cell(10, Instant::now());
        grid.apply_event(10, LocalId::NONE, SnapshotId(1));
        assert_eq!(grid.cells[10], 0);
        assert!(!grid.is_pending(10));
        assert_eq!(grid.snapshot_id, SnapshotId::default(), "rejection does not advance local snapshot_id");
    }

    #[test]
    fn event_success_applies_owner_and_snapshot() {
        let mut grid = ClientGrid::new();
        grid.request_cell(37, Instant::now());
        grid.apply_event(37, LocalId(2), SnapshotId(9));
        assert_eq!(grid.cells[37], 2);
        assert!(!grid.is_pending(37));
        assert_eq!(grid.snapshot_id, SnapshotId(9));
    }

    #[test]
    fn updates_apply_trailing_entries_when_lag_in_range() {
        let mut grid = ClientGrid::new();
        grid.snapshot_id = SnapshotId(3);
        let entries = vec![
            UpdateEntry { event_type: 0, local_id: LocalId(1), cell_idx: 0 },
            UpdateEntry { event_type: 0, local_id: LocalId(2), cell_idx: 1 },
            UpdateEntry { event_type: 0, local_id: LocalId(3), cell_idx: 2 },
        ];
        assert!(grid.apply_updates(&entries, SnapshotId(5)));
        assert_eq!(grid.cells[1], 2);
        assert_eq!(grid.cells[2], 3);
        assert_eq!(grid.snapshot_id, SnapshotId(5));
    }

    #[test]
    fn updates_stale_replay_is_not_reapplied() {
        let mut grid = ClientGrid::new();
        grid.snapshot_id = SnapshotId(5);
        let entries = vec![UpdateEntry { event_type: 0, local_id: LocalId(9), cell_idx: 0 }];
        assert!(!grid.apply_updates(&entries, SnapshotId(5)));
        assert_eq!(grid.cells[0], 0);
    }

    #[test]
    fn updates_lag_beyond_window_is_not_applied() {
        let mut grid = ClientGrid::new();
        grid.snapshot_id = SnapshotId(0);
        let entries = vec![UpdateEntry { event_type: 0, local_id: LocalId(1), cell_idx: 0 }];
        assert!(!grid.apply_updates(&entries, SnapshotId(20)));
        assert_eq!(grid.cells[0], 0, "client cannot safely apply a partial delta");
    }

    #[test]
    fn snapshot_overwrites_whole_grid_and_drops_resolved_pending() {
        let mut grid = ClientGrid::new();
        grid.request_cell(5, Instant::now());
        grid.request_cell(6, Instant::now());
        let mut full = [0u8; GRID_CELLS];
        full[5] = 3; // resolved by someone while we were applying snapshot
        grid.apply_snapshot(full, SnapshotId(42));
        assert_eq!(grid.cells[5], 3);
        assert!(!grid.is_pending(5));
        assert!(grid.is_pending(6), "still-empty cell stays pending");
        assert_eq!(grid.snapshot_id, SnapshotId(42));
    }

    #[test]
    fn request_cell_refuses_already_owned_cell() {
        let mut grid = ClientGrid::new();
        grid.cells[10] = 1;
        assert!(!grid.request_cell(10, Instant::now()));
        assert!(!grid.is_pending(10));
    }

    #[test]
    fn pending_cell_retried_after_timeout_then_suppressed_once_resolved() {
        let mut grid = ClientGrid::new();
        let t0 = Instant::now();
        grid.request_cell(100, t0);
        assert!(grid.cells_to_retry(t0 + Duration::from_millis(50)).is_empty());

        let due = grid.cells_to_retry(t0 + PENDING_RETRY + Duration::from_millis(1));
        assert_eq!(due, vec![100]);
        assert!(grid.is_pending(100), "still pending after a retry, just refreshed");

        // server resolves it for someone else in the meantime
        grid.cells[100] = 3;
        let due_again = grid.cells_to_retry(t0 + 2 * PENDING_RETRY + Duration::from_millis(2));
        assert!(due_again.is_empty());
        assert!(!grid.is_pending(100), "suppressed once the grid shows it occupied");
    }
}
