use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

use crate::reconcile::update::Update;
use crate::types::{Timestamp, TxnId, TS_NONE, TXN_ABORTED, TXN_NONE};

/// Visibility questions answered by the transaction manager.
pub trait Visibility: Send + Sync {
    /// Every present and future reader sees `(txn, ts)` as committed and old enough.
    fn visible_to_all(&self, txn: TxnId, ts: Timestamp) -> bool;

    /// The run's reference snapshot can see `(txn, ts)`.
    fn visible_to_snapshot(&self, txn: TxnId, ts: Timestamp) -> bool;

    /// `txn` had committed when the run's snapshot was taken.
    fn commit_is_visible(&self, txn: TxnId) -> bool;

    /// Oldest transaction id still running, cached when the run started.
    fn running_low_water_mark(&self) -> TxnId;

    /// Transaction id of the checkpoint currently running, if any.
    fn checkpoint_txn(&self) -> TxnId {
        TXN_NONE
    }
}

/// Returns `true` if `upd` is visible to every reader.
///
/// Updates of undecided prepared transactions never are.
pub fn update_visible_all(oracle: &dyn Visibility, upd: &Update) -> bool {
    let txn = upd.txn_id();
    if txn == TXN_ABORTED || upd.prepare_state().is_pending() {
        return false;
    }
    oracle.visible_to_all(txn, upd.durable_ts())
}

/// Returns `true` if `upd` will not change visibility for the run's readers.
pub fn update_stable(oracle: &dyn Visibility, visible_all_mode: bool, upd: &Update) -> bool {
    if visible_all_mode {
        return update_visible_all(oracle, upd);
    }
    let txn = upd.txn_id();
    txn != TXN_ABORTED
        && !upd.prepare_state().is_pending()
        && oracle.visible_to_snapshot(txn, upd.start_ts())
}

/// Snapshot-based oracle.
///
/// Transactions below `snap_min` are committed, those at or above `snap_max`
/// are not, and ids in between are committed unless listed as concurrent.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotOracle {
    /// Oldest transaction id still running.
    pub oldest_running: TxnId,
    /// Smallest id that may still be running in the run's snapshot.
    pub snap_min: TxnId,
    /// First id allocated after the snapshot was taken.
    pub snap_max: TxnId,
    /// Ids between `snap_min` and `snap_max` that were running.
    pub concurrent: FxHashSet<TxnId>,
    /// Oldest read timestamp any reader may use; `TS_NONE` pins nothing.
    pub pinned_ts: Timestamp,
    /// Read timestamp of the run's snapshot; `TS_NONE` reads latest.
    pub read_ts: Timestamp,
    /// Running checkpoint transaction.
    pub checkpoint_txn: TxnId,
}

impl SnapshotOracle {
    /// Creates an oracle where every id below `next_txn` has committed and
    /// every reader can see all timestamps up to `pinned_ts`.
    pub fn new(next_txn: TxnId, pinned_ts: Timestamp) -> Self {
        Self {
            oldest_running: next_txn,
            snap_min: next_txn,
            snap_max: next_txn,
            concurrent: FxHashSet::default(),
            pinned_ts,
            read_ts: TS_NONE,
            checkpoint_txn: TXN_NONE,
        }
    }

    /// Marks `txn` as still running in the snapshot.
    pub fn running(mut self, txn: TxnId) -> Self {
        self.concurrent.insert(txn);
        self.snap_min = self.snap_min.min(txn);
        self.oldest_running = self.oldest_running.min(txn);
        if txn >= self.snap_max {
            self.snap_max = txn + 1;
        }
        self
    }

    /// Sets the run's read timestamp.
    pub fn read_ts(mut self, ts: Timestamp) -> Self {
        self.read_ts = ts;
        self
    }

    /// Sets the running checkpoint transaction.
    pub fn checkpoint(mut self, txn: TxnId) -> Self {
        self.checkpoint_txn = txn;
        self
    }
}

impl Visibility for SnapshotOracle {
    fn visible_to_all(&self, txn: TxnId, ts: Timestamp) -> bool {
        if txn == TXN_ABORTED || txn >= self.oldest_running {
            return false;
        }
        ts == TS_NONE || (self.pinned_ts != TS_NONE && ts <= self.pinned_ts)
    }

    fn visible_to_snapshot(&self, txn: TxnId, ts: Timestamp) -> bool {
        if !self.commit_is_visible(txn) {
            return false;
        }
        self.read_ts == TS_NONE || ts == TS_NONE || ts <= self.read_ts
    }

    fn commit_is_visible(&self, txn: TxnId) -> bool {
        if txn == TXN_NONE {
            return true;
        }
        if txn == TXN_ABORTED || txn >= self.snap_max {
            return false;
        }
        txn < self.snap_min || !self.concurrent.contains(&txn)
    }

    fn running_low_water_mark(&self) -> TxnId {
        self.oldest_running
    }

    fn checkpoint_txn(&self) -> TxnId {
        self.checkpoint_txn
    }
}
