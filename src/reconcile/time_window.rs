use std::fmt;

use serde::Serialize;

use crate::reconcile::update::Update;
use crate::types::{Timestamp, TxnId, TS_MAX, TS_NONE, TXN_MAX, TXN_NONE};

/// Half-open validity interval of a value, expressed as start and stop
/// (transaction id, timestamp, durable timestamp) triples.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct TimeWindow {
    /// Transaction that made the value visible.
    pub start_txn: TxnId,
    /// Commit timestamp at which the value became visible.
    pub start_ts: Timestamp,
    /// Durable timestamp paired with `start_ts`.
    pub durable_start_ts: Timestamp,
    /// Transaction that removed the value, `TXN_MAX` when still live.
    pub stop_txn: TxnId,
    /// Timestamp at which the value stopped being visible, `TS_MAX` when live.
    pub stop_ts: Timestamp,
    /// Durable timestamp paired with `stop_ts`.
    pub durable_stop_ts: Timestamp,
    /// The value belongs to a prepared, not yet resolved transaction.
    pub prepare: bool,
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeWindow {
    /// Returns a window visible from the beginning of time and never removed.
    pub const fn new() -> Self {
        Self {
            start_txn: TXN_NONE,
            start_ts: TS_NONE,
            durable_start_ts: TS_NONE,
            stop_txn: TXN_MAX,
            stop_ts: TS_MAX,
            durable_stop_ts: TS_NONE,
            prepare: false,
        }
    }

    /// Builds a window with explicit start and stop pairs (durable equal to commit).
    pub const fn with_bounds(start: (TxnId, Timestamp), stop: (TxnId, Timestamp)) -> Self {
        Self {
            start_txn: start.0,
            start_ts: start.1,
            durable_start_ts: start.1,
            stop_txn: stop.0,
            stop_ts: stop.1,
            durable_stop_ts: if stop.1 == TS_MAX { TS_NONE } else { stop.1 },
            prepare: false,
        }
    }

    /// Copies the update's (txn, ts, durable ts) into the start boundary.
    pub fn set_start(&mut self, upd: &Update) {
        self.start_txn = upd.txn_id();
        self.start_ts = upd.start_ts();
        self.durable_start_ts = upd.durable_ts();
    }

    /// Copies the update's (txn, ts, durable ts) into the stop boundary.
    pub fn set_stop(&mut self, upd: &Update) {
        self.stop_txn = upd.txn_id();
        self.stop_ts = upd.start_ts();
        self.durable_stop_ts = upd.durable_ts();
    }

    /// Returns the start boundary as a (txn, ts) pair.
    pub fn start(&self) -> (TxnId, Timestamp) {
        (self.start_txn, self.start_ts)
    }

    /// Returns the stop boundary as a (txn, ts) pair.
    pub fn stop(&self) -> (TxnId, Timestamp) {
        (self.stop_txn, self.stop_ts)
    }

    /// Returns `true` when the window has a stop boundary other than the open end.
    pub fn has_stop(&self) -> bool {
        self.stop_ts != TS_MAX || self.stop_txn != TXN_MAX
    }

    /// Returns `true` when the stop boundary orders strictly before the start
    /// under the (timestamp, transaction id) ordering.
    pub fn is_out_of_order(&self) -> bool {
        self.stop_ts < self.start_ts
            || (self.stop_ts == self.start_ts && self.stop_txn < self.start_txn)
    }

    /// Collapses the start boundary onto the stop boundary when out of order.
    ///
    /// Returns `true` when the window was changed. A window whose start equals
    /// its stop (insert and remove in one transaction) is left alone.
    pub fn fix_out_of_order(&mut self) -> bool {
        if !self.is_out_of_order() {
            return false;
        }
        self.durable_start_ts = self.durable_stop_ts;
        self.start_ts = self.stop_ts;
        self.start_txn = self.stop_txn;
        true
    }
}

struct Bound(TxnId, Timestamp, Timestamp, TxnId, Timestamp);

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Bound(txn, ts, durable, max_txn, max_ts) = *self;
        if ts == max_ts {
            write!(f, "ts=max")?;
        } else {
            write!(f, "ts={ts}")?;
        }
        write!(f, "/durable={durable}/")?;
        if txn == max_txn {
            write!(f, "txn=max")
        } else {
            write!(f, "txn={txn}")
        }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "start: {} | stop: {} | prepared: {}",
            Bound(self.start_txn, self.start_ts, self.durable_start_ts, TXN_MAX, TS_MAX),
            Bound(self.stop_txn, self.stop_ts, self.durable_stop_ts, TXN_MAX, TS_MAX),
            if self.prepare { "yes" } else { "no" }
        )
    }
}
