//! Keeps the on-disk value reachable from a key's update chain.
//!
//! Once a newer update is written to the page image, the value it replaces
//! only survives if it is linked at the tail of the chain. The appender does
//! that, adding a tombstone in front of the value when the on-disk value had
//! already been removed, so readers between the two boundaries see "not
//! found" instead of the old value.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::reconcile::chain::{ensure_tail, publish_after, ChainIter, UpdateRef};
use crate::reconcile::context::RecSession;
use crate::reconcile::ondisk::OnDiskValue;
use crate::reconcile::oracle::update_visible_all;
use crate::reconcile::update::{flags, Update, UpdateKind};
use crate::types::{ReconcileError, Result, TXN_ABORTED};

/// Why the appender had nothing to do.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// A node was restored by rollback-to-stable and already carries history.
    RestoredForRollback,
    /// The on-disk value is prepared and its update is already on the chain.
    PreparedOnDisk,
    /// A node already carries the on-disk value's start boundary.
    AlreadyPresent,
    /// A self-contained node is visible to everyone.
    Superseded,
    /// The on-disk value's removal is visible to everyone.
    StopVisibleToAll,
}

/// Result of [`append_orig_value`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppendOutcome {
    /// Nodes were linked at the tail.
    Appended {
        /// Number of nodes linked.
        nodes: usize,
        /// Memory charged to the page.
        bytes: usize,
    },
    /// Nothing was allocated or linked.
    Skipped(SkipReason),
}

impl AppendOutcome {
    /// Returns `true` if the chain was extended.
    pub fn appended(&self) -> bool {
        matches!(self, AppendOutcome::Appended { .. })
    }
}

/// Appends the on-disk value to the chain that continues at `from`.
///
/// Either every new node is linked by a single release store on the current
/// tail, or nothing is linked at all. The tail is checked before anything is
/// allocated; a publish that still loses a race leaves the new nodes
/// unreachable in the arena until it is dropped.
pub fn append_orig_value(
    session: &RecSession<'_>,
    from: UpdateRef,
    ondisk: &OnDiskValue,
) -> Result<AppendOutcome> {
    if !ondisk.has_value() {
        return Err(ReconcileError::Invariant(
            "orig-value append for a deleted on-disk cell",
        ));
    }
    let tw = &ondisk.tw;
    let mut oldest: Option<Arc<Update>> = None;
    let mut tail: Option<Arc<Update>> = None;

    let mut walk = ChainIter::new(session.arena, Some(from));
    for (_, upd) in walk.by_ref() {
        if upd.has_flag(flags::RESTORED_FOR_ROLLBACK) {
            return Ok(AppendOutcome::Skipped(SkipReason::RestoredForRollback));
        }
        if ondisk.is_prepared() && !upd.is_tombstone() {
            return Ok(AppendOutcome::Skipped(SkipReason::PreparedOnDisk));
        }
        let txn = upd.txn_id();
        // Only the start boundary can be matched: a lone tombstone on the
        // chain still needs the on-disk value behind it.
        if tw.start_ts == upd.start_ts() && tw.start_txn == txn && !upd.is_tombstone() {
            return Ok(AppendOutcome::Skipped(SkipReason::AlreadyPresent));
        }
        // Any self-contained node may be globally visible, not only the
        // oldest: out-of-order commits can leave a newer visible node in
        // front of an older invisible one.
        if upd.kind().is_self_contained() && update_visible_all(session.oracle, &upd) {
            return Ok(AppendOutcome::Skipped(SkipReason::Superseded));
        }
        if txn != TXN_ABORTED {
            oldest = Some(Arc::clone(&upd));
        }
        tail = Some(upd);
    }
    walk.finish()?;
    let tail = tail.ok_or(ReconcileError::Invariant("orig-value append on an empty chain"))?;

    if tw.has_stop() && session.oracle.visible_to_all(tw.stop_txn, tw.stop_ts) {
        return Ok(AppendOutcome::Skipped(SkipReason::StopVisibleToAll));
    }

    let need_tombstone = match &oldest {
        _ if !tw.has_stop() => false,
        Some(upd) if upd.is_tombstone() => {
            // Resolving a prepare rewrites its timestamps, so a prepared
            // on-disk value cannot be compared with the in-memory tombstone.
            if !ondisk.is_prepared()
                && (tw.stop_ts != upd.start_ts() || tw.stop_txn != upd.txn_id())
            {
                return Err(ReconcileError::Invariant(
                    "chain tombstone does not match on-disk stop",
                ));
            }
            false
        }
        _ => true,
    };
    ensure_tail(&tail)?;

    let value = session
        .alloc
        .new_update(ondisk.value.clone(), UpdateKind::Standard)?
        .stamped(tw.start_txn, tw.start_ts, tw.durable_start_ts);
    let mut bytes = value.memsize();
    let handles = if need_tombstone {
        let tombstone = session
            .alloc
            .new_tombstone()?
            .stamped(tw.stop_txn, tw.stop_ts, tw.durable_stop_ts);
        bytes += tombstone.memsize();
        let handles = session.arena.insert_batch([tombstone, value])?;
        session.arena.get(handles[0]).link_next(Some(handles[1]));
        handles
    } else {
        session.arena.insert_batch([value])?
    };

    publish_after(&tail, handles[0])?;
    session.memory.add(bytes);
    session.metrics.orig_value_appended(handles.len(), bytes);
    debug!(
        start_txn = tw.start_txn,
        start_ts = tw.start_ts,
        tombstone = need_tombstone,
        bytes,
        "reconcile.orig_value.appended"
    );
    Ok(AppendOutcome::Appended {
        nodes: handles.len(),
        bytes,
    })
}
