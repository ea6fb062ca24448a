//! Chooses the update written to the page image for one key.
//!
//! The chain is walked once, newest to oldest. The first committed,
//! selectable update wins; under eviction the walk continues so every
//! unstable update is counted. The winner's time window is then derived,
//! looking past a tombstone to the value it deletes (appending the on-disk
//! value when the chain does not hold it), and the save decision is made.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, warn};

use crate::reconcile::chain::{ChainIter, UpdateChain, UpdateRef};
use crate::reconcile::context::{ReconcileContext, RecSession, SlotLocator};
use crate::reconcile::ondisk::OnDiskValue;
use crate::reconcile::orig_value::append_orig_value;
use crate::reconcile::oracle::{update_stable, update_visible_all};
use crate::reconcile::save::{need_save_update, restore_required, save_update};
use crate::reconcile::time_window::TimeWindow;
use crate::reconcile::update::{PrepareState, Update, UpdateKind};
use crate::types::{ReconcileError, Result, Timestamp, TxnId, TXN_ABORTED, TXN_NONE};

/// Update chosen for the page image and the window in which it is valid.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize)]
pub struct UpdateSelection {
    /// Chosen update, `None` when nothing can be written.
    pub upd: Option<UpdateRef>,
    /// Validity window of the chosen value.
    pub tw: TimeWindow,
    /// Some update newer than the choice is not yet visible.
    pub has_newer_updates: bool,
    /// A saved-update record was emitted for the key.
    pub saved: bool,
}

#[derive(Default)]
struct Scan {
    selected: Option<(UpdateRef, Arc<Update>, PrepareState)>,
    any_live: bool,
    has_newer_updates: bool,
    max_txn: TxnId,
    max_ts: Timestamp,
    memsize: usize,
}

impl RecSession<'_> {
    /// Selects the update to write for the key whose chain is `chain`.
    pub fn select(
        &self,
        ctx: &mut ReconcileContext,
        slot: SlotLocator,
        chain: &UpdateChain,
        ondisk: Option<&OnDiskValue>,
    ) -> Result<UpdateSelection> {
        select_update(self, ctx, slot, chain.head(), ondisk)
    }
}

/// Selects the update to write for the chain starting at `head`.
///
/// Updates `ctx` counters and maxima, may append one saved-update record and
/// may link up to two nodes at the chain's tail.
pub fn select_update(
    session: &RecSession<'_>,
    ctx: &mut ReconcileContext,
    slot: SlotLocator,
    head: Option<UpdateRef>,
    ondisk: Option<&OnDiskValue>,
) -> Result<UpdateSelection> {
    let mut sel = UpdateSelection::default();
    let Some(head) = head else {
        return Ok(sel);
    };

    let scan = scan_chain(session, ctx, head)?;
    let mut chosen = scan
        .selected
        .as_ref()
        .map(|(handle, upd, _)| (*handle, Arc::clone(upd)));

    if let Some((_, upd)) = &chosen {
        if upd.is_aborted() || upd.kind() == UpdateKind::Reserve {
            return Err(ReconcileError::Invariant(
                "selected an aborted or reserved update",
            ));
        }
        let txn = upd.txn_id();
        if ctx.page().metadata
            && txn != TXN_NONE
            && txn == session.oracle.checkpoint_txn()
            && !ctx.mode().checkpoint()
        {
            return Err(ReconcileError::Invariant(
                "metadata update written by a concurrent checkpoint",
            ));
        }
    }

    if !scan.any_live {
        session.metrics.selection(false);
        return Ok(sel);
    }

    if scan.has_newer_updates && ctx.rejects_dirty() {
        if ctx.visibility_err() {
            error!(?slot, "reconcile.select.update_not_visible");
            return Err(ReconcileError::UpdateNotVisible);
        }
        session.metrics.busy();
        debug!(?slot, "reconcile.select.busy_dirty");
        return Err(ReconcileError::Busy(
            "invisible updates on a page expected to be clean",
        ));
    }

    if let Some((_, upd)) = &chosen {
        let stats = ctx.stats_mut();
        stats.max_ondisk_ts = stats.max_ondisk_ts.max(upd.start_ts());
    }

    let mut tw = TimeWindow::new();
    if let Some((handle, upd)) = chosen.clone() {
        if scan.selected.as_ref().map(|(_, _, state)| *state) == Some(PrepareState::InProgress) {
            tw.prepare = true;
        }
        if upd.is_tombstone() {
            tw.set_stop(&upd);
            if !update_visible_all(session.oracle, &upd) {
                let (deleted, tail) = deleted_by(session, handle, &upd)?;
                chosen = deleted;
                if chosen.is_none() {
                    chosen = append_deleted_value(session, handle, tail, ondisk, &mut tw)?;
                }
            }
        }
        if let Some((_, upd)) = &chosen {
            tw.set_start(upd);
        }
    }

    if tw.is_out_of_order() {
        warn!(
            time_window = %tw,
            "reconcile.timestamp.out_of_order: remove earlier than value"
        );
        tw.fix_out_of_order();
        session.metrics.out_of_order_fixed();
    }

    let stats = ctx.stats_mut();
    stats.max_txn = stats.max_txn.max(scan.max_txn);
    stats.max_ts = stats.max_ts.max(scan.max_ts);
    if scan.has_newer_updates {
        ctx.set_leave_dirty();
    }

    sel.upd = chosen.as_ref().map(|(handle, _)| *handle);
    sel.tw = tw;
    sel.has_newer_updates = scan.has_newer_updates;

    if need_save_update(session.oracle, ctx, &sel, scan.has_newer_updates) {
        let onpage = chosen
            .as_ref()
            .filter(|(_, upd)| !upd.is_tombstone())
            .map(|(handle, upd)| (*handle, upd.kind()));
        // With no value for the page image, eviction must keep the chain.
        let restore = restore_required(ctx, scan.has_newer_updates)
            || (onpage.is_none() && ctx.mode().evict());
        if onpage.is_none() && !restore {
            // The page keeps the on-disk value or the deletion, and the
            // chain stays in memory.
            debug!(?slot, "reconcile.save.chain_resident");
        } else {
            save_update(ctx, slot, onpage, restore, scan.memsize)?;
            session.metrics.update_saved(restore);
            sel.saved = true;
        }
    }

    if let (Some((handle, upd)), Some(ondisk)) = (&chosen, ondisk) {
        if upd.is_aborted() {
            return Err(ReconcileError::Invariant("selected update was rolled back"));
        }
        // Overflow blocks are not part of the rewritten page, so readers
        // lose the on-disk value unless it moves onto the chain.
        if ondisk.has_value() && (sel.saved || ondisk.overflow) {
            append_orig_value(session, *handle, ondisk)?;
        }
    }

    session.metrics.selection(sel.upd.is_some());
    Ok(sel)
}

fn scan_chain(
    session: &RecSession<'_>,
    ctx: &mut ReconcileContext,
    head: UpdateRef,
) -> Result<Scan> {
    let oracle = session.oracle;
    let run = ctx.mode();
    // Version store entries are implicitly committed.
    let check_commit = !ctx.page().history_store;
    let mut scan = Scan::default();

    let mut walk = ChainIter::new(session.arena, Some(head));
    for (handle, upd) in walk.by_ref() {
        let txn = upd.txn_id();
        if txn == TXN_ABORTED {
            continue;
        }
        ctx.stats_mut().updates_seen += 1;
        scan.memsize += upd.memsize();
        scan.any_live = true;
        scan.max_txn = scan.max_txn.max(txn);

        if check_commit && !ctx.commit_visible(oracle, txn) {
            if scan.selected.is_some() {
                session.metrics.busy();
                debug!(txn, "reconcile.select.busy_uncommitted");
                return Err(ReconcileError::Busy(
                    "uncommitted update older than the selected update",
                ));
            }
            scan.has_newer_updates = true;
            continue;
        }

        let prepare = upd.prepare_state();
        if prepare.is_pending() {
            if let Some((_, selected, _)) = &scan.selected {
                if selected.txn_id() != txn {
                    return Err(ReconcileError::Invariant(
                        "prepared update behind an update from another transaction",
                    ));
                }
            }
            if !run.evict() {
                scan.has_newer_updates = true;
                scan.max_ts = scan.max_ts.max(upd.start_ts());
                // Start rather than durable timestamp: readers compare it to
                // decide whether the page image is usable.
                let stats = ctx.stats_mut();
                stats.min_skipped_ts = stats.min_skipped_ts.min(upd.start_ts());
                continue;
            }
            if prepare == PrepareState::Locked {
                return Err(ReconcileError::Busy("prepared update is being resolved"));
            }
        }

        scan.max_ts = scan.max_ts.max(upd.start_ts());
        if scan.selected.is_none() {
            scan.selected = Some((handle, Arc::clone(&upd), prepare));
        }

        if !run.evict() {
            break;
        }
        if !update_stable(oracle, run.visible_all(), &upd) {
            ctx.stats_mut().updates_unstable += 1;
        }
    }
    walk.finish()?;
    Ok(scan)
}

type Chosen = Option<(UpdateRef, Arc<Update>)>;

/// Finds the update deleted by `tombstone`, skipping aborted nodes.
///
/// When the chain ends first, returns the last node walked so the caller can
/// append the on-disk value behind it. The found node may itself be an older
/// tombstone.
fn deleted_by(
    session: &RecSession<'_>,
    handle: UpdateRef,
    tombstone: &Arc<Update>,
) -> Result<(Chosen, (UpdateRef, Arc<Update>))> {
    let mut last = (handle, Arc::clone(tombstone));
    while let Some(next) = last.1.next() {
        let node = session.arena.resolve(next)?;
        if !node.is_aborted() {
            return Ok((Some((next, node)), last));
        }
        last = (next, node);
    }
    Ok((None, last))
}

/// Handles a tombstone with nothing older on the chain: the value it deletes
/// is the on-disk one, which is appended and then chosen.
fn append_deleted_value(
    session: &RecSession<'_>,
    tombstone: UpdateRef,
    tail: (UpdateRef, Arc<Update>),
    ondisk: Option<&OnDiskValue>,
    tw: &mut TimeWindow,
) -> Result<Chosen> {
    let ondisk = ondisk
        .filter(|cell| cell.has_value())
        .ok_or(ReconcileError::Invariant(
            "tombstone without an on-disk value to delete",
        ))?;

    let outcome = append_orig_value(session, tombstone, ondisk)?;
    let (tail_handle, tail_node) = tail;
    if let (true, Some(next)) = (outcome.appended(), tail_node.next()) {
        let node = session.arena.resolve(next)?;
        if node.txn_id() != ondisk.tw.start_txn
            || node.start_ts() != ondisk.tw.start_ts
            || node.kind() != UpdateKind::Standard
            || node.next().is_some()
        {
            return Err(ReconcileError::Invariant(
                "appended node does not carry the on-disk value",
            ));
        }
        return Ok(Some((next, node)));
    }

    // Nothing was appended: keep the on-disk value on the page and only end
    // its window at the tombstone.
    debug!(
        tail = tail_handle.raw(),
        ?outcome,
        "reconcile.select.keep_ondisk_value"
    );
    tw.start_txn = ondisk.tw.start_txn;
    tw.start_ts = ondisk.tw.start_ts;
    tw.durable_start_ts = ondisk.tw.durable_start_ts;
    Ok(None)
}
