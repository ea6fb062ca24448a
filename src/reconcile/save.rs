use tracing::trace;

use crate::reconcile::chain::UpdateRef;
use crate::reconcile::context::{ReconcileContext, SavedUpdate, SlotLocator};
use crate::reconcile::options::PageKind;
use crate::reconcile::oracle::Visibility;
use crate::reconcile::select::UpdateSelection;
use crate::reconcile::update::UpdateKind;
use crate::types::{ReconcileError, Result};

/// Decides whether the chain behind `sel` has to be preserved out of band.
pub fn need_save_update(
    oracle: &dyn Visibility,
    ctx: &ReconcileContext,
    sel: &UpdateSelection,
    has_newer_updates: bool,
) -> bool {
    if sel.tw.prepare {
        return true;
    }
    let run = ctx.mode();
    if run.evict() && has_newer_updates {
        return true;
    }

    let stop_visible = oracle.visible_to_all(sel.tw.stop_txn, sel.tw.stop_ts);
    let start_visible = oracle.visible_to_all(sel.tw.start_txn, sel.tw.start_ts);

    // Without a version store the page is the only home for history.
    if !run.history_store()
        && !run.in_memory()
        && ctx.page().kind != PageKind::ColumnFix
        && stop_visible
        && start_visible
    {
        return false;
    }

    if run.checkpoint() && sel.upd.is_none() {
        return false;
    }

    !stop_visible && !start_visible
}

/// Returns `true` when saved updates must be restored into memory rather
/// than only written to the version store.
pub fn restore_required(ctx: &ReconcileContext, has_newer_updates: bool) -> bool {
    ctx.mode().evict()
        && (has_newer_updates || ctx.mode().in_memory() || ctx.page().kind == PageKind::ColumnFix)
}

/// Appends a saved-update record to the run.
pub fn save_update(
    ctx: &mut ReconcileContext,
    slot: SlotLocator,
    onpage: Option<(UpdateRef, UpdateKind)>,
    restore: bool,
    memsize: usize,
) -> Result<()> {
    if onpage.is_none() && !restore {
        return Err(ReconcileError::Invariant(
            "saved update without an on-page value must be restored",
        ));
    }
    if let Some((_, kind)) = onpage {
        if !matches!(kind, UpdateKind::Standard | UpdateKind::Modify) {
            return Err(ReconcileError::Invariant(
                "only standard or modify updates are written to the page",
            ));
        }
    }
    ctx.push_saved(SavedUpdate {
        slot,
        onpage: onpage.map(|(handle, _)| handle),
        restore,
        memsize,
    })?;
    trace!(?slot, restore, memsize, "reconcile.save.recorded");
    Ok(())
}
