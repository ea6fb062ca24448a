//! End-to-end selection scenarios over small hand-built chains.

#![allow(missing_docs)]

use std::sync::Once;

use bytes::Bytes;
use sombra_reconcile::reconcile::{
    CounterMetrics, OnDiskValue, PrepareState, RecSession, ReconcileContext, ReconcileOptions,
    SlotLocator, SnapshotOracle, TimeWindow, Update, UpdateArena, UpdateChain, UpdateKind,
    UpdateRef, Visibility,
};
use sombra_reconcile::reconcile::{
    append_orig_value, need_save_update, update_flags, AppendOutcome, PageKind, SkipReason,
    UpdateSelection,
};
use sombra_reconcile::types::{ReconcileError, TS_MAX, TS_NONE, TXN_MAX};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("sombra_reconcile=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .with_ansi(false)
            .try_init();
    });
}

struct Page {
    arena: UpdateArena,
    chain: UpdateChain,
    handles: Vec<UpdateRef>,
}

impl Page {
    /// Builds a chain from updates listed newest first.
    fn new(updates: Vec<Update>) -> Self {
        let arena = UpdateArena::new();
        let chain = UpdateChain::new();
        let mut handles: Vec<UpdateRef> = updates
            .into_iter()
            .rev()
            .map(|upd| chain.prepend(&arena, upd).expect("prepend"))
            .collect();
        handles.reverse();
        Self {
            arena,
            chain,
            handles,
        }
    }

    fn select(
        &self,
        oracle: &dyn Visibility,
        ctx: &mut ReconcileContext,
        ondisk: Option<&OnDiskValue>,
    ) -> Result<UpdateSelection, ReconcileError> {
        RecSession::new(&self.arena, oracle).select(ctx, SlotLocator::Slot(0), &self.chain, ondisk)
    }

    fn nodes(&self) -> Vec<(UpdateKind, u64, u64)> {
        self.chain
            .iter(&self.arena)
            .map(|(_, upd)| (upd.kind(), upd.txn_id(), upd.start_ts()))
            .collect()
    }
}

fn value(txn: u64, ts: u64) -> Update {
    Update::new(UpdateKind::Standard, Bytes::from(format!("v{txn}"))).stamped(txn, ts, ts)
}

fn tombstone(txn: u64, ts: u64) -> Update {
    Update::tombstone().stamped(txn, ts, ts)
}

fn ondisk(start: (u64, u64)) -> OnDiskValue {
    OnDiskValue::new(Bytes::from_static(b"disk"), TimeWindow::with_bounds(start, (TXN_MAX, TS_MAX)))
}

#[test]
fn tombstone_over_ondisk_value_appends_and_selects_it() {
    init_tracing();
    let page = Page::new(vec![tombstone(50, 100)]);
    let oracle = SnapshotOracle::new(200, 20);
    let mut ctx = ReconcileContext::new(&ReconcileOptions::new(), &oracle);
    let disk = ondisk((10, 10));

    let sel = page.select(&oracle, &mut ctx, Some(&disk)).unwrap();

    assert_eq!(
        page.nodes(),
        vec![(UpdateKind::Tombstone, 50, 100), (UpdateKind::Standard, 10, 10)]
    );
    let chosen = page.arena.get(sel.upd.expect("selected"));
    assert_eq!(chosen.value().as_ref(), b"disk");
    assert_eq!(sel.tw.start(), (10, 10));
    assert_eq!(sel.tw.stop(), (50, 100));
    assert!(!sel.tw.prepare);
}

#[test]
fn newest_visible_value_is_selected() {
    let page = Page::new(vec![value(5, 5), value(3, 3)]);
    let oracle = SnapshotOracle::new(10, 100);
    let mut ctx = ReconcileContext::new(&ReconcileOptions::new().visible_all(true), &oracle);

    let sel = page.select(&oracle, &mut ctx, None).unwrap();

    assert_eq!(sel.upd, Some(page.handles[0]));
    assert_eq!(sel.tw.start(), (5, 5));
    assert!(!sel.tw.has_stop());
    assert_eq!(ctx.stats().updates_seen, 1);
    assert_eq!(ctx.stats().max_txn, 5);
    assert_eq!(ctx.stats().max_ondisk_ts, 5);
}

#[test]
fn uncommitted_update_leaves_page_dirty() {
    let page = Page::new(vec![value(9, 9)]);
    let oracle = SnapshotOracle::new(20, 100).running(9);
    let mut ctx = ReconcileContext::new(&ReconcileOptions::new(), &oracle);

    let sel = page.select(&oracle, &mut ctx, None).unwrap();

    assert!(sel.upd.is_none());
    assert!(sel.has_newer_updates);
    assert!(ctx.leave_dirty());
    assert!(ctx.saved().is_empty());
}

#[test]
fn uncommitted_update_behind_selection_is_busy() {
    let page = Page::new(vec![value(9, 9), value(4, 4)]);
    let oracle = SnapshotOracle::new(20, 100).running(4);
    let metrics = CounterMetrics::default();
    let mut ctx = ReconcileContext::new(&ReconcileOptions::eviction(), &oracle);

    let err = RecSession::new(&page.arena, &oracle)
        .with_metrics(&metrics)
        .select(&mut ctx, SlotLocator::Slot(0), &page.chain, None)
        .unwrap_err();

    assert!(matches!(err, ReconcileError::Busy(_)));
    assert!(err.is_retryable());
    assert_eq!(metrics.busy.load(std::sync::atomic::Ordering::Relaxed), 1);
}

#[test]
fn out_of_order_tombstone_collapses_window() {
    init_tracing();
    let page = Page::new(vec![tombstone(5, 5), value(5, 8)]);
    let oracle = SnapshotOracle::new(20, 1);
    let metrics = CounterMetrics::default();
    let mut ctx = ReconcileContext::new(&ReconcileOptions::new(), &oracle);

    let sel = RecSession::new(&page.arena, &oracle)
        .with_metrics(&metrics)
        .select(&mut ctx, SlotLocator::Slot(0), &page.chain, None)
        .unwrap();

    assert_eq!(sel.upd, Some(page.handles[1]));
    assert_eq!(sel.tw.start(), (5, 5));
    assert_eq!(sel.tw.stop(), (5, 5));
    assert!(!sel.tw.is_out_of_order());
    assert_eq!(
        metrics.out_of_order.load(std::sync::atomic::Ordering::Relaxed),
        1
    );
}

#[test]
fn globally_visible_window_emits_no_saved_update() {
    let oracle = SnapshotOracle::new(100, 100);
    let mut ctx = ReconcileContext::new(&ReconcileOptions::new().history_store(true), &oracle);
    let sel = UpdateSelection {
        upd: UpdateRef::from_raw(1),
        tw: TimeWindow::with_bounds((5, 5), (8, 8)),
        has_newer_updates: false,
        saved: false,
    };
    assert!(!need_save_update(&oracle, &ctx, &sel, false));

    let page = Page::new(vec![tombstone(8, 8), value(5, 5)]);
    let sel = page.select(&oracle, &mut ctx, None).unwrap();
    assert_eq!(sel.upd, Some(page.handles[0]));
    assert_eq!(sel.tw.start(), sel.tw.stop());
    assert!(!sel.saved);
    assert!(ctx.saved().is_empty());
}

#[test]
fn all_aborted_chain_selects_nothing() {
    let page = Page::new(vec![value(7, 7), value(6, 6)]);
    for handle in &page.handles {
        page.arena.get(*handle).mark_aborted();
    }
    let oracle = SnapshotOracle::new(20, 100);
    let mut ctx = ReconcileContext::new(&ReconcileOptions::eviction(), &oracle);

    let sel = page.select(&oracle, &mut ctx, Some(&ondisk((1, 1)))).unwrap();

    assert_eq!(sel, UpdateSelection::default());
    assert_eq!(ctx.stats().updates_seen, 0);
    assert!(!ctx.leave_dirty());
    assert_eq!(page.nodes().len(), 2);
}

#[test]
fn empty_chain_selects_nothing() {
    let page = Page::new(Vec::new());
    let oracle = SnapshotOracle::new(20, 100);
    let mut ctx = ReconcileContext::new(&ReconcileOptions::new(), &oracle);
    let sel = page.select(&oracle, &mut ctx, None).unwrap();
    assert!(sel.upd.is_none());
    assert_eq!(ctx.stats().updates_seen, 0);
}

#[test]
fn prepared_update_is_skipped_outside_eviction() {
    let page = Page::new(vec![
        value(7, 30).with_prepare(PrepareState::InProgress),
        value(3, 3),
    ]);
    let oracle = SnapshotOracle::new(20, 100);
    let mut ctx = ReconcileContext::new(&ReconcileOptions::checkpointing(), &oracle);

    let sel = page.select(&oracle, &mut ctx, None).unwrap();

    assert_eq!(sel.upd, Some(page.handles[1]));
    assert!(sel.has_newer_updates);
    assert!(!sel.tw.prepare);
    assert_eq!(ctx.stats().min_skipped_ts, 30);
    assert_eq!(ctx.stats().max_ts, 30);
    assert!(ctx.leave_dirty());
}

#[test]
fn eviction_selects_prepared_update_and_saves_it() {
    let page = Page::new(vec![
        value(7, 30).with_prepare(PrepareState::InProgress),
        value(3, 3),
    ]);
    let oracle = SnapshotOracle::new(20, 100);
    let mut ctx = ReconcileContext::new(&ReconcileOptions::eviction(), &oracle);

    let sel = page.select(&oracle, &mut ctx, None).unwrap();

    assert_eq!(sel.upd, Some(page.handles[0]));
    assert!(sel.tw.prepare);
    assert!(sel.saved);
    assert_eq!(ctx.stats().updates_unstable, 1);
    assert_eq!(ctx.stats().updates_seen, 2);
    let record = &ctx.saved()[0];
    assert_eq!(record.onpage, Some(page.handles[0]));
    assert!(!record.restore);
}

#[test]
fn eviction_rejects_locked_prepare() {
    let page = Page::new(vec![value(7, 30).with_prepare(PrepareState::Locked)]);
    let oracle = SnapshotOracle::new(20, 100);
    let mut ctx = ReconcileContext::new(&ReconcileOptions::eviction(), &oracle);
    let err = page.select(&oracle, &mut ctx, None).unwrap_err();
    assert!(err.is_retryable());
}

#[test]
fn eviction_with_newer_updates_restores_chain() {
    let page = Page::new(vec![value(15, 15), value(5, 5)]);
    let oracle = SnapshotOracle::new(20, 100).running(15);
    let mut ctx = ReconcileContext::new(&ReconcileOptions::eviction(), &oracle);
    let disk = ondisk((1, 1));

    let sel = page.select(&oracle, &mut ctx, Some(&disk)).unwrap();

    assert_eq!(sel.upd, Some(page.handles[1]));
    assert!(sel.has_newer_updates);
    assert!(sel.saved);
    let record = &ctx.saved()[0];
    assert!(record.restore);
    assert_eq!(record.onpage, Some(page.handles[1]));
    let expected: usize = page
        .handles
        .iter()
        .map(|handle| page.arena.get(*handle).memsize())
        .sum();
    assert_eq!(record.memsize, expected);
    assert_eq!(ctx.saved_memsize(), expected);
    assert!(ctx.cache_write_restore());
    // The selected value is globally visible, so the on-disk value is not needed.
    assert_eq!(page.nodes().len(), 2);
}

#[test]
fn clean_page_expectation_turns_newer_updates_into_busy() {
    let page = Page::new(vec![value(15, 15), value(5, 5)]);
    let oracle = SnapshotOracle::new(20, 100).running(15);
    let mut ctx =
        ReconcileContext::new(&ReconcileOptions::eviction().clean_after_rec(true), &oracle);
    let err = page.select(&oracle, &mut ctx, None).unwrap_err();
    assert!(matches!(err, ReconcileError::Busy(_)));
    assert!(ctx.saved().is_empty());
}

#[test]
fn visibility_error_mode_is_fatal() {
    init_tracing();
    let page = Page::new(vec![value(15, 15), value(5, 5)]);
    let oracle = SnapshotOracle::new(20, 100).running(15);
    let mut ctx =
        ReconcileContext::new(&ReconcileOptions::eviction().visibility_err(true), &oracle);
    let err = page.select(&oracle, &mut ctx, None).unwrap_err();
    assert!(matches!(err, ReconcileError::UpdateNotVisible));
    assert!(err.is_fatal());
}

#[test]
fn version_store_pages_skip_commit_check() {
    let page = Page::new(vec![value(15, 15)]);
    let oracle = SnapshotOracle::new(20, 100).running(15);
    let mut ctx = ReconcileContext::new(
        &ReconcileOptions::new().history_store_page(true),
        &oracle,
    );
    let sel = page.select(&oracle, &mut ctx, None).unwrap();
    assert_eq!(sel.upd, Some(page.handles[0]));
    assert!(!sel.has_newer_updates);
}

#[test]
fn visible_all_fast_path_uses_cached_low_water_mark() {
    let page = Page::new(vec![value(12, 12), value(8, 8)]);
    let oracle = SnapshotOracle::new(20, 100).running(10);
    let mut ctx = ReconcileContext::new(&ReconcileOptions::new().visible_all(true), &oracle);

    let sel = page.select(&oracle, &mut ctx, None).unwrap();

    // Txn 12 committed in the snapshot but is not below the low-water mark.
    assert_eq!(sel.upd, Some(page.handles[1]));
    assert!(sel.has_newer_updates);
    assert_eq!(ctx.stats().max_txn, 12);
}

#[test]
fn tombstone_skips_aborted_nodes_before_ondisk_value() {
    let page = Page::new(vec![tombstone(50, 100), value(40, 90)]);
    page.arena.get(page.handles[1]).mark_aborted();
    let oracle = SnapshotOracle::new(200, 20);
    let mut ctx = ReconcileContext::new(&ReconcileOptions::new(), &oracle);
    let disk = ondisk((10, 10));

    let sel = page.select(&oracle, &mut ctx, Some(&disk)).unwrap();

    let nodes = page.nodes();
    assert_eq!(nodes.len(), 3);
    assert_eq!(nodes[2], (UpdateKind::Standard, 10, 10));
    assert_eq!(sel.tw.start(), (10, 10));
    assert_eq!(sel.tw.stop(), (50, 100));
    assert_eq!(ctx.stats().updates_seen, 1);
}

#[test]
fn tombstone_selects_the_value_it_deletes() {
    let page = Page::new(vec![tombstone(50, 100), value(30, 60)]);
    let oracle = SnapshotOracle::new(200, 20);
    let mut ctx = ReconcileContext::new(&ReconcileOptions::new(), &oracle);

    let sel = page.select(&oracle, &mut ctx, None).unwrap();

    assert_eq!(sel.upd, Some(page.handles[1]));
    assert_eq!(sel.tw.start(), (30, 60));
    assert_eq!(sel.tw.stop(), (50, 100));
    assert_eq!(ctx.stats().max_ondisk_ts, 100);
}

#[test]
fn lone_tombstone_without_ondisk_value_is_an_invariant_break() {
    let page = Page::new(vec![tombstone(50, 100)]);
    let oracle = SnapshotOracle::new(200, 20);
    let mut ctx = ReconcileContext::new(&ReconcileOptions::new(), &oracle);
    let err = page.select(&oracle, &mut ctx, None).unwrap_err();
    assert!(matches!(err, ReconcileError::Invariant(_)));

    let deleted = OnDiskValue::deleted(TimeWindow::new());
    let err = page.select(&oracle, &mut ctx, Some(&deleted)).unwrap_err();
    assert!(matches!(err, ReconcileError::Invariant(_)));
    assert_eq!(page.nodes().len(), 1);
}

#[test]
fn overflow_value_is_copied_even_without_saving() {
    // Start timestamp is globally visible, durable timestamp is not.
    let newer = Update::new(UpdateKind::Standard, Bytes::from_static(b"v50")).stamped(50, 100, 300);
    let oracle = SnapshotOracle::new(200, 200);
    let disk = ondisk((10, 10));

    let plain = Page::new(vec![newer]);
    let mut ctx = ReconcileContext::new(&ReconcileOptions::new().history_store(true), &oracle);
    let sel = plain.select(&oracle, &mut ctx, Some(&disk)).unwrap();
    assert!(!sel.saved);
    assert_eq!(plain.nodes().len(), 1);

    let newer = Update::new(UpdateKind::Standard, Bytes::from_static(b"v50")).stamped(50, 100, 300);
    let overflow = Page::new(vec![newer]);
    let disk = disk.with_overflow(true);
    let mut ctx = ReconcileContext::new(&ReconcileOptions::new().history_store(true), &oracle);
    let sel = overflow.select(&oracle, &mut ctx, Some(&disk)).unwrap();
    assert!(!sel.saved);
    assert_eq!(
        overflow.nodes(),
        vec![(UpdateKind::Standard, 50, 100), (UpdateKind::Standard, 10, 10)]
    );
}

#[test]
fn saved_update_copies_ondisk_value_onto_chain() {
    let page = Page::new(vec![value(50, 100)]);
    let oracle = SnapshotOracle::new(200, 20);
    let mut ctx = ReconcileContext::new(&ReconcileOptions::new().history_store(true), &oracle);
    let disk = ondisk((10, 10));

    let sel = page.select(&oracle, &mut ctx, Some(&disk)).unwrap();

    assert!(sel.saved);
    assert_eq!(ctx.saved().len(), 1);
    assert_eq!(
        page.nodes(),
        vec![(UpdateKind::Standard, 50, 100), (UpdateKind::Standard, 10, 10)]
    );
}

#[test]
fn metadata_checkpoint_update_needs_checkpoint_run() {
    let oracle = SnapshotOracle::new(200, 20).checkpoint(50);
    let page = Page::new(vec![value(50, 100)]);
    let mut ctx = ReconcileContext::new(&ReconcileOptions::new().metadata_page(true), &oracle);
    let err = page.select(&oracle, &mut ctx, None).unwrap_err();
    assert!(matches!(err, ReconcileError::Invariant(_)));

    let mut ctx = ReconcileContext::new(
        &ReconcileOptions::new().metadata_page(true).checkpoint(true),
        &oracle,
    );
    let sel = page.select(&oracle, &mut ctx, None).unwrap();
    assert_eq!(sel.upd, Some(page.handles[0]));
}

#[test]
fn selection_is_deterministic() {
    let run = || {
        let page = Page::new(vec![tombstone(50, 100), value(30, 60), value(20, 40)]);
        let oracle = SnapshotOracle::new(200, 20);
        let mut ctx = ReconcileContext::new(&ReconcileOptions::eviction(), &oracle);
        let sel = page.select(&oracle, &mut ctx, Some(&ondisk((10, 10)))).unwrap();
        (sel, *ctx.stats(), ctx.saved().to_vec(), page.nodes())
    };
    assert_eq!(run(), run());
}

#[test]
fn tombstone_over_tombstone_keeps_deleted_window() {
    let oracle = SnapshotOracle::new(200, TS_NONE);
    let disk = ondisk((5, 3));

    let page = Page::new(vec![tombstone(102, 145), tombstone(101, 145)]);
    let mut ctx = ReconcileContext::new(&ReconcileOptions::new(), &oracle);
    let sel = page.select(&oracle, &mut ctx, Some(&disk)).unwrap();
    assert_eq!(sel.upd, Some(page.handles[1]));
    assert_eq!(sel.tw.start(), (101, 145));
    assert_eq!(sel.tw.stop(), (102, 145));
    assert!(!sel.tw.is_out_of_order());
    assert!(!sel.saved);
    assert!(ctx.saved().is_empty());

    let page = Page::new(vec![tombstone(102, 145), tombstone(101, 145)]);
    let mut ctx = ReconcileContext::new(&ReconcileOptions::eviction(), &oracle);
    let sel = page.select(&oracle, &mut ctx, Some(&disk)).unwrap();
    assert!(sel.saved);
    let record = &ctx.saved()[0];
    assert_eq!(record.onpage, None);
    assert!(record.restore);
    assert!(ctx.cache_write_restore());
}

#[test]
fn lone_tombstone_keeps_ondisk_value_when_append_is_skipped() {
    init_tracing();
    let oracle = SnapshotOracle::new(200, 1);
    let disk = ondisk((10, 10));
    for options in [
        ReconcileOptions::new(),
        ReconcileOptions::new().history_store(true),
        ReconcileOptions::eviction(),
    ] {
        let page = Page::new(vec![
            tombstone(50, 100).with_flags(update_flags::RESTORED_FOR_ROLLBACK)
        ]);
        let mut ctx = ReconcileContext::new(&options, &oracle);

        let sel = page.select(&oracle, &mut ctx, Some(&disk)).unwrap();

        assert!(sel.upd.is_none());
        assert_eq!(sel.tw.start(), (10, 10));
        assert_eq!(sel.tw.stop(), (50, 100));
        assert_eq!(page.nodes().len(), 1);
        if options.eviction {
            assert!(sel.saved);
            assert_eq!(ctx.saved()[0].onpage, None);
            assert!(ctx.saved()[0].restore);
        } else {
            assert!(!sel.saved);
            assert!(ctx.saved().is_empty());
        }
    }
}

#[test]
fn globally_removed_ondisk_value_is_not_copied() {
    let page = Page::new(vec![value(60, 120)]);
    let oracle = SnapshotOracle::new(200, 95);
    let metrics = CounterMetrics::default();
    let mut ctx = ReconcileContext::new(&ReconcileOptions::new().history_store(true), &oracle);
    let disk = OnDiskValue::new(
        Bytes::from_static(b"disk"),
        TimeWindow::with_bounds((10, 10), (40, 90)),
    );

    let sel = RecSession::new(&page.arena, &oracle)
        .with_metrics(&metrics)
        .select(&mut ctx, SlotLocator::Slot(0), &page.chain, Some(&disk))
        .unwrap();

    assert!(sel.saved);
    assert_eq!(page.nodes().len(), 1);
    assert_eq!(
        metrics
            .orig_value_appends
            .load(std::sync::atomic::Ordering::Relaxed),
        0
    );
    let outcome =
        append_orig_value(&RecSession::new(&page.arena, &oracle), page.handles[0], &disk).unwrap();
    assert_eq!(outcome, AppendOutcome::Skipped(SkipReason::StopVisibleToAll));
}

#[test]
fn fixed_length_and_in_memory_evictions_restore() {
    let oracle = SnapshotOracle::new(200, 20);
    for options in [
        ReconcileOptions::new().evict(true).page_kind(PageKind::ColumnFix),
        ReconcileOptions::new().evict(true).in_memory(true),
    ] {
        let page = Page::new(vec![value(50, 100)]);
        let mut ctx = ReconcileContext::new(&options, &oracle);
        let sel = page.select(&oracle, &mut ctx, None).unwrap();
        assert!(sel.saved);
        assert_eq!(ctx.saved()[0].onpage, Some(page.handles[0]));
        assert!(ctx.saved()[0].restore);
        assert!(ctx.cache_write_restore());
    }

    let page = Page::new(vec![value(50, 100)]);
    let mut ctx = ReconcileContext::new(
        &ReconcileOptions::new().page_kind(PageKind::ColumnFix),
        &oracle,
    );
    let sel = page.select(&oracle, &mut ctx, None).unwrap();
    assert!(sel.saved);
    assert!(!ctx.saved()[0].restore);
}

#[test]
fn selected_modify_is_written_and_backed_by_ondisk_value() {
    let delta = Update::new(UpdateKind::Modify, Bytes::from_static(b"+1")).stamped(50, 100, 100);
    let page = Page::new(vec![delta, value(30, 60)]);
    let oracle = SnapshotOracle::new(200, 20);
    let mut ctx = ReconcileContext::new(&ReconcileOptions::new().history_store(true), &oracle);

    let sel = page.select(&oracle, &mut ctx, Some(&ondisk((10, 10)))).unwrap();

    assert_eq!(sel.upd, Some(page.handles[0]));
    assert_eq!(sel.tw.start(), (50, 100));
    assert!(sel.saved);
    assert_eq!(ctx.saved()[0].onpage, Some(page.handles[0]));
    assert_eq!(
        page.nodes(),
        vec![
            (UpdateKind::Modify, 50, 100),
            (UpdateKind::Standard, 30, 60),
            (UpdateKind::Standard, 10, 10)
        ]
    );
}
