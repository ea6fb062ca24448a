#![allow(missing_docs)]

use bytes::Bytes;
use proptest::prelude::*;
use sombra_reconcile::reconcile::{
    OnDiskValue, RecSession, ReconcileContext, ReconcileOptions, RunStats, SlotLocator,
    SnapshotOracle, TimeWindow, Update, UpdateArena, UpdateChain, UpdateKind, UpdateRef,
    UpdateSelection,
};
use sombra_reconcile::types::{ReconcileError, TS_MAX, TXN_MAX};

const ONDISK_START: (u64, u64) = (5, 3);

#[derive(Debug, Clone)]
struct NodeSpec {
    tombstone: bool,
    committed: bool,
    aborted: bool,
    ts: u64,
}

#[derive(Debug, Clone)]
struct RunSpec {
    evict: bool,
    visible_all: bool,
    history_store: bool,
    checkpoint: bool,
    pinned_ts: u64,
}

fn arb_node() -> impl Strategy<Value = NodeSpec> {
    (any::<bool>(), prop::bool::weighted(0.8), prop::bool::weighted(0.2), 1u64..200).prop_map(
        |(tombstone, committed, aborted, ts)| NodeSpec {
            tombstone,
            committed,
            aborted,
            ts,
        },
    )
}

fn arb_run() -> impl Strategy<Value = RunSpec> {
    (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>(), 0u64..200).prop_map(
        |(evict, visible_all, history_store, checkpoint, pinned_ts)| RunSpec {
            evict,
            visible_all,
            history_store,
            checkpoint,
            pinned_ts,
        },
    )
}

struct Outcome {
    result: Result<UpdateSelection, ReconcileError>,
    stats: RunStats,
    leave_dirty: bool,
    original: Vec<UpdateRef>,
    nodes: Vec<(UpdateRef, UpdateKind, u64, u64)>,
}

/// Builds a chain from `nodes` (newest first) and runs one selection over it.
fn run(nodes: &[NodeSpec], run: &RunSpec) -> Outcome {
    let arena = UpdateArena::new();
    let chain = UpdateChain::new();
    let mut oracle = SnapshotOracle::new(1_000, run.pinned_ts);
    let mut original = Vec::new();
    for (pos, spec) in nodes.iter().enumerate().rev() {
        let txn = 100 + (nodes.len() - pos) as u64;
        let upd = if spec.tombstone {
            Update::tombstone()
        } else {
            Update::new(UpdateKind::Standard, Bytes::from(format!("v{txn}")))
        }
        .stamped(txn, spec.ts, spec.ts);
        let handle = chain.prepend(&arena, upd).unwrap();
        if spec.aborted {
            arena.get(handle).mark_aborted();
        }
        if !spec.committed {
            oracle = oracle.running(txn);
        }
        original.push(handle);
    }

    let options = ReconcileOptions::new()
        .evict(run.evict)
        .visible_all(run.visible_all)
        .history_store(run.history_store)
        .checkpoint(run.checkpoint);
    let mut ctx = ReconcileContext::new(&options, &oracle);
    let ondisk = OnDiskValue::new(
        Bytes::from_static(b"disk"),
        TimeWindow::with_bounds(ONDISK_START, (TXN_MAX, TS_MAX)),
    );
    let result = RecSession::new(&arena, &oracle).select(
        &mut ctx,
        SlotLocator::Slot(7),
        &chain,
        Some(&ondisk),
    );
    let nodes = chain
        .iter(&arena)
        .map(|(handle, upd)| (handle, upd.kind(), upd.txn_id(), upd.start_ts()))
        .collect();
    Outcome {
        result,
        stats: *ctx.stats(),
        leave_dirty: ctx.leave_dirty(),
        original,
        nodes,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn prop_selection_is_deterministic(
        nodes in prop::collection::vec(arb_node(), 0..8),
        spec in arb_run()
    ) {
        let first = run(&nodes, &spec);
        let second = run(&nodes, &spec);
        prop_assert_eq!(format!("{:?}", first.result), format!("{:?}", second.result));
        prop_assert_eq!(first.stats, second.stats);
        prop_assert_eq!(first.leave_dirty, second.leave_dirty);
        prop_assert_eq!(first.nodes, second.nodes);
    }

    #[test]
    fn prop_window_is_never_out_of_order(
        nodes in prop::collection::vec(arb_node(), 1..8),
        spec in arb_run()
    ) {
        let outcome = run(&nodes, &spec);
        match outcome.result {
            Ok(sel) => {
                if sel.upd.is_some() {
                    prop_assert!(!sel.tw.is_out_of_order());
                }
                if sel.has_newer_updates {
                    prop_assert!(outcome.leave_dirty);
                }
            }
            Err(err) => {
                prop_assert!(matches!(err, ReconcileError::Busy(_)), "unexpected {:?}", err);
                prop_assert!(spec.evict);
            }
        }
    }

    #[test]
    fn prop_appended_selection_carries_ondisk_start(
        nodes in prop::collection::vec(arb_node(), 1..8),
        spec in arb_run()
    ) {
        let outcome = run(&nodes, &spec);
        if let Ok(UpdateSelection { upd: Some(handle), tw, .. }) = outcome.result {
            if !outcome.original.contains(&handle) {
                prop_assert_eq!(tw.start(), ONDISK_START);
                let position = outcome.nodes.iter().position(|node| node.0 == handle);
                prop_assert!(position.is_some());
                let (_, kind, txn, ts) = outcome.nodes[position.unwrap()];
                prop_assert_eq!(kind, UpdateKind::Standard);
                prop_assert_eq!((txn, ts), ONDISK_START);
            }
        }
        prop_assert!(outcome.nodes.len() <= outcome.original.len() + 2);
    }
}
