use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Hooks for observing update selection.
///
/// Implementations must be cheap; they are called from the per-key path of
/// every page reconciliation.
pub trait ReconcileMetrics: Send + Sync {
    /// A selection finished, with or without a chosen update.
    fn selection(&self, selected: bool);

    /// The walk gave up with a retryable busy condition.
    fn busy(&self);

    /// The on-disk value was appended to a chain.
    ///
    /// # Parameters
    /// * `nodes` - Number of nodes linked (one or two).
    /// * `bytes` - Memory charged to the page.
    fn orig_value_appended(&self, nodes: usize, bytes: usize);

    /// A saved-update record was emitted.
    fn update_saved(&self, restore: bool);

    /// An out-of-order time window was normalized.
    fn out_of_order_fixed(&self);
}

/// Discards every observation.
#[derive(Default)]
pub struct NoopMetrics;

impl ReconcileMetrics for NoopMetrics {
    fn selection(&self, _selected: bool) {}
    fn busy(&self) {}
    fn orig_value_appended(&self, _nodes: usize, _bytes: usize) {}
    fn update_saved(&self, _restore: bool) {}
    fn out_of_order_fixed(&self) {}
}

/// Atomic counters for every [`ReconcileMetrics`] hook.
#[derive(Default)]
pub struct CounterMetrics {
    /// Selections that chose an update.
    pub selected: AtomicU64,

    /// Selections that chose nothing.
    pub empty: AtomicU64,

    /// Busy aborts.
    pub busy: AtomicU64,

    /// Orig-value appends.
    pub orig_value_appends: AtomicU64,

    /// Nodes linked by orig-value appends.
    pub orig_value_nodes: AtomicU64,

    /// Bytes charged by orig-value appends.
    pub orig_value_bytes: AtomicU64,

    /// Saved records that restore updates to memory.
    pub saved_restore: AtomicU64,

    /// Saved records written out to the version store.
    pub saved_write: AtomicU64,

    /// Time windows fixed for out-of-order timestamps.
    pub out_of_order: AtomicU64,
}

impl ReconcileMetrics for CounterMetrics {
    fn selection(&self, selected: bool) {
        if selected {
            self.selected.fetch_add(1, Ordering::Relaxed);
        } else {
            self.empty.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn busy(&self) {
        self.busy.fetch_add(1, Ordering::Relaxed);
    }

    fn orig_value_appended(&self, nodes: usize, bytes: usize) {
        self.orig_value_appends.fetch_add(1, Ordering::Relaxed);
        self.orig_value_nodes
            .fetch_add(nodes as u64, Ordering::Relaxed);
        self.orig_value_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn update_saved(&self, restore: bool) {
        if restore {
            self.saved_restore.fetch_add(1, Ordering::Relaxed);
        } else {
            self.saved_write.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn out_of_order_fixed(&self) {
        self.out_of_order.fetch_add(1, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation, [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn ReconcileMetrics> {
    Arc::new(NoopMetrics)
}
