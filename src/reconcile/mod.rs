//! Update selection for page reconciliation.
//!
//! Given a key's newest-first update chain, decides which version goes into
//! the page image, the window in which it is valid, and whether older
//! versions must be preserved in the version store or restored to memory.

/// Arena storage and lock-free chain links.
pub mod chain;

/// Per-run state and shared collaborators.
pub mod context;

/// Selection metrics.
pub mod metrics;

/// Run options and mode bits.
pub mod options;

/// Transaction visibility.
pub mod oracle;

/// On-disk value appender.
pub mod orig_value;

mod ondisk;
mod save;
mod select;
mod time_window;
mod update;

pub use chain::{ChainIter, UpdateArena, UpdateChain, UpdateRef};
pub use context::{ReconcileContext, RecSession, RunStats, SavedUpdate, SlotLocator};
pub use metrics::{default_metrics, CounterMetrics, NoopMetrics, ReconcileMetrics};
pub use ondisk::{CellKind, OnDiskValue};
pub use options::{mode, PageDesc, PageKind, ReconcileOptions, RunMode};
pub use oracle::{update_stable, update_visible_all, SnapshotOracle, Visibility};
pub use orig_value::{append_orig_value, AppendOutcome, SkipReason};
pub use save::{need_save_update, restore_required};
pub use select::{select_update, UpdateSelection};
pub use time_window::TimeWindow;
pub use update::{
    flags as update_flags, HeapAllocator, MemoryAccounting, NoopAccounting, PageFootprint,
    PrepareState, Update, UpdateAllocator, UpdateKind,
};
