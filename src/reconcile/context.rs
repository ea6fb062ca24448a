use serde::Serialize;

use crate::reconcile::chain::{UpdateArena, UpdateRef};
use crate::reconcile::metrics::{NoopMetrics, ReconcileMetrics};
use crate::reconcile::options::{mode, PageDesc, ReconcileOptions, RunMode};
use crate::reconcile::oracle::Visibility;
use crate::reconcile::update::{HeapAllocator, MemoryAccounting, NoopAccounting, UpdateAllocator};
use crate::types::{ReconcileError, Result, Timestamp, TxnId, TS_MAX, TS_NONE, TXN_NONE};

static HEAP: HeapAllocator = HeapAllocator;
static NO_ACCOUNTING: NoopAccounting = NoopAccounting;
static NO_METRICS: NoopMetrics = NoopMetrics;

/// Locates a key's update list within the page.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotLocator {
    /// Entry in an insert list, by position.
    Insert(u32),
    /// On-page row or column slot.
    Slot(u32),
}

/// Record that a key's older versions must survive the page rewrite.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SavedUpdate {
    /// Key the record belongs to.
    pub slot: SlotLocator,
    /// Value written to the page image, if any.
    pub onpage: Option<UpdateRef>,
    /// The chain must be restored into memory after the rewrite.
    pub restore: bool,
    /// Memory held by the chain's live nodes.
    pub memsize: usize,
}

/// Counters and maxima accumulated over one run.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct RunStats {
    /// Non-aborted updates visited.
    pub updates_seen: u64,
    /// Updates found unstable during eviction.
    pub updates_unstable: u64,
    /// Largest transaction id among visited updates.
    pub max_txn: TxnId,
    /// Largest timestamp among selectable or skipped-prepared updates.
    pub max_ts: Timestamp,
    /// Largest start timestamp of an update chosen for the page image.
    pub max_ondisk_ts: Timestamp,
    /// Oldest start timestamp of a prepared update left off the page.
    pub min_skipped_ts: Timestamp,
}

impl Default for RunStats {
    fn default() -> Self {
        Self {
            updates_seen: 0,
            updates_unstable: 0,
            max_txn: TXN_NONE,
            max_ts: TS_NONE,
            max_ondisk_ts: TS_NONE,
            min_skipped_ts: TS_MAX,
        }
    }
}

/// State owned by one page reconciliation attempt.
#[derive(Debug)]
pub struct ReconcileContext {
    mode: RunMode,
    page: PageDesc,
    last_running: TxnId,
    stats: RunStats,
    leave_dirty: bool,
    cache_write_restore: bool,
    saved: Vec<SavedUpdate>,
    saved_memsize: usize,
}

impl ReconcileContext {
    /// Starts a run, caching the oracle's running low-water mark.
    pub fn new(options: &ReconcileOptions, oracle: &dyn Visibility) -> Self {
        Self::with_mode(
            options.run_mode(),
            options.page(),
            oracle.running_low_water_mark(),
        )
    }

    /// Starts a run from raw mode bits.
    pub fn with_mode(mode: RunMode, page: PageDesc, last_running: TxnId) -> Self {
        Self {
            mode,
            page,
            last_running,
            stats: RunStats::default(),
            leave_dirty: false,
            cache_write_restore: false,
            saved: Vec::new(),
            saved_memsize: 0,
        }
    }

    /// Mode bits of the run.
    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Attributes of the page being reconciled.
    pub fn page(&self) -> PageDesc {
        self.page
    }

    /// Running low-water mark cached at the start of the run.
    pub fn last_running(&self) -> TxnId {
        self.last_running
    }

    /// Counters and maxima so far.
    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut RunStats {
        &mut self.stats
    }

    /// Some update was left behind, so the page stays dirty.
    pub fn leave_dirty(&self) -> bool {
        self.leave_dirty
    }

    pub(crate) fn set_leave_dirty(&mut self) {
        self.leave_dirty = true;
    }

    /// Some saved record must be restored into memory.
    pub fn cache_write_restore(&self) -> bool {
        self.cache_write_restore
    }

    /// Saved-update records, in the order they were produced.
    pub fn saved(&self) -> &[SavedUpdate] {
        &self.saved
    }

    /// Memory held by all saved chains.
    pub fn saved_memsize(&self) -> usize {
        self.saved_memsize
    }

    /// Returns `true` when the run may treat `txn` as committed.
    pub(crate) fn commit_visible(&self, oracle: &dyn Visibility, txn: TxnId) -> bool {
        if self.mode.visible_all() {
            txn < self.last_running
        } else {
            oracle.commit_is_visible(txn)
        }
    }

    /// Returns `true` when newer invisible updates must abort the run.
    pub(crate) fn rejects_dirty(&self) -> bool {
        self.mode.any(mode::CLEAN_AFTER_REC | mode::VISIBILITY_ERR)
    }

    /// Returns `true` when invisible updates are fatal.
    pub(crate) fn visibility_err(&self) -> bool {
        self.mode.any(mode::VISIBILITY_ERR)
    }

    pub(crate) fn push_saved(&mut self, record: SavedUpdate) -> Result<()> {
        self.saved
            .try_reserve(1)
            .map_err(|_| ReconcileError::ResourceExhausted("saved update list"))?;
        if record.restore {
            self.cache_write_restore = true;
        }
        self.saved_memsize += record.memsize;
        self.saved.push(record);
        Ok(())
    }
}

/// Collaborators shared by every selection of a run.
#[derive(Clone, Copy)]
pub struct RecSession<'a> {
    /// Arena holding the page's update nodes.
    pub arena: &'a UpdateArena,
    /// Transaction visibility.
    pub oracle: &'a dyn Visibility,
    /// Node allocator.
    pub alloc: &'a dyn UpdateAllocator,
    /// Resident-size tracker of the page.
    pub memory: &'a dyn MemoryAccounting,
    /// Metrics sink.
    pub metrics: &'a dyn ReconcileMetrics,
}

impl<'a> RecSession<'a> {
    /// Session with heap allocation and no accounting or metrics.
    pub fn new(arena: &'a UpdateArena, oracle: &'a dyn Visibility) -> Self {
        Self {
            arena,
            oracle,
            alloc: &HEAP,
            memory: &NO_ACCOUNTING,
            metrics: &NO_METRICS,
        }
    }

    /// Replaces the allocator.
    pub fn with_allocator(mut self, alloc: &'a dyn UpdateAllocator) -> Self {
        self.alloc = alloc;
        self
    }

    /// Replaces the memory accounting sink.
    pub fn with_memory(mut self, memory: &'a dyn MemoryAccounting) -> Self {
        self.memory = memory;
        self
    }

    /// Replaces the metrics sink.
    pub fn with_metrics(mut self, metrics: &'a dyn ReconcileMetrics) -> Self {
        self.metrics = metrics;
        self
    }
}
