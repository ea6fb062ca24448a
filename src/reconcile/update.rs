use std::mem;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::reconcile::chain::UpdateRef;
use crate::types::{Result, Timestamp, TxnId, TXN_ABORTED};

/// Update node flags.
pub mod flags {
    /// Node was restored from the version store by a rollback-to-stable pass.
    pub const RESTORED_FOR_ROLLBACK: u8 = 0x01;
}

/// Kind of write an update node represents.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// Full value.
    Standard,
    /// Delete marker.
    Tombstone,
    /// Delta against an older value.
    Modify,
    /// Placeholder held by a transaction that has not written yet.
    Reserve,
}

impl UpdateKind {
    /// Returns `true` for kinds that need no older node to be interpreted.
    pub fn is_self_contained(self) -> bool {
        matches!(self, UpdateKind::Standard | UpdateKind::Tombstone)
    }
}

/// Prepare state of the transaction that wrote an update.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrepareState {
    /// Ordinary update.
    None = 0,
    /// The prepared transaction is being resolved right now.
    Locked = 1,
    /// Prepared and waiting for commit or rollback.
    InProgress = 2,
    /// Prepared transaction has committed.
    Resolved = 3,
}

impl PrepareState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => PrepareState::Locked,
            2 => PrepareState::InProgress,
            3 => PrepareState::Resolved,
            _ => PrepareState::None,
        }
    }

    /// Returns `true` while the prepared transaction's outcome is undecided.
    pub fn is_pending(self) -> bool {
        matches!(self, PrepareState::Locked | PrepareState::InProgress)
    }
}

/// One pending write in a key's update chain.
///
/// Everything except the transaction id, the prepare state and the `next`
/// link is fixed at construction. The transaction id only ever moves to
/// [`TXN_ABORTED`].
#[derive(Debug)]
pub struct Update {
    txn_id: AtomicU64,
    start_ts: Timestamp,
    durable_ts: Timestamp,
    kind: UpdateKind,
    prepare_state: AtomicU8,
    flags: u8,
    value: Bytes,
    next: AtomicU32,
}

impl Update {
    /// Creates a detached update holding `value`.
    pub fn new(kind: UpdateKind, value: Bytes) -> Self {
        Self {
            txn_id: AtomicU64::new(0),
            start_ts: 0,
            durable_ts: 0,
            kind,
            prepare_state: AtomicU8::new(PrepareState::None as u8),
            flags: 0,
            value,
            next: AtomicU32::new(0),
        }
    }

    /// Creates a detached tombstone.
    pub fn tombstone() -> Self {
        Self::new(UpdateKind::Tombstone, Bytes::new())
    }

    /// Stamps the writing transaction and its commit/durable timestamps.
    pub fn stamped(self, txn_id: TxnId, start_ts: Timestamp, durable_ts: Timestamp) -> Self {
        self.txn_id.store(txn_id, Ordering::Relaxed);
        Self {
            start_ts,
            durable_ts,
            ..self
        }
    }

    /// Sets the initial prepare state.
    pub fn with_prepare(self, state: PrepareState) -> Self {
        self.prepare_state.store(state as u8, Ordering::Relaxed);
        self
    }

    /// Adds node flags (see [`flags`]).
    pub fn with_flags(mut self, bits: u8) -> Self {
        self.flags |= bits;
        self
    }

    /// Current transaction id; may read as [`TXN_ABORTED`] at any point.
    pub fn txn_id(&self) -> TxnId {
        self.txn_id.load(Ordering::Acquire)
    }

    /// Returns `true` if the writing transaction rolled back.
    pub fn is_aborted(&self) -> bool {
        self.txn_id() == TXN_ABORTED
    }

    /// Marks the update as rolled back. Irreversible.
    pub fn mark_aborted(&self) {
        self.txn_id.store(TXN_ABORTED, Ordering::Release);
    }

    /// Commit timestamp.
    pub fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    /// Durable timestamp.
    pub fn durable_ts(&self) -> Timestamp {
        self.durable_ts
    }

    /// Kind of write.
    pub fn kind(&self) -> UpdateKind {
        self.kind
    }

    /// Returns `true` for tombstones.
    pub fn is_tombstone(&self) -> bool {
        self.kind == UpdateKind::Tombstone
    }

    /// Current prepare state.
    pub fn prepare_state(&self) -> PrepareState {
        PrepareState::from_u8(self.prepare_state.load(Ordering::Acquire))
    }

    /// Moves a prepared update to `state`.
    pub fn set_prepare_state(&self, state: PrepareState) {
        self.prepare_state.store(state as u8, Ordering::Release);
    }

    /// Returns `true` when any of `bits` is set.
    pub fn has_flag(&self, bits: u8) -> bool {
        self.flags & bits != 0
    }

    /// Payload bytes (empty for tombstones).
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    /// Bytes this node accounts against its page.
    pub fn memsize(&self) -> usize {
        mem::size_of::<Update>() + self.value.len()
    }

    /// Next-older update, if one has been published.
    pub fn next(&self) -> Option<UpdateRef> {
        UpdateRef::from_raw(self.next.load(Ordering::Acquire))
    }

    pub(crate) fn link_next(&self, next: Option<UpdateRef>) {
        self.next
            .store(next.map_or(0, UpdateRef::raw), Ordering::Release);
    }

    /// Publishes `next` if this node is still the tail. Returns `false` when
    /// another node was already linked.
    pub(crate) fn publish_next(&self, next: UpdateRef) -> bool {
        self.next
            .compare_exchange(0, next.raw(), Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }
}

/// Constructs detached update nodes. Allocation may fail.
pub trait UpdateAllocator: Send + Sync {
    /// Builds a value-bearing node of `kind` holding `value`.
    fn new_update(&self, value: Bytes, kind: UpdateKind) -> Result<Update>;

    /// Builds a tombstone node.
    fn new_tombstone(&self) -> Result<Update>;
}

/// Allocator backed by the global heap.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapAllocator;

impl UpdateAllocator for HeapAllocator {
    fn new_update(&self, value: Bytes, kind: UpdateKind) -> Result<Update> {
        Ok(Update::new(kind, value))
    }

    fn new_tombstone(&self) -> Result<Update> {
        Ok(Update::tombstone())
    }
}

/// Receives notifications about bytes attached to a page's update structures.
pub trait MemoryAccounting: Send + Sync {
    /// Records `bytes` of additional resident memory.
    fn add(&self, bytes: usize);
}

/// Accounting sink that ignores everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopAccounting;

impl MemoryAccounting for NoopAccounting {
    fn add(&self, _bytes: usize) {}
}

/// Atomic resident-size counter for a single page.
#[derive(Debug, Default)]
pub struct PageFootprint {
    bytes: AtomicUsize,
}

impl PageFootprint {
    /// Bytes recorded so far.
    pub fn bytes(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl MemoryAccounting for PageFootprint {
    fn add(&self, bytes: usize) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }
}
