use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use smallvec::SmallVec;

use crate::reconcile::update::Update;
use crate::types::{ReconcileError, Result};

/// Stable handle to an update stored in an [`UpdateArena`].
///
/// The raw value is the slot index plus one so that zero can stand for a
/// null link.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(transparent)]
pub struct UpdateRef(NonZeroU32);

impl UpdateRef {
    /// Decodes a raw link value; zero means no update.
    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }

    /// Returns the raw link value.
    pub fn raw(self) -> u32 {
        self.0.get()
    }

    fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }
}

/// Append-only storage for a page's update nodes.
///
/// Nodes are never removed or moved once inserted, so handles stay valid for
/// the arena's lifetime.
#[derive(Debug, Default)]
pub struct UpdateArena {
    slots: RwLock<Vec<Arc<Update>>>,
}

impl UpdateArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes ever inserted.
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Returns `true` if no node was inserted.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the node behind `handle`.
    ///
    /// # Panics
    ///
    /// Panics if `handle` was produced by a different arena. Walks over
    /// caller-built chains go through [`UpdateArena::try_get`].
    pub fn get(&self, handle: UpdateRef) -> Arc<Update> {
        Arc::clone(&self.slots.read()[handle.index()])
    }

    /// Returns the node behind `handle`, or `None` if the handle lies outside
    /// this arena.
    pub fn try_get(&self, handle: UpdateRef) -> Option<Arc<Update>> {
        self.slots.read().get(handle.index()).cloned()
    }

    /// Like [`UpdateArena::try_get`], reporting a foreign handle as an
    /// invariant break.
    pub(crate) fn resolve(&self, handle: UpdateRef) -> Result<Arc<Update>> {
        self.try_get(handle)
            .ok_or(ReconcileError::Invariant("chain link outside the update arena"))
    }

    /// Inserts one node and returns its handle.
    pub fn insert(&self, update: Update) -> Result<UpdateRef> {
        let handles = self.insert_batch([update])?;
        Ok(handles[0])
    }

    /// Inserts every node or none of them.
    ///
    /// Inserted nodes are not reachable from any chain until a caller links
    /// them.
    pub fn insert_batch<I>(&self, updates: I) -> Result<SmallVec<[UpdateRef; 2]>>
    where
        I: IntoIterator<Item = Update>,
        I::IntoIter: ExactSizeIterator,
    {
        let updates = updates.into_iter();
        let count = updates.len();
        let mut slots = self.slots.write();
        let base = slots.len();
        if base + count >= u32::MAX as usize {
            return Err(ReconcileError::ResourceExhausted("update arena handle space"));
        }
        slots
            .try_reserve(count)
            .map_err(|_| ReconcileError::ResourceExhausted("update arena growth"))?;
        let mut handles = SmallVec::with_capacity(count);
        for (offset, update) in updates.enumerate() {
            slots.push(Arc::new(update));
            let raw = (base + offset + 1) as u32;
            if let Some(handle) = UpdateRef::from_raw(raw) {
                handles.push(handle);
            }
        }
        Ok(handles)
    }
}

/// Newest-first update list for one key.
///
/// Writers prepend at the head; reconciliation appends at the tail. Neither
/// takes a lock on the chain.
#[derive(Debug, Default)]
pub struct UpdateChain {
    head: AtomicU32,
}

impl UpdateChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current newest update.
    pub fn head(&self) -> Option<UpdateRef> {
        UpdateRef::from_raw(self.head.load(Ordering::Acquire))
    }

    /// Inserts `update` into `arena` and publishes it as the new head.
    pub fn prepend(&self, arena: &UpdateArena, update: Update) -> Result<UpdateRef> {
        let handle = arena.insert(update)?;
        let node = arena.get(handle);
        let mut current = self.head.load(Ordering::Acquire);
        loop {
            node.link_next(UpdateRef::from_raw(current));
            match self.head.compare_exchange_weak(
                current,
                handle.raw(),
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(handle),
                Err(actual) => current = actual,
            }
        }
    }

    /// Walks the chain newest to oldest, starting from the current head.
    pub fn iter<'a>(&self, arena: &'a UpdateArena) -> ChainIter<'a> {
        ChainIter::new(arena, self.head())
    }
}

/// Forward iterator over a chain, yielding handles with their nodes.
///
/// A link pointing outside the arena ends the walk early; check
/// [`ChainIter::dangling`] afterwards.
pub struct ChainIter<'a> {
    arena: &'a UpdateArena,
    cursor: Option<UpdateRef>,
    dangling: Option<UpdateRef>,
}

impl<'a> ChainIter<'a> {
    /// Starts a walk at `from`.
    pub fn new(arena: &'a UpdateArena, from: Option<UpdateRef>) -> Self {
        Self {
            arena,
            cursor: from,
            dangling: None,
        }
    }

    /// Handle that stopped the walk because the arena does not hold it.
    pub fn dangling(&self) -> Option<UpdateRef> {
        self.dangling
    }

    /// Fails if the walk stopped on a foreign handle.
    pub(crate) fn finish(&self) -> Result<()> {
        match self.dangling {
            Some(_) => Err(ReconcileError::Invariant("chain link outside the update arena")),
            None => Ok(()),
        }
    }
}

impl Iterator for ChainIter<'_> {
    type Item = (UpdateRef, Arc<Update>);

    fn next(&mut self) -> Option<Self::Item> {
        let handle = self.cursor.take()?;
        let Some(node) = self.arena.try_get(handle) else {
            self.dangling = Some(handle);
            return None;
        };
        self.cursor = node.next();
        Some((handle, node))
    }
}

/// Fails unless `tail` still ends its chain.
pub(crate) fn ensure_tail(tail: &Update) -> Result<()> {
    match tail.next() {
        Some(_) => Err(ReconcileError::Invariant("tail append raced with another append")),
        None => Ok(()),
    }
}

/// Links `first..` after `tail`, which must still be the chain's tail.
///
/// The appended nodes must be fully built and internally linked before this
/// call; the single release store on `tail` is what makes them reachable.
pub(crate) fn publish_after(tail: &Update, first: UpdateRef) -> Result<()> {
    if tail.publish_next(first) {
        Ok(())
    } else {
        Err(ReconcileError::Invariant("tail append raced with another append"))
    }
}
