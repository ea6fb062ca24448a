use bytes::Bytes;

use crate::reconcile::time_window::TimeWindow;

/// Kind of the cell previously written for a key.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CellKind {
    /// A value cell.
    Value,
    /// A deleted cell; there is no value to preserve.
    Deleted,
}

/// Read-only description of the value persisted by an earlier reconciliation.
#[derive(Clone, Debug)]
pub struct OnDiskValue {
    /// Validity window written with the value.
    pub tw: TimeWindow,
    /// Cell kind.
    pub kind: CellKind,
    /// Value bytes.
    pub value: Bytes,
    /// The bytes live in overflow blocks outside the page image.
    pub overflow: bool,
}

impl OnDiskValue {
    /// Describes an ordinary on-page value.
    pub fn new(value: impl Into<Bytes>, tw: TimeWindow) -> Self {
        Self {
            tw,
            kind: CellKind::Value,
            value: value.into(),
            overflow: false,
        }
    }

    /// Describes a deleted cell.
    pub fn deleted(tw: TimeWindow) -> Self {
        Self {
            tw,
            kind: CellKind::Deleted,
            value: Bytes::new(),
            overflow: false,
        }
    }

    /// Marks the value as stored in overflow blocks.
    pub fn with_overflow(mut self, overflow: bool) -> Self {
        self.overflow = overflow;
        self
    }

    /// The value was written by a prepared transaction.
    pub fn is_prepared(&self) -> bool {
        self.tw.prepare
    }

    /// The cell carries a value.
    pub fn has_value(&self) -> bool {
        self.kind == CellKind::Value
    }
}
