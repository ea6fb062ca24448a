use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{ReconcileError, Result};

/// Run mode bits.
pub mod mode {
    /// The run frees memory by evicting the page.
    pub const EVICT: u16 = 0x0001;
    /// The run is writing a checkpoint.
    pub const CHECKPOINT: u16 = 0x0002;
    /// The database lives only in memory.
    pub const IN_MEMORY: u16 = 0x0004;
    /// History may be written to the auxiliary version store.
    pub const HISTORY_STORE: u16 = 0x0008;
    /// Use the cached low-water mark instead of per-node snapshot checks.
    pub const VISIBLE_ALL: u16 = 0x0010;
    /// The caller expects the page to be clean afterwards.
    pub const CLEAN_AFTER_REC: u16 = 0x0020;
    /// Treat any invisible update as a correctness violation.
    pub const VISIBILITY_ERR: u16 = 0x0040;
}

/// Set of [`mode`] bits for one reconciliation run.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RunMode(u16);

impl RunMode {
    /// Wraps raw mode bits.
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Raw mode bits.
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Returns `true` when any of `bits` is set.
    pub const fn any(self, bits: u16) -> bool {
        self.0 & bits != 0
    }

    /// Eviction run.
    pub const fn evict(self) -> bool {
        self.any(mode::EVICT)
    }

    /// Checkpoint run.
    pub const fn checkpoint(self) -> bool {
        self.any(mode::CHECKPOINT)
    }

    /// In-memory database.
    pub const fn in_memory(self) -> bool {
        self.any(mode::IN_MEMORY)
    }

    /// Run may write to the auxiliary version store.
    pub const fn history_store(self) -> bool {
        self.any(mode::HISTORY_STORE)
    }

    /// Visible-to-all fast path.
    pub const fn visible_all(self) -> bool {
        self.any(mode::VISIBLE_ALL)
    }
}

/// Layout of the page being reconciled.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    /// Row store leaf.
    #[default]
    Row,
    /// Variable-length column store leaf.
    ColumnVar,
    /// Fixed-length column store leaf; has no home in the version store.
    ColumnFix,
}

/// Page attributes that influence selection.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PageDesc {
    /// Page layout.
    pub kind: PageKind,
    /// The page belongs to the auxiliary version store itself.
    pub history_store: bool,
    /// The page belongs to the metadata table.
    pub metadata: bool,
}

/// Per-run reconciliation options, loadable from TOML.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcileOptions {
    /// Run is an eviction.
    pub eviction: bool,
    /// Run is a checkpoint.
    pub checkpoint: bool,
    /// Database is in-memory only.
    pub in_memory: bool,
    /// Run may write history to the auxiliary version store.
    pub history_store: bool,
    /// Use the visible-to-all fast path.
    pub visible_all: bool,
    /// Expect a clean page after reconciliation.
    pub clean_after_rec: bool,
    /// Treat invisible updates as fatal.
    pub visibility_err: bool,
    /// Page layout.
    pub page_kind: PageKind,
    /// Page belongs to the version store.
    pub history_store_page: bool,
    /// Page belongs to the metadata table.
    pub metadata_page: bool,
}

impl ReconcileOptions {
    /// Options for an ordinary write of a row-store page.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options for an eviction that may write history.
    pub fn eviction() -> Self {
        Self::new().evict(true).history_store(true)
    }

    /// Options for a checkpoint that may write history.
    pub fn checkpointing() -> Self {
        Self::new().checkpoint(true).history_store(true)
    }

    /// Parses options from a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| ReconcileError::Config(err.to_string()))
    }

    /// Reads options from a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Sets the eviction flag.
    pub fn evict(mut self, enabled: bool) -> Self {
        self.eviction = enabled;
        self
    }

    /// Sets the checkpoint flag.
    pub fn checkpoint(mut self, enabled: bool) -> Self {
        self.checkpoint = enabled;
        self
    }

    /// Sets the in-memory flag.
    pub fn in_memory(mut self, enabled: bool) -> Self {
        self.in_memory = enabled;
        self
    }

    /// Enables or disables writing to the version store.
    pub fn history_store(mut self, enabled: bool) -> Self {
        self.history_store = enabled;
        self
    }

    /// Enables or disables the visible-to-all fast path.
    pub fn visible_all(mut self, enabled: bool) -> Self {
        self.visible_all = enabled;
        self
    }

    /// Sets whether the page must be clean afterwards.
    pub fn clean_after_rec(mut self, enabled: bool) -> Self {
        self.clean_after_rec = enabled;
        self
    }

    /// Sets whether invisible updates are fatal.
    pub fn visibility_err(mut self, enabled: bool) -> Self {
        self.visibility_err = enabled;
        self
    }

    /// Sets the page layout.
    pub fn page_kind(mut self, kind: PageKind) -> Self {
        self.page_kind = kind;
        self
    }

    /// Marks the page as a version store page.
    pub fn history_store_page(mut self, enabled: bool) -> Self {
        self.history_store_page = enabled;
        self
    }

    /// Marks the page as a metadata page.
    pub fn metadata_page(mut self, enabled: bool) -> Self {
        self.metadata_page = enabled;
        self
    }

    /// Collapses the boolean options into mode bits.
    pub fn run_mode(&self) -> RunMode {
        let mut bits = 0;
        for (enabled, bit) in [
            (self.eviction, mode::EVICT),
            (self.checkpoint, mode::CHECKPOINT),
            (self.in_memory, mode::IN_MEMORY),
            (self.history_store, mode::HISTORY_STORE),
            (self.visible_all, mode::VISIBLE_ALL),
            (self.clean_after_rec, mode::CLEAN_AFTER_REC),
            (self.visibility_err, mode::VISIBILITY_ERR),
        ] {
            if enabled {
                bits |= bit;
            }
        }
        RunMode::from_bits(bits)
    }

    /// Page attributes described by these options.
    pub fn page(&self) -> PageDesc {
        PageDesc {
            kind: self.page_kind,
            history_store: self.history_store_page,
            metadata: self.metadata_page,
        }
    }
}
