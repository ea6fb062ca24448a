//! Sombra reconciliation: update selection and time window construction for
//! multi-version page writes.

#![warn(missing_docs)]

pub mod reconcile;
pub mod types;

pub use reconcile::{RecSession, ReconcileContext, ReconcileOptions, UpdateSelection};
pub use types::{ReconcileError, Result};
