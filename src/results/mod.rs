//! Result artifacts module
//!
//! Manages the on-disk results root and reconciles run counts from it.

pub mod artifacts;
pub mod reconcile;

pub use reconcile::{Reconciler, Reconciliation, DEFAULT_SUMMARY_FILE};
