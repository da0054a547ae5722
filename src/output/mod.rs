//! Output formatting module
//!
//! Provides various output formats for run results.

mod formatter;

pub use formatter::{export_csv, OutputFormat, ResultFormatter};
