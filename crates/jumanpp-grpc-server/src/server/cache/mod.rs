//! Analyzer reuse.
//!
//! Building an analyzer is expensive, so the server keeps a bounded set of
//! them and hands them out per request.
//!
//! - [`analyzer`] - [`CachedAnalyzer`], an analyzer plus its reuse bookkeeping.
//! - [`reader`] - Request text parsing for plain and partially annotated input.
//! - [`manager`] - [`AnalyzerCache`] and the [`AnalyzerLease`] scope guard.

pub mod analyzer;
pub mod manager;
pub mod reader;

pub use analyzer::{AnalyzerState, CachedAnalyzer, CompatibilityKey};
pub use manager::{AnalyzerCache, AnalyzerLease};
