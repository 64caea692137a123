//! File collection: search an endpoint, then transfer every match.
//!
//! A [`FileCollector`] runs one search per find spec, de-duplicates the
//! matches and launches a transfer flow for each with bounded
//! concurrency. Every completed file is linked under the collection's
//! output URN. One file failing never aborts its siblings.

pub mod collector;
pub mod error;
pub mod types;

// Re-export primary types for convenience.
pub use collector::{CollectorHandle, FileCollector};
pub use error::CollectorError;
pub use types::{CollectRequest, CollectionReport, CollectorEvent, FileResult};
