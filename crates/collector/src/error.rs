//! Collector error types.

use chunkflow_protocol::ActionError;

/// Errors that abort a whole collection.
///
/// Per-file transfer failures are not errors at this level; they are
/// reported in [`CollectionReport`](crate::CollectionReport).
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("search failed: {0}")]
    Search(#[from] ActionError),

    #[error("transfer error: {0}")]
    Transfer(#[from] chunkflow_transfer::TransferError),

    #[error("no find specs given")]
    NoFindSpecs,

    #[error("collector task failed: {0}")]
    Task(String),
}
