//! Chunked transfer flows with windowed pipelining and hash deduplication.
//!
//! A flow stats a remote path, then pulls it into server-side storage as
//! fixed-size chunks with at most `window_size` requests outstanding. The
//! fast variant asks the endpoint for each chunk's hash first and links
//! chunks already known to the [`BlobCache`] or blob store instead of
//! transferring them again.

mod cache;
mod chunked;
mod config;
mod endpoint;
mod flow;
mod session;
mod store;
mod strategy;
mod types;
mod validation;
mod vfs;
mod window;

pub use cache::BlobCache;
pub use chunked::chunk_count;
pub use config::{ConfigError, EngineConfig, RetryConfig, TransferConfig};
pub use endpoint::{ActionFuture, ActionStream, EndpointActions, RequestCounter};
pub use flow::{FlowHandle, TransferFlow};
pub use session::{ChunkEvent, Command, FlowState, Phase, TransferSession};
pub use store::{BlobStore, FsBlobStore, MemoryBlobStore, StoreError};
pub use strategy::{ChunkStrategy, FastStrategy, PlainStrategy, Resolution};
pub use types::{
    ChunkRange, FlowEvent, RequestCounts, TransferMode, TransferReport, TransferRequest,
};
pub use validation::validate_output_name;
pub use vfs::{FileStore, Segment, VirtualFile, VirtualFileReader};
pub use window::ChunkWindow;

use chunkflow_protocol::ActionError;

/// Default chunk size: 512 KiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 512 * 1024;

/// Default number of chunk requests kept in flight per transfer.
pub const DEFAULT_WINDOW_SIZE: usize = 200;

/// Default Blob Cache capacity (number of hashes remembered).
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("stat failed: {0}")]
    Stat(ActionError),

    #[error("read failed at offset {offset}: {source}")]
    Read {
        offset: u64,
        #[source]
        source: ActionError,
    },

    #[error("size mismatch at offset {offset}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        offset: u64,
        expected: u64,
        actual: u64,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("flow stalled with no outstanding requests")]
    Stalled,

    #[error("flow task failed: {0}")]
    Task(String),

    #[error("cancelled")]
    Cancelled,
}
