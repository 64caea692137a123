use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chunkflow_protocol::{ActionKind, PathSpec, VfsUrn};
use serde::{Deserialize, Serialize};

/// A chunk-aligned byte range of a remote file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkRange {
    /// Byte offset within the file.
    pub offset: u64,
    /// Length in bytes (never larger than the configured chunk size).
    pub length: u64,
}

impl ChunkRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Per-chunk policy of a transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// Always read every chunk.
    #[default]
    Plain,
    /// Hash each chunk first and link known content by reference.
    Fast,
}

/// Arguments for starting a transfer flow.
///
/// Unset `window_size` / `chunk_size` fall back to the flow's
/// [`TransferConfig`](crate::TransferConfig).
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRequest {
    pub pathspec: PathSpec,
    pub mode: TransferMode,
    pub window_size: Option<usize>,
    pub chunk_size: Option<u64>,
}

impl TransferRequest {
    pub fn new(pathspec: PathSpec) -> Self {
        Self {
            pathspec,
            mode: TransferMode::Plain,
            window_size: None,
            chunk_size: None,
        }
    }

    pub fn fast(pathspec: PathSpec) -> Self {
        Self {
            mode: TransferMode::Fast,
            ..Self::new(pathspec)
        }
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = Some(window_size);
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }
}

/// Progress event emitted by a transfer flow.
///
/// `Completed` or `Failed` is always the last event of a flow.
#[derive(Debug, Clone, PartialEq)]
pub enum FlowEvent {
    Started {
        urn: VfsUrn,
    },
    /// Stat answered; `size` is now authoritative.
    SizeKnown {
        urn: VfsUrn,
        size: u64,
    },
    ChunkStored {
        urn: VfsUrn,
        offset: u64,
        length: u64,
        /// `true` when satisfied by reference to known content.
        deduplicated: bool,
    },
    Retrying {
        urn: VfsUrn,
        offset: u64,
        attempt: u32,
        delay: Duration,
    },
    Completed {
        urn: VfsUrn,
        size: u64,
    },
    Failed {
        urn: VfsUrn,
        error: String,
    },
}

impl FlowEvent {
    /// Returns `true` for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }

    pub fn urn(&self) -> &VfsUrn {
        match self {
            Self::Started { urn }
            | Self::SizeKnown { urn, .. }
            | Self::ChunkStored { urn, .. }
            | Self::Retrying { urn, .. }
            | Self::Completed { urn, .. }
            | Self::Failed { urn, .. } => urn,
        }
    }
}

/// Remote requests issued, by action kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestCounts {
    pub stat: u64,
    pub read: u64,
    pub hash: u64,
    pub find: u64,
}

impl RequestCounts {
    pub fn total(&self) -> u64 {
        self.stat + self.read + self.hash + self.find
    }
}

/// Lock-free counters behind [`RequestCounts`].
#[derive(Debug, Default)]
pub(crate) struct AtomicRequestCounts {
    stat: AtomicU64,
    read: AtomicU64,
    hash: AtomicU64,
    find: AtomicU64,
}

impl AtomicRequestCounts {
    pub(crate) fn record(&self, kind: ActionKind) {
        let counter = match kind {
            ActionKind::Stat => &self.stat,
            ActionKind::ReadRange => &self.read,
            ActionKind::HashRange => &self.hash,
            ActionKind::Find => &self.find,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RequestCounts {
        RequestCounts {
            stat: self.stat.load(Ordering::Relaxed),
            read: self.read.load(Ordering::Relaxed),
            hash: self.hash.load(Ordering::Relaxed),
            find: self.find.load(Ordering::Relaxed),
        }
    }
}

/// Summary of a completed transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferReport {
    pub urn: VfsUrn,
    pub size: u64,
    /// Chunks covering the file.
    pub chunks: u64,
    /// Chunks whose payload was read from the endpoint.
    pub chunks_fetched: u64,
    /// Chunks linked by reference to known content.
    pub chunks_deduplicated: u64,
    pub bytes_fetched: u64,
    pub retries: u64,
    /// Highest number of chunk slots in flight at once.
    pub peak_in_flight: usize,
    pub requests: RequestCounts,
}
