//! Data types for file collection.

use chunkflow_protocol::{FindSpec, PathSpec, VfsUrn};
use chunkflow_transfer::{FlowEvent, TransferMode};
use serde::{Deserialize, Serialize};

/// Arguments for a collection run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectRequest {
    /// Searches whose matches are collected. Matches are de-duplicated.
    pub find_specs: Vec<FindSpec>,
    /// Output location under the client, e.g. `analysis/MyDownloadedFiles`.
    pub output: String,
    #[serde(default)]
    pub mode: TransferMode,
}

impl CollectRequest {
    pub fn new(find_spec: FindSpec, output: impl Into<String>) -> Self {
        Self {
            find_specs: vec![find_spec],
            output: output.into(),
            mode: TransferMode::Plain,
        }
    }

    /// Adds another search.
    pub fn with_find_spec(mut self, find_spec: FindSpec) -> Self {
        self.find_specs.push(find_spec);
        self
    }

    /// Uses fast (hash-first) transfers.
    pub fn fast(mut self) -> Self {
        self.mode = TransferMode::Fast;
        self
    }
}

/// Progress event emitted during a collection.
///
/// `Finished` or `Failed` is always the last event.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectorEvent {
    Searching {
        root: PathSpec,
    },
    Matched {
        pathspec: PathSpec,
        urn: VfsUrn,
    },
    /// Event from one file's transfer flow.
    Transfer(FlowEvent),
    FileCompleted {
        urn: VfsUrn,
        output_urn: VfsUrn,
        size: u64,
    },
    FileFailed {
        urn: VfsUrn,
        error: String,
    },
    Finished {
        completed: usize,
        failed: usize,
    },
    /// The collection aborted before transfers finished.
    Failed {
        error: String,
    },
}

impl CollectorEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished { .. } | Self::Failed { .. })
    }
}

/// Outcome of one matched file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileResult {
    pub pathspec: PathSpec,
    pub urn: VfsUrn,
    /// Alias under the collection output; set on success.
    pub output_urn: Option<VfsUrn>,
    pub success: bool,
    pub error: Option<String>,
    pub size: Option<u64>,
}

/// Summary of a collection run.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionReport {
    pub output: VfsUrn,
    /// One entry per distinct match, in URN order.
    pub files: Vec<FileResult>,
    /// Search requests issued.
    pub searches: u64,
}

impl CollectionReport {
    pub fn completed(&self) -> impl Iterator<Item = &FileResult> {
        self.files.iter().filter(|f| f.success)
    }

    pub fn failed(&self) -> impl Iterator<Item = &FileResult> {
        self.files.iter().filter(|f| !f.success)
    }

    /// Returns `true` if every matched file was collected.
    pub fn is_complete(&self) -> bool {
        self.files.iter().all(|f| f.success)
    }
}
