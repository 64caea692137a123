//! Remote endpoint seam.
//!
//! `EndpointActions` is implemented by whatever carries requests to an
//! endpoint: a network client in production, a local filesystem agent or
//! a mock in tests. Flows only ever talk to this trait.

use std::future::Future;
use std::pin::Pin;

use chunkflow_protocol::{ActionError, ActionKind, ContentHash, FindSpec, PathSpec, StatEntry};
use futures_util::stream::BoxStream;
use tracing::trace;

use crate::types::{AtomicRequestCounts, RequestCounts};

/// Future returned by an endpoint action.
pub type ActionFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ActionError>> + Send + 'a>>;

/// Stream of results returned by a streaming endpoint action.
pub type ActionStream<'a, T> = BoxStream<'a, Result<T, ActionError>>;

/// Actions a flow may request from a remote endpoint.
pub trait EndpointActions: Send + Sync {
    /// Identifier of the endpoint, used as the first URN segment.
    fn client_id(&self) -> &str;

    /// Reports existence and size of `pathspec`.
    fn stat<'a>(&'a self, pathspec: &'a PathSpec) -> ActionFuture<'a, StatEntry>;

    /// Returns up to `length` bytes starting at `offset`. Fewer bytes are
    /// returned only at end of file.
    fn read_range<'a>(
        &'a self,
        pathspec: &'a PathSpec,
        offset: u64,
        length: u64,
    ) -> ActionFuture<'a, Vec<u8>>;

    /// Returns the content hash of `[offset, offset + length)`.
    fn hash_range<'a>(
        &'a self,
        pathspec: &'a PathSpec,
        offset: u64,
        length: u64,
    ) -> ActionFuture<'a, ContentHash>;

    /// Streams every file matching `spec`.
    fn search<'a>(&'a self, spec: &'a FindSpec) -> ActionStream<'a, PathSpec>;
}

/// Wraps an endpoint and counts the requests sent through it.
pub struct RequestCounter<'a> {
    inner: &'a dyn EndpointActions,
    counts: AtomicRequestCounts,
}

impl<'a> RequestCounter<'a> {
    pub fn new(inner: &'a dyn EndpointActions) -> Self {
        Self {
            inner,
            counts: AtomicRequestCounts::default(),
        }
    }

    /// Requests issued so far.
    pub fn counts(&self) -> RequestCounts {
        self.counts.snapshot()
    }

    fn record(&self, kind: ActionKind) {
        trace!(client = self.inner.client_id(), action = %kind, "request issued");
        self.counts.record(kind);
    }
}

impl EndpointActions for RequestCounter<'_> {
    fn client_id(&self) -> &str {
        self.inner.client_id()
    }

    fn stat<'a>(&'a self, pathspec: &'a PathSpec) -> ActionFuture<'a, StatEntry> {
        self.record(ActionKind::Stat);
        self.inner.stat(pathspec)
    }

    fn read_range<'a>(
        &'a self,
        pathspec: &'a PathSpec,
        offset: u64,
        length: u64,
    ) -> ActionFuture<'a, Vec<u8>> {
        self.record(ActionKind::ReadRange);
        self.inner.read_range(pathspec, offset, length)
    }

    fn hash_range<'a>(
        &'a self,
        pathspec: &'a PathSpec,
        offset: u64,
        length: u64,
    ) -> ActionFuture<'a, ContentHash> {
        self.record(ActionKind::HashRange);
        self.inner.hash_range(pathspec, offset, length)
    }

    fn search<'a>(&'a self, spec: &'a FindSpec) -> ActionStream<'a, PathSpec> {
        self.record(ActionKind::Find);
        self.inner.search(spec)
    }
}
