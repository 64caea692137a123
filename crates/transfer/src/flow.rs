//! Transfer flow driver.
//!
//! Runs a [`TransferSession`] against an endpoint: executes its commands
//! concurrently, feeds responses back in arrival order and forwards
//! progress events to the caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chunkflow_protocol::{ActionError, PathSpec, VfsUrn};
use futures_util::StreamExt;
use futures_util::future::BoxFuture;
use futures_util::stream::FuturesUnordered;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::TransferError;
use crate::cache::BlobCache;
use crate::config::TransferConfig;
use crate::endpoint::{EndpointActions, RequestCounter};
use crate::session::{ChunkEvent, Command, FlowState, Phase, TransferSession};
use crate::strategy::{ChunkStrategy, FastStrategy, PlainStrategy};
use crate::types::{FlowEvent, TransferMode, TransferReport, TransferRequest};
use crate::vfs::FileStore;

/// Capacity of the event channel created by [`TransferFlow::spawn`].
const EVENT_BUFFER: usize = 256;

/// Pulls remote files into a [`FileStore`] through one endpoint.
///
/// Cloning is cheap; clones share the endpoint, store, cache and
/// cancellation token.
#[derive(Clone)]
pub struct TransferFlow {
    endpoint: Arc<dyn EndpointActions>,
    files: Arc<FileStore>,
    cache: BlobCache,
    config: TransferConfig,
    cancel: CancellationToken,
}

impl TransferFlow {
    pub fn new(
        endpoint: Arc<dyn EndpointActions>,
        files: Arc<FileStore>,
        cache: BlobCache,
        config: TransferConfig,
    ) -> Self {
        Self {
            endpoint,
            files,
            cache,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Uses `cancel` instead of a private token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn endpoint(&self) -> &Arc<dyn EndpointActions> {
        &self.endpoint
    }

    pub fn files(&self) -> &Arc<FileStore> {
        &self.files
    }

    pub fn cache(&self) -> &BlobCache {
        &self.cache
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Runs one transfer to completion.
    ///
    /// Progress events go to `events`. `Started`, `SizeKnown`, `Completed`
    /// and `Failed` wait for channel capacity; per-chunk events are dropped
    /// when the channel is full. The receiver must be drained or dropped.
    pub async fn run(
        &self,
        request: &TransferRequest,
        events: &mpsc::Sender<FlowEvent>,
    ) -> Result<TransferReport, TransferError> {
        let config = match self.flow_config(request) {
            Ok(config) => config,
            Err(e) => {
                let urn = VfsUrn::for_pathspec(self.endpoint.client_id(), &request.pathspec);
                warn!(urn = %urn, error = %e, "transfer rejected");
                let _ = events
                    .send(FlowEvent::Failed {
                        urn,
                        error: e.to_string(),
                    })
                    .await;
                return Err(e);
            }
        };
        let file = self
            .files
            .create_or_open(self.endpoint.client_id(), &request.pathspec);
        let strategy: Arc<dyn ChunkStrategy> = match request.mode {
            TransferMode::Plain => Arc::new(PlainStrategy),
            TransferMode::Fast => Arc::new(FastStrategy::new(self.cache.clone(), self.files.blobs())),
        };

        let counter = RequestCounter::new(self.endpoint.as_ref());
        let mut session =
            TransferSession::new(request.pathspec.clone(), file, Arc::clone(&strategy), &config);
        let mut pending: FuturesUnordered<BoxFuture<'_, ChunkEvent>> = FuturesUnordered::new();
        let mut cancel_seen = false;

        let mut commands = session.start();
        loop {
            for command in commands.drain(..) {
                pending.push(self.issue(
                    &counter,
                    strategy.as_ref(),
                    &request.pathspec,
                    config.request_timeout,
                    command,
                ));
            }
            forward(events, session.take_events()).await;
            if session.is_finished() {
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    commands = session.cancel();
                }
                next = pending.next() => match next {
                    Some(event) => commands = session.on_event(event),
                    None => session.abort(TransferError::Stalled),
                },
            }
        }

        let requests = counter.counts();
        debug!(
            urn = %session.urn(),
            stat = requests.stat,
            read = requests.read,
            hash = requests.hash,
            abandoned = pending.len(),
            "transfer finished"
        );
        match session.state() {
            FlowState::Complete => Ok(session.report(requests)),
            _ => Err(session.take_error().unwrap_or(TransferError::Stalled)),
        }
    }

    /// Runs a transfer on a background task.
    ///
    /// The returned handle cancels only this transfer; cancelling the flow's
    /// own token still stops it.
    pub fn spawn(&self, request: TransferRequest) -> FlowHandle {
        let cancel = self.cancel.child_token();
        let flow = self.clone().with_cancellation(cancel.clone());
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(async move { flow.run(&request, &tx).await });
        FlowHandle {
            events: rx,
            task,
            cancel,
        }
    }

    fn flow_config(&self, request: &TransferRequest) -> Result<TransferConfig, TransferError> {
        let mut config = self.config.clone();
        if let Some(window_size) = request.window_size {
            config.window_size = window_size;
        }
        if let Some(chunk_size) = request.chunk_size {
            config.chunk_size = chunk_size;
        }
        config.validate()?;
        Ok(config)
    }

    /// Turns a session command into a future yielding its response.
    fn issue<'a>(
        &'a self,
        endpoint: &'a RequestCounter<'_>,
        strategy: &'a dyn ChunkStrategy,
        pathspec: &'a PathSpec,
        limit: Duration,
        command: Command,
    ) -> BoxFuture<'a, ChunkEvent> {
        match command {
            Command::Stat => Box::pin(async move {
                ChunkEvent::Stat(with_timeout(limit, endpoint.stat(pathspec)).await)
            }),
            Command::Issue {
                phase,
                range,
                attempt,
                delay,
            } => Box::pin(async move {
                if !delay.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return ChunkEvent::Skipped { range },
                    }
                }
                trace!(offset = range.offset, length = range.length, ?phase, attempt, "issuing chunk request");
                match phase {
                    Phase::Resolve => ChunkEvent::Resolved {
                        range,
                        attempt,
                        result: with_timeout(limit, strategy.resolve(endpoint, pathspec, range))
                            .await,
                    },
                    Phase::Fetch => ChunkEvent::Fetched {
                        range,
                        attempt,
                        result: with_timeout(
                            limit,
                            endpoint.read_range(pathspec, range.offset, range.length),
                        )
                        .await,
                    },
                }
            }),
        }
    }
}

async fn with_timeout<T>(
    limit: Duration,
    request: impl Future<Output = Result<T, ActionError>>,
) -> Result<T, ActionError> {
    tokio::time::timeout(limit, request)
        .await
        .unwrap_or(Err(ActionError::Timeout))
}

async fn forward(events: &mpsc::Sender<FlowEvent>, batch: Vec<FlowEvent>) {
    for event in batch {
        match event {
            FlowEvent::ChunkStored { .. } | FlowEvent::Retrying { .. } => {
                let _ = events.try_send(event);
            }
            _ => {
                let _ = events.send(event).await;
            }
        }
    }
}

/// Handle to a transfer running on a background task.
pub struct FlowHandle {
    events: mpsc::Receiver<FlowEvent>,
    task: JoinHandle<Result<TransferReport, TransferError>>,
    cancel: CancellationToken,
}

impl FlowHandle {
    /// Progress events, ending with `Completed` or `Failed`.
    pub fn events(&mut self) -> &mut mpsc::Receiver<FlowEvent> {
        &mut self.events
    }

    /// Requests cancellation. In-flight requests are allowed to finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the transfer, discarding undelivered events.
    pub async fn join(self) -> Result<TransferReport, TransferError> {
        let Self { events, task, .. } = self;
        drop(events);
        task.await
            .map_err(|e| TransferError::Task(e.to_string()))?
    }
}
