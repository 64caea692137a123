//! Transfer session state machine.
//!
//! A [`TransferSession`] holds everything needed to resume a transfer when
//! a response arrives. It performs no I/O: the driver feeds it
//! [`ChunkEvent`]s and executes the [`Command`]s it returns.
//!
//! ```text
//! AwaitingStat ──stat ok──▶ Streaming ──window drained──▶ Complete
//!      │                        │
//!      └─────stat error─────────┴──terminal error/cancel──▶ Failed
//! ```

use std::sync::Arc;
use std::time::Duration;

use chunkflow_protocol::{ActionError, PathSpec, StatEntry, VfsUrn};
use tracing::{debug, info, trace, warn};

use crate::TransferError;
use crate::config::{RetryConfig, TransferConfig};
use crate::store::StoreError;
use crate::strategy::{ChunkStrategy, Resolution};
use crate::types::{ChunkRange, FlowEvent, RequestCounts, TransferReport};
use crate::vfs::VirtualFile;
use crate::window::ChunkWindow;

/// Lifecycle state of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    AwaitingStat,
    Streaming,
    Complete,
    Failed,
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Which request a chunk slot is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Strategy decision (a hash request for fast transfers).
    Resolve,
    /// Payload read.
    Fetch,
}

/// Request the driver must issue on the session's behalf.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Stat,
    Issue {
        phase: Phase,
        range: ChunkRange,
        /// 0 for the first try.
        attempt: u32,
        /// Wait before sending.
        delay: Duration,
    },
}

/// Response delivered back to the session.
#[derive(Debug)]
pub enum ChunkEvent {
    Stat(Result<StatEntry, ActionError>),
    Resolved {
        range: ChunkRange,
        attempt: u32,
        result: Result<Resolution, ActionError>,
    },
    Fetched {
        range: ChunkRange,
        attempt: u32,
        result: Result<Vec<u8>, ActionError>,
    },
    /// A delayed retry was dropped because the flow is cancelling.
    Skipped { range: ChunkRange },
}

#[derive(Debug, Default)]
struct SessionStats {
    chunks_fetched: u64,
    chunks_deduplicated: u64,
    bytes_fetched: u64,
    retries: u64,
}

/// Resumable state of one transfer.
pub struct TransferSession {
    pathspec: PathSpec,
    file: Arc<VirtualFile>,
    strategy: Arc<dyn ChunkStrategy>,
    window: ChunkWindow,
    state: FlowState,
    max_retries: u32,
    retry: RetryConfig,
    cancelling: bool,
    error: Option<TransferError>,
    stats: SessionStats,
    events: Vec<FlowEvent>,
}

impl TransferSession {
    pub fn new(
        pathspec: PathSpec,
        file: Arc<VirtualFile>,
        strategy: Arc<dyn ChunkStrategy>,
        config: &TransferConfig,
    ) -> Self {
        Self {
            pathspec,
            file,
            strategy,
            window: ChunkWindow::new(config.chunk_size, config.window_size),
            state: FlowState::AwaitingStat,
            max_retries: config.max_retries,
            retry: config.retry.clone(),
            cancelling: false,
            error: None,
            stats: SessionStats::default(),
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn urn(&self) -> &VfsUrn {
        self.file.urn()
    }

    pub fn file(&self) -> &Arc<VirtualFile> {
        &self.file
    }

    pub fn window(&self) -> &ChunkWindow {
        &self.window
    }

    /// Drains progress events produced since the last call.
    pub fn take_events(&mut self) -> Vec<FlowEvent> {
        std::mem::take(&mut self.events)
    }

    /// Terminal error, once the session has failed.
    pub fn take_error(&mut self) -> Option<TransferError> {
        self.error.take()
    }

    /// Begins the transfer.
    pub fn start(&mut self) -> Vec<Command> {
        // A reused file is not complete again until this run finishes.
        self.file.mark_incomplete();
        info!(
            urn = %self.file.urn(),
            strategy = self.strategy.name(),
            chunk_size = self.window.chunk_size(),
            window_size = self.window.window_size(),
            "transfer started"
        );
        self.emit(FlowEvent::Started {
            urn: self.urn().clone(),
        });
        vec![Command::Stat]
    }

    /// Stops issuing requests. In-flight requests still complete; the
    /// session fails with [`TransferError::Cancelled`] once they have.
    pub fn cancel(&mut self) -> Vec<Command> {
        if self.is_finished() || self.cancelling {
            return Vec::new();
        }
        debug!(urn = %self.file.urn(), in_flight = self.window.in_flight_len(), "cancelling transfer");
        self.cancelling = true;
        if self.state == FlowState::Streaming {
            self.finish_if_idle();
        }
        Vec::new()
    }

    /// Fails the session immediately, regardless of outstanding requests.
    pub fn abort(&mut self, error: TransferError) {
        if !self.is_finished() {
            self.fail(error);
        }
    }

    /// Advances the state machine with a response.
    pub fn on_event(&mut self, event: ChunkEvent) -> Vec<Command> {
        if self.is_finished() {
            trace!(urn = %self.file.urn(), ?event, "event after terminal state ignored");
            return Vec::new();
        }
        match event {
            ChunkEvent::Stat(result) => self.on_stat(result),
            ChunkEvent::Resolved {
                range,
                attempt,
                result,
            } => self.on_resolved(range, attempt, result),
            ChunkEvent::Fetched {
                range,
                attempt,
                result,
            } => self.on_fetched(range, attempt, result),
            ChunkEvent::Skipped { range } => {
                self.window.abandon(range.offset);
                self.finish_if_idle();
                Vec::new()
            }
        }
    }

    /// Summary of a completed transfer.
    pub fn report(&self, requests: RequestCounts) -> TransferReport {
        let size = self.window.total_size().unwrap_or(0);
        TransferReport {
            urn: self.urn().clone(),
            size,
            chunks: crate::chunked::chunk_count(size, self.window.chunk_size()),
            chunks_fetched: self.stats.chunks_fetched,
            chunks_deduplicated: self.stats.chunks_deduplicated,
            bytes_fetched: self.stats.bytes_fetched,
            retries: self.stats.retries,
            peak_in_flight: self.window.peak_in_flight(),
            requests,
        }
    }

    fn on_stat(&mut self, result: Result<StatEntry, ActionError>) -> Vec<Command> {
        if self.state != FlowState::AwaitingStat {
            return Vec::new();
        }
        let entry = match result {
            Ok(entry) => entry,
            Err(e) => {
                self.fail(TransferError::Stat(e));
                return Vec::new();
            }
        };
        if !entry.exists {
            self.fail(TransferError::Stat(ActionError::NotFound(
                self.pathspec.to_string(),
            )));
            return Vec::new();
        }
        if entry.is_dir {
            self.fail(TransferError::Stat(ActionError::Unsupported(format!(
                "{} is a directory",
                self.pathspec
            ))));
            return Vec::new();
        }
        if self.cancelling {
            self.fail(TransferError::Cancelled);
            return Vec::new();
        }
        if let Err(e) = self.window.set_total_size(entry.size) {
            self.fail(e);
            return Vec::new();
        }

        self.file.set_size(entry.size);
        self.state = FlowState::Streaming;
        debug!(urn = %self.file.urn(), size = entry.size, "size known");
        self.emit(FlowEvent::SizeKnown {
            urn: self.urn().clone(),
            size: entry.size,
        });

        let commands = self.issue_window();
        self.finish_if_idle();
        commands
    }

    fn on_resolved(
        &mut self,
        range: ChunkRange,
        attempt: u32,
        result: Result<Resolution, ActionError>,
    ) -> Vec<Command> {
        match result {
            Ok(Resolution::Satisfied(hash)) => {
                match self.file.write_ref(range.offset, range.length, hash) {
                    Ok(()) => {
                        self.stats.chunks_deduplicated += 1;
                        self.chunk_done(range, true)
                    }
                    Err(StoreError::BlobMissing(_)) => {
                        debug!(urn = %self.file.urn(), offset = range.offset, %hash, "known hash missing from store, fetching");
                        self.fetch(range)
                    }
                    Err(e) => {
                        self.fail(e.into());
                        Vec::new()
                    }
                }
            }
            Ok(Resolution::Fetch) => self.fetch(range),
            Err(e) => self.retry_or_fail(Phase::Resolve, range, attempt, e),
        }
    }

    fn on_fetched(
        &mut self,
        range: ChunkRange,
        attempt: u32,
        result: Result<Vec<u8>, ActionError>,
    ) -> Vec<Command> {
        let data = match result {
            Ok(data) => data,
            Err(e) => return self.retry_or_fail(Phase::Fetch, range, attempt, e),
        };
        if data.len() as u64 != range.length {
            self.fail(TransferError::SizeMismatch {
                offset: range.offset,
                expected: range.length,
                actual: data.len() as u64,
            });
            return Vec::new();
        }
        match self.file.write(range.offset, &data) {
            Ok(hash) => {
                self.strategy.chunk_stored(&hash);
                self.stats.chunks_fetched += 1;
                self.stats.bytes_fetched += range.length;
                self.chunk_done(range, false)
            }
            Err(e) => {
                self.fail(e.into());
                Vec::new()
            }
        }
    }

    fn fetch(&mut self, range: ChunkRange) -> Vec<Command> {
        if self.cancelling {
            self.window.abandon(range.offset);
            self.finish_if_idle();
            return Vec::new();
        }
        vec![Command::Issue {
            phase: Phase::Fetch,
            range,
            attempt: 0,
            delay: Duration::ZERO,
        }]
    }

    fn chunk_done(&mut self, range: ChunkRange, deduplicated: bool) -> Vec<Command> {
        if self.window.ack(range.offset).is_none() {
            trace!(urn = %self.file.urn(), offset = range.offset, "duplicate acknowledgement");
            return Vec::new();
        }
        trace!(urn = %self.file.urn(), offset = range.offset, deduplicated, "chunk stored");
        self.emit(FlowEvent::ChunkStored {
            urn: self.urn().clone(),
            offset: range.offset,
            length: range.length,
            deduplicated,
        });
        let commands = self.issue_window();
        self.finish_if_idle();
        commands
    }

    fn retry_or_fail(
        &mut self,
        phase: Phase,
        range: ChunkRange,
        attempt: u32,
        error: ActionError,
    ) -> Vec<Command> {
        if self.cancelling {
            self.window.abandon(range.offset);
            self.finish_if_idle();
            return Vec::new();
        }
        if error.is_transient() && attempt < self.max_retries {
            let next = attempt + 1;
            let delay = self.retry.delay_for_attempt(next);
            self.stats.retries += 1;
            warn!(
                urn = %self.file.urn(),
                offset = range.offset,
                ?phase,
                attempt = next,
                delay_ms = delay.as_millis() as u64,
                %error,
                "chunk request failed, retrying"
            );
            self.emit(FlowEvent::Retrying {
                urn: self.urn().clone(),
                offset: range.offset,
                attempt: next,
                delay,
            });
            return vec![Command::Issue {
                phase,
                range,
                attempt: next,
                delay,
            }];
        }
        self.fail(TransferError::Read {
            offset: range.offset,
            source: error,
        });
        Vec::new()
    }

    fn issue_window(&mut self) -> Vec<Command> {
        if self.cancelling {
            return Vec::new();
        }
        self.window
            .fill()
            .into_iter()
            .map(|range| Command::Issue {
                phase: Phase::Resolve,
                range,
                attempt: 0,
                delay: Duration::ZERO,
            })
            .collect()
    }

    fn finish_if_idle(&mut self) {
        if self.state != FlowState::Streaming {
            return;
        }
        if self.cancelling {
            if self.window.in_flight_len() == 0 {
                self.fail(TransferError::Cancelled);
            }
            return;
        }
        if self.window.is_drained() {
            self.state = FlowState::Complete;
            self.file.mark_complete();
            let size = self.window.total_size().unwrap_or(0);
            info!(
                urn = %self.file.urn(),
                size,
                fetched = self.stats.chunks_fetched,
                deduplicated = self.stats.chunks_deduplicated,
                retries = self.stats.retries,
                "transfer complete"
            );
            self.emit(FlowEvent::Completed {
                urn: self.urn().clone(),
                size,
            });
        }
    }

    fn fail(&mut self, error: TransferError) {
        warn!(urn = %self.file.urn(), %error, "transfer failed");
        self.state = FlowState::Failed;
        self.file.mark_incomplete();
        self.emit(FlowEvent::Failed {
            urn: self.urn().clone(),
            error: error.to_string(),
        });
        self.error = Some(error);
    }

    fn emit(&mut self, event: FlowEvent) {
        self.events.push(event);
    }
}

impl std::fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSession")
            .field("urn", self.file.urn())
            .field("state", &self.state)
            .field("strategy", &self.strategy.name())
            .field("window", &self.window)
            .field("cancelling", &self.cancelling)
            .finish()
    }
}
