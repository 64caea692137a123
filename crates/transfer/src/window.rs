use std::collections::BTreeSet;

use crate::TransferError;
use crate::chunked::{chunk_count, chunk_len_at};
use crate::types::ChunkRange;

/// Tracks outstanding chunk offsets for one transfer.
///
/// Hands out chunk-aligned offsets in ascending order, never more than
/// `window_size` at once. Acknowledgements may arrive in any order.
#[derive(Debug, Clone)]
pub struct ChunkWindow {
    chunk_size: u64,
    window_size: usize,
    total_size: Option<u64>,
    next_offset: u64,
    in_flight: BTreeSet<u64>,
    acknowledged: BTreeSet<u64>,
    peak_in_flight: usize,
}

impl ChunkWindow {
    /// Creates a window. Zero sizes are clamped to 1.
    pub fn new(chunk_size: u64, window_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            window_size: window_size.max(1),
            total_size: None,
            next_offset: 0,
            in_flight: BTreeSet::new(),
            acknowledged: BTreeSet::new(),
            peak_in_flight: 0,
        }
    }

    /// Records the file size. Nothing is issued before this is called.
    ///
    /// Fails if a different size was already recorded.
    pub fn set_total_size(&mut self, size: u64) -> Result<(), TransferError> {
        match self.total_size {
            Some(known) if known != size => Err(TransferError::SizeMismatch {
                offset: 0,
                expected: known,
                actual: size,
            }),
            _ => {
                self.total_size = Some(size);
                Ok(())
            }
        }
    }

    pub fn total_size(&self) -> Option<u64> {
        self.total_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// Length of the chunk at `offset`, or `None` while the size is unknown.
    pub fn chunk_len_at(&self, offset: u64) -> Option<u64> {
        self.total_size
            .map(|size| chunk_len_at(offset, size, self.chunk_size))
    }

    /// Issues the next chunk if the window has room.
    pub fn next_chunk(&mut self) -> Option<ChunkRange> {
        let size = self.total_size?;
        if self.in_flight.len() >= self.window_size || self.next_offset >= size {
            return None;
        }

        let range = ChunkRange::new(
            self.next_offset,
            chunk_len_at(self.next_offset, size, self.chunk_size),
        );
        self.in_flight.insert(range.offset);
        self.next_offset += range.length;
        self.peak_in_flight = self.peak_in_flight.max(self.in_flight.len());
        Some(range)
    }

    /// Issues chunks until the window is full or the file is exhausted.
    pub fn fill(&mut self) -> Vec<ChunkRange> {
        std::iter::from_fn(|| self.next_chunk()).collect()
    }

    /// Marks `offset` as received and frees its slot.
    ///
    /// Returns the acknowledged range, or `None` if `offset` was not in
    /// flight (duplicate or unknown acknowledgement).
    pub fn ack(&mut self, offset: u64) -> Option<ChunkRange> {
        if !self.in_flight.remove(&offset) {
            return None;
        }
        self.acknowledged.insert(offset);
        let length = self.chunk_len_at(offset)?;
        Some(ChunkRange::new(offset, length))
    }

    /// Frees the slot of `offset` without acknowledging it.
    ///
    /// Used when a flow is winding down and will not retry the chunk.
    pub fn abandon(&mut self, offset: u64) -> bool {
        self.in_flight.remove(&offset)
    }

    pub fn is_in_flight(&self, offset: u64) -> bool {
        self.in_flight.contains(&offset)
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// Highest in-flight count ever observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight
    }

    /// Returns `true` once every chunk has been acknowledged.
    ///
    /// Abandoned chunks never count, so a window that was wound down with
    /// chunks outstanding stays undrained.
    pub fn is_drained(&self) -> bool {
        match self.total_size {
            Some(size) => {
                self.in_flight.is_empty()
                    && self.acknowledged.len() as u64 == chunk_count(size, self.chunk_size)
            }
            None => false,
        }
    }

    /// Acknowledged ranges in offset order.
    pub fn acknowledged(&self) -> impl Iterator<Item = ChunkRange> + '_ {
        self.acknowledged.iter().filter_map(|&offset| {
            self.chunk_len_at(offset)
                .map(|length| ChunkRange::new(offset, length))
        })
    }

    /// Total bytes covered by acknowledged chunks.
    pub fn acknowledged_bytes(&self) -> u64 {
        self.acknowledged().map(|r| r.length).sum()
    }
}
