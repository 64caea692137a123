// ---------------------------------------------------------------------------
// Chunk geometry
// ---------------------------------------------------------------------------

/// Number of chunks needed to cover `size` bytes.
pub fn chunk_count(size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size)
}

/// Length of the chunk starting at `offset` in a file of `size` bytes.
///
/// Every chunk is exactly `chunk_size` long except the last, which is
/// `size % chunk_size` (or a full chunk when that remainder is zero).
pub(crate) fn chunk_len_at(offset: u64, size: u64, chunk_size: u64) -> u64 {
    size.saturating_sub(offset).min(chunk_size)
}
