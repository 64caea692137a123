//! Virtual files assembled from chunks.
//!
//! A virtual file is an index of `offset → (hash, length)` segments over
//! the blob store. Payload writes store the bytes and record a segment;
//! reference writes record a segment for bytes already stored.

use std::collections::BTreeMap;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chunkflow_protocol::{ContentHash, PathSpec, VfsUrn};
use tracing::debug;

use crate::store::{BlobStore, StoreError};

/// A stored run of bytes inside a virtual file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub hash: ContentHash,
    pub length: u64,
}

/// Server-side representation of a remote file.
pub struct VirtualFile {
    urn: VfsUrn,
    blobs: Arc<dyn BlobStore>,
    inner: RwLock<FileInner>,
}

#[derive(Default)]
struct FileInner {
    size: Option<u64>,
    segments: BTreeMap<u64, Segment>,
    complete: bool,
}

enum Piece {
    Blob { hash: ContentHash, skip: u64, len: u64 },
    Zero(u64),
}

impl VirtualFile {
    pub fn new(urn: VfsUrn, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            urn,
            blobs,
            inner: RwLock::new(FileInner::default()),
        }
    }

    pub fn urn(&self) -> &VfsUrn {
        &self.urn
    }

    /// Stores `data` at `offset`. Rewriting the same bytes is a no-op.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<ContentHash, StoreError> {
        let hash = ContentHash::digest(data);
        if data.is_empty() {
            return Ok(hash);
        }
        self.blobs.put(hash, data)?;
        self.insert_segment(offset, hash, data.len() as u64);
        Ok(hash)
    }

    /// Maps `[offset, offset + length)` to already stored content.
    ///
    /// Fails with [`StoreError::BlobMissing`] if the blob store does not
    /// hold `hash`.
    pub fn write_ref(&self, offset: u64, length: u64, hash: ContentHash) -> Result<(), StoreError> {
        if !self.blobs.has(&hash)? {
            return Err(StoreError::BlobMissing(hash));
        }
        if length > 0 {
            self.insert_segment(offset, hash, length);
        }
        Ok(())
    }

    fn insert_segment(&self, offset: u64, hash: ContentHash, length: u64) {
        self.write_inner()
            .segments
            .insert(offset, Segment { hash, length });
    }

    /// Declares the logical size. Authoritative even before all bytes land.
    ///
    /// Segments past the new size are dropped and segments straddling it
    /// are clipped, so a file that shrank between transfers keeps no stale
    /// tail.
    pub fn set_size(&self, size: u64) {
        let mut inner = self.write_inner();
        inner.size = Some(size);
        inner.segments.retain(|&offset, _| offset < size);
        for (&offset, segment) in inner.segments.iter_mut() {
            segment.length = segment.length.min(size - offset);
        }
    }

    /// Declared size, or `None` before the stat phase.
    pub fn size(&self) -> Option<u64> {
        self.read_inner().size
    }

    pub fn mark_complete(&self) {
        self.write_inner().complete = true;
        debug!(urn = %self.urn, "virtual file complete");
    }

    pub fn mark_incomplete(&self) {
        self.write_inner().complete = false;
    }

    pub fn is_complete(&self) -> bool {
        self.read_inner().complete
    }

    /// Snapshot of the segment index in offset order.
    pub fn segments(&self) -> Vec<(u64, Segment)> {
        self.read_inner()
            .segments
            .iter()
            .map(|(&offset, &segment)| (offset, segment))
            .collect()
    }

    /// Union of written ranges, merged and sorted.
    pub fn coverage(&self) -> Vec<Range<u64>> {
        let mut merged: Vec<Range<u64>> = Vec::new();
        for (offset, segment) in self.read_inner().segments.iter() {
            let range = *offset..offset + segment.length;
            match merged.last_mut() {
                Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
                _ => merged.push(range),
            }
        }
        merged
    }

    /// Reads up to `length` bytes at `offset`, truncated at end of file.
    ///
    /// Unwritten gaps inside the declared size read as zeros.
    pub fn read_at(&self, offset: u64, length: u64) -> Result<Vec<u8>, StoreError> {
        if length == 0 {
            return Ok(Vec::new());
        }
        let pieces = self.plan_read(offset, length);
        let mut out = Vec::new();
        for piece in pieces {
            match piece {
                Piece::Zero(len) => out.resize(out.len() + len as usize, 0),
                Piece::Blob { hash, skip, len } => {
                    let blob = self.blobs.get(&hash)?.ok_or(StoreError::BlobMissing(hash))?;
                    let start = skip as usize;
                    let end = start + len as usize;
                    let bytes = blob.get(start..end).ok_or(StoreError::Corrupt(hash))?;
                    out.extend_from_slice(bytes);
                }
            }
        }
        Ok(out)
    }

    /// Resolves a read into blob slices and zero runs under one lock.
    fn plan_read(&self, offset: u64, length: u64) -> Vec<Piece> {
        let inner = self.read_inner();
        let size = inner.size.unwrap_or_else(|| {
            inner
                .segments
                .iter()
                .map(|(o, s)| o + s.length)
                .max()
                .unwrap_or(0)
        });
        let end = offset.saturating_add(length).min(size);

        let mut pieces = Vec::new();
        let mut pos = offset;
        while pos < end {
            let next_start = inner
                .segments
                .range(pos + 1..)
                .next()
                .map_or(u64::MAX, |(&start, _)| start);
            // Latest-starting segment covering `pos` wins.
            let covering = inner
                .segments
                .range(..=pos)
                .rev()
                .find(|&(&start, seg)| start + seg.length > pos);

            let stop = match covering {
                Some((&start, seg)) => {
                    let stop = (start + seg.length).min(next_start).min(end);
                    pieces.push(Piece::Blob {
                        hash: seg.hash,
                        skip: pos - start,
                        len: stop - pos,
                    });
                    stop
                }
                None => {
                    let stop = next_start.min(end);
                    pieces.push(Piece::Zero(stop - pos));
                    stop
                }
            };
            pos = stop;
        }
        pieces
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, FileInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, FileInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for VirtualFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read_inner();
        f.debug_struct("VirtualFile")
            .field("urn", &self.urn)
            .field("size", &inner.size)
            .field("segments", &inner.segments.len())
            .field("complete", &inner.complete)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// VirtualFileReader
// ---------------------------------------------------------------------------

/// Seekable reader over a virtual file. Each reader has its own cursor.
#[derive(Debug)]
pub struct VirtualFileReader {
    file: Arc<VirtualFile>,
    pos: u64,
}

impl VirtualFileReader {
    pub fn new(file: Arc<VirtualFile>) -> Self {
        Self { file, pos: 0 }
    }

    /// Current cursor position.
    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl Read for VirtualFileReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let data = self
            .file
            .read_at(self.pos, buf.len() as u64)
            .map_err(std::io::Error::other)?;
        buf[..data.len()].copy_from_slice(&data);
        self.pos += data.len() as u64;
        Ok(data.len())
    }
}

impl Seek for VirtualFileReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let (base, delta) = match pos {
            SeekFrom::Start(offset) => {
                self.pos = offset;
                return Ok(offset);
            }
            SeekFrom::End(delta) => (self.file.size().unwrap_or(0), delta),
            SeekFrom::Current(delta) => (self.pos, delta),
        };
        let target = base.checked_add_signed(delta).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek to a negative position",
            )
        })?;
        self.pos = target;
        Ok(target)
    }
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// Index of virtual files and collection links by URN.
pub struct FileStore {
    blobs: Arc<dyn BlobStore>,
    files: RwLock<BTreeMap<VfsUrn, Arc<VirtualFile>>>,
}

impl FileStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            blobs,
            files: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn blobs(&self) -> Arc<dyn BlobStore> {
        Arc::clone(&self.blobs)
    }

    /// Returns the virtual file for `pathspec` on `client_id`, creating an
    /// empty one on first use.
    pub fn create_or_open(&self, client_id: &str, pathspec: &PathSpec) -> Arc<VirtualFile> {
        let urn = VfsUrn::for_pathspec(client_id, pathspec);
        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            files
                .entry(urn.clone())
                .or_insert_with(|| Arc::new(VirtualFile::new(urn, Arc::clone(&self.blobs)))),
        )
    }

    pub fn open(&self, urn: &VfsUrn) -> Option<Arc<VirtualFile>> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        files.get(urn).cloned()
    }

    /// Makes `file` reachable under `alias` as well as its own URN.
    pub fn link(&self, alias: VfsUrn, file: Arc<VirtualFile>) {
        debug!(alias = %alias, target = %file.urn(), "linked virtual file");
        let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
        files.insert(alias, file);
    }

    /// Direct children of `parent`, in URN order.
    pub fn children(&self, parent: &VfsUrn) -> Vec<(VfsUrn, Arc<VirtualFile>)> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        files
            .iter()
            .filter(|(urn, _)| urn.is_child_of(parent))
            .map(|(urn, file)| (urn.clone(), Arc::clone(file)))
            .collect()
    }

    /// Number of entries (files and links).
    pub fn len(&self) -> usize {
        self.files.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for FileStore {
    fn default() -> Self {
        Self::new(Arc::new(crate::store::MemoryBlobStore::new()))
    }
}
