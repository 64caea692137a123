fn main() {
    println!("Run `cargo test -p flow-e2e` to execute end-to-end transfer flow tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::{Read, Seek, SeekFrom};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chunkflow_agent::LocalEndpoint;
    use chunkflow_collector::{CollectRequest, FileCollector};
    use chunkflow_protocol::{
        ActionError, ActionKind, ContentHash, FindSpec, PathSpec, StatEntry, VfsUrn,
    };
    use chunkflow_transfer::{
        ActionFuture, ActionStream, BlobCache, BlobStore, EndpointActions, FileStore,
        MemoryBlobStore, TransferConfig, TransferFlow, TransferReport, TransferRequest,
        VirtualFile, VirtualFileReader,
    };
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tracing_subscriber::EnvFilter;

    const CLIENT: &str = "C.e2e";
    const CHUNK: u64 = 4096;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_test_writer()
            .try_init();
    }

    /// Deterministic pseudo-random bytes (xorshift).
    fn pattern(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    fn write_source(dir: &Path, name: &str, data: &[u8]) -> PathSpec {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, data).unwrap();
        PathSpec::os(format!("/{name}"))
    }

    fn config(window_size: usize) -> TransferConfig {
        TransferConfig {
            chunk_size: CHUNK,
            window_size,
            ..TransferConfig::default()
        }
    }

    /// Wraps an endpoint and records every request plus the peak number
    /// of requests outstanding at once.
    struct Recorder<E> {
        inner: E,
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        issued: Mutex<Vec<(ActionKind, u64, u64)>>,
    }

    impl<E: EndpointActions> Recorder<E> {
        fn new(inner: E) -> Self {
            Self {
                inner,
                delay: Duration::from_millis(2),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                issued: Mutex::new(Vec::new()),
            }
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }

        fn ranges(&self, kind: ActionKind) -> Vec<(u64, u64)> {
            let mut ranges: Vec<_> = self
                .issued
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _, _)| *k == kind)
                .map(|&(_, offset, length)| (offset, length))
                .collect();
            ranges.sort();
            ranges
        }

        async fn track<'a, T>(
            &'a self,
            kind: ActionKind,
            offset: u64,
            length: u64,
            request: ActionFuture<'a, T>,
        ) -> Result<T, ActionError> {
            self.issued.lock().unwrap().push((kind, offset, length));
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let result = request.await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    impl<E: EndpointActions> EndpointActions for Recorder<E> {
        fn client_id(&self) -> &str {
            self.inner.client_id()
        }

        fn stat<'a>(&'a self, pathspec: &'a PathSpec) -> ActionFuture<'a, StatEntry> {
            self.inner.stat(pathspec)
        }

        fn read_range<'a>(
            &'a self,
            pathspec: &'a PathSpec,
            offset: u64,
            length: u64,
        ) -> ActionFuture<'a, Vec<u8>> {
            Box::pin(self.track(
                ActionKind::ReadRange,
                offset,
                length,
                self.inner.read_range(pathspec, offset, length),
            ))
        }

        fn hash_range<'a>(
            &'a self,
            pathspec: &'a PathSpec,
            offset: u64,
            length: u64,
        ) -> ActionFuture<'a, ContentHash> {
            Box::pin(self.track(
                ActionKind::HashRange,
                offset,
                length,
                self.inner.hash_range(pathspec, offset, length),
            ))
        }

        fn search<'a>(&'a self, spec: &'a FindSpec) -> ActionStream<'a, PathSpec> {
            self.inner.search(spec)
        }
    }

    struct Harness {
        dir: TempDir,
        recorder: Arc<Recorder<LocalEndpoint>>,
        files: Arc<FileStore>,
        flow: TransferFlow,
    }

    impl Harness {
        fn new(window_size: usize) -> Self {
            Self::with_store(window_size, Arc::new(MemoryBlobStore::new()))
        }

        fn with_store(window_size: usize, blobs: Arc<dyn BlobStore>) -> Self {
            init_tracing();
            let dir = TempDir::new().unwrap();
            let recorder = Arc::new(Recorder::new(LocalEndpoint::rooted(CLIENT, dir.path())));
            let files = Arc::new(FileStore::new(blobs));
            let flow = TransferFlow::new(
                recorder.clone(),
                Arc::clone(&files),
                BlobCache::new(1000),
                config(window_size),
            );
            Self {
                dir,
                recorder,
                files,
                flow,
            }
        }

        async fn transfer(&self, request: TransferRequest) -> TransferReport {
            let (tx, _rx) = mpsc::channel(64);
            let report = self.flow.run(&request, &tx).await.unwrap();
            tracing::debug!(urn = %report.urn, requests = report.requests.total(), "transfer done");
            report
        }

        fn file(&self, urn: &VfsUrn) -> Arc<VirtualFile> {
            self.files.open(urn).unwrap()
        }
    }

    fn expected(source: &[u8], offset: u64, length: u64) -> &[u8] {
        let start = (offset as usize).min(source.len());
        let end = (offset.saturating_add(length) as usize).min(source.len());
        &source[start..end]
    }

    // --- content equality ---

    #[tokio::test]
    async fn reads_match_source_bytes() {
        let h = Harness::new(4);
        let size = 5 * CHUNK + 1234;
        let data = pattern(size as usize, 1);
        let spec = write_source(h.dir.path(), "data/image.dd", &data);

        let report = h.transfer(TransferRequest::new(spec)).await;
        assert_eq!(report.size, size);
        let file = h.file(&report.urn);
        assert!(file.is_complete());

        for (offset, length) in [
            (0, 100),
            (CHUNK - 100, 300),
            (size - 100, 300),
            (100, 0),
            (0, size),
            (size, 10),
            (3 * CHUNK + 7, 2 * CHUNK),
        ] {
            assert_eq!(
                file.read_at(offset, length).unwrap(),
                expected(&data, offset, length),
                "range ({offset}, {length})"
            );
        }
    }

    #[tokio::test]
    async fn fast_transfer_matches_source_bytes() {
        let h = Harness::new(3);
        let size = 3 * CHUNK + 1;
        let data = pattern(size as usize, 2);
        let spec = write_source(h.dir.path(), "fast.bin", &data);

        let report = h.transfer(TransferRequest::fast(spec)).await;
        let file = h.file(&report.urn);
        assert_eq!(file.read_at(0, size).unwrap(), data);
        assert_eq!(
            file.read_at(CHUNK - 100, 300).unwrap(),
            expected(&data, CHUNK - 100, 300)
        );
    }

    #[tokio::test]
    async fn reader_seeks_across_chunks() {
        let h = Harness::new(2);
        let data = pattern((2 * CHUNK + 50) as usize, 3);
        let spec = write_source(h.dir.path(), "seek.bin", &data);
        let report = h.transfer(TransferRequest::new(spec)).await;

        let mut reader = VirtualFileReader::new(h.file(&report.urn));
        reader.seek(SeekFrom::Start(CHUNK - 10)).unwrap();
        let mut buf = [0u8; 20];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], expected(&data, CHUNK - 10, 20));

        reader.seek(SeekFrom::End(-5)).unwrap();
        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, &data[data.len() - 5..]);
    }

    #[tokio::test]
    async fn empty_file_completes_and_reads_empty() {
        let h = Harness::new(4);
        let spec = write_source(h.dir.path(), "empty", b"");
        let report = h.transfer(TransferRequest::new(spec)).await;

        assert_eq!(report.size, 0);
        assert_eq!(report.chunks, 0);
        assert_eq!(report.requests.read, 0);
        let file = h.file(&report.urn);
        assert!(file.is_complete());
        assert!(file.read_at(0, 100).unwrap().is_empty());
    }

    // --- coverage ---

    #[tokio::test]
    async fn coverage_is_whole_file() {
        let h = Harness::new(4);
        for (name, size) in [("exact", 4 * CHUNK), ("ragged", 4 * CHUNK + 17), ("tiny", 5)] {
            let spec = write_source(h.dir.path(), name, &pattern(size as usize, size));
            let report = h.transfer(TransferRequest::new(spec)).await;
            let file = h.file(&report.urn);
            assert_eq!(file.coverage(), vec![0..size], "{name}");
            let stored: u64 = file.segments().iter().map(|(_, s)| s.length).sum();
            assert_eq!(stored, size, "{name}");
        }
    }

    // --- window bound ---

    #[tokio::test]
    async fn in_flight_requests_never_exceed_window() {
        for window in [1, 3, 8] {
            let h = Harness::new(window);
            let data = pattern((20 * CHUNK) as usize, 4);
            let spec = write_source(h.dir.path(), "window.bin", &data);

            let report = h.transfer(TransferRequest::new(spec)).await;
            assert!(h.recorder.peak() <= window, "window {window}: peak {}", h.recorder.peak());
            assert_eq!(h.recorder.peak(), window);
            assert!(report.peak_in_flight <= window);
        }
    }

    #[tokio::test]
    async fn fast_in_flight_requests_never_exceed_window() {
        let window = 4;
        let h = Harness::new(window);
        let data = pattern((12 * CHUNK) as usize, 5);
        let spec = write_source(h.dir.path(), "window-fast.bin", &data);

        h.transfer(TransferRequest::fast(spec.clone())).await;
        h.transfer(TransferRequest::fast(spec)).await;
        assert!(h.recorder.peak() <= window);
    }

    // --- cache effectiveness ---

    /// Requests the second fast run may issue beyond half the first.
    const FAST_OVERHEAD: u64 = 2;

    #[tokio::test]
    async fn cached_rerun_halves_requests() {
        let h = Harness::new(4);
        let data = pattern((16 * CHUNK + 99) as usize, 6);
        let spec = write_source(h.dir.path(), "cached.bin", &data);

        let first = h.transfer(TransferRequest::fast(spec.clone())).await;
        let second = h.transfer(TransferRequest::fast(spec)).await;

        assert_eq!(first.chunks_fetched, first.chunks);
        assert_eq!(second.chunks_deduplicated, second.chunks);
        assert_eq!(second.requests.read, 0);
        assert!(
            second.requests.total() <= first.requests.total() / 2 + FAST_OVERHEAD,
            "first {:?}, second {:?}",
            first.requests,
            second.requests
        );
        assert_eq!(h.file(&second.urn).read_at(0, second.size).unwrap(), data);
    }

    #[tokio::test]
    async fn identical_content_elsewhere_is_not_refetched() {
        let h = Harness::new(4);
        let data = pattern((6 * CHUNK) as usize, 7);
        let original = write_source(h.dir.path(), "a/original.bin", &data);
        let copy = write_source(h.dir.path(), "b/copy.bin", &data);

        h.transfer(TransferRequest::fast(original)).await;
        let report = h.transfer(TransferRequest::fast(copy)).await;

        assert_eq!(report.requests.read, 0);
        assert_eq!(h.file(&report.urn).read_at(0, report.size).unwrap(), data);
    }

    #[tokio::test]
    async fn evicted_blobs_are_fetched_again() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let h = Harness::with_store(4, blobs.clone());
        let data = pattern((5 * CHUNK + 3) as usize, 8);
        let original = write_source(h.dir.path(), "first.bin", &data);
        let copy = write_source(h.dir.path(), "second.bin", &data);

        let first = h.transfer(TransferRequest::fast(original)).await;
        for (_, segment) in h.file(&first.urn).segments() {
            blobs.evict(&segment.hash);
        }

        let report = h.transfer(TransferRequest::fast(copy)).await;
        assert_eq!(report.chunks_fetched, report.chunks);
        assert_eq!(report.chunks_deduplicated, 0);
        assert_eq!(h.file(&report.urn).read_at(0, report.size).unwrap(), data);
    }

    // --- collector exactness ---

    #[tokio::test]
    async fn collector_stores_each_match_once() {
        let h = Harness::new(4);
        let root = h.dir.path();
        let mut sources = Vec::new();
        for (name, size) in [
            ("evidence/ntfs_img.dd", 3 * CHUNK + 5),
            ("evidence/sqlite", 100),
            ("evidence/nested/inner.sqlite", CHUNK),
        ] {
            let data = pattern(size as usize, size);
            let spec = write_source(root, name, &data);
            sources.push((VfsUrn::for_pathspec(CLIENT, &spec), data));
        }
        write_source(root, "evidence/notes.txt", b"ignored");
        sources.sort_by(|a, b| a.0.cmp(&b.0));

        let collector = FileCollector::new(h.flow.clone(), 2);
        let request = CollectRequest::new(
            FindSpec::new(PathSpec::os("/evidence"), r"(ntfs_img\.dd|sqlite)$"),
            "analysis/MyDownloadedFiles",
        )
        .with_find_spec(FindSpec::new(PathSpec::os("/evidence"), "sqlite$"))
        .fast();
        let (tx, _rx) = mpsc::channel(1024);
        let report = collector.collect(&request, &tx).await.unwrap();

        assert!(report.is_complete());
        let urns: Vec<&VfsUrn> = report.files.iter().map(|f| &f.urn).collect();
        let expected_urns: Vec<&VfsUrn> = sources.iter().map(|(urn, _)| urn).collect();
        assert_eq!(urns, expected_urns);

        for (result, (_, data)) in report.files.iter().zip(&sources) {
            let alias = result.output_urn.as_ref().unwrap();
            let file = h.file(alias);
            assert!(file.is_complete());
            assert_eq!(file.read_at(0, data.len() as u64).unwrap(), *data);
        }

        let output = VfsUrn::collection(CLIENT, "analysis/MyDownloadedFiles");
        let names: Vec<String> = h
            .files
            .children(&output)
            .iter()
            .map(|(urn, _)| urn.name().to_string())
            .collect();
        assert_eq!(names, vec!["ntfs_img.dd", "sqlite"]);
        assert_eq!(h.files.children(&output.child("nested")).len(), 1);
    }

    // --- chunk sizing ---

    fn assert_chunk_sizes(ranges: &[(u64, u64)], size: u64) {
        let count = size.div_ceil(CHUNK);
        assert_eq!(ranges.len() as u64, count);
        for (i, &(offset, length)) in ranges.iter().enumerate() {
            assert_eq!(offset, i as u64 * CHUNK);
            if (i as u64) < count - 1 {
                assert_eq!(length, CHUNK, "chunk {i}");
            } else {
                let tail = if size % CHUNK == 0 { CHUNK } else { size % CHUNK };
                assert_eq!(length, tail, "last chunk");
            }
        }
    }

    #[tokio::test]
    async fn chunk_requests_are_chunk_sized() {
        for size in [7 * CHUNK, 7 * CHUNK + 1, CHUNK - 1] {
            let h = Harness::new(3);
            let spec = write_source(h.dir.path(), "sized.bin", &pattern(size as usize, 9));

            h.transfer(TransferRequest::fast(spec)).await;
            assert_chunk_sizes(&h.recorder.ranges(ActionKind::HashRange), size);
            assert_chunk_sizes(&h.recorder.ranges(ActionKind::ReadRange), size);
        }
    }

    #[tokio::test]
    async fn chunk_size_override_applies() {
        let h = Harness::new(3);
        let size = 3 * CHUNK;
        let spec = write_source(h.dir.path(), "override.bin", &pattern(size as usize, 10));

        let report = h
            .transfer(TransferRequest::new(spec).with_chunk_size(CHUNK / 2))
            .await;
        assert_eq!(report.chunks, 6);
        assert!(
            h.recorder
                .ranges(ActionKind::ReadRange)
                .iter()
                .all(|&(_, length)| length == CHUNK / 2)
        );
    }

    // --- idempotent writes ---

    #[tokio::test]
    async fn repeated_transfer_leaves_content_unchanged() {
        let h = Harness::new(4);
        let data = pattern((4 * CHUNK + 11) as usize, 11);
        let spec = write_source(h.dir.path(), "twice.bin", &data);

        let first = h.transfer(TransferRequest::new(spec.clone())).await;
        let file = h.file(&first.urn);
        let segments = file.segments();

        let second = h.transfer(TransferRequest::new(spec)).await;
        assert_eq!(second.urn, first.urn);
        assert_eq!(file.segments(), segments);
        assert_eq!(file.coverage(), vec![0..first.size]);
        assert_eq!(file.read_at(0, first.size).unwrap(), data);
    }

    #[tokio::test]
    async fn rerun_over_shrunken_source() {
        let h = Harness::new(4);
        let old_size = 5 * CHUNK;
        let spec = write_source(h.dir.path(), "shrink.bin", &pattern(old_size as usize, 13));
        let first = h.transfer(TransferRequest::new(spec.clone())).await;
        assert_eq!(first.size, old_size);

        let new_size = 2 * CHUNK + 77;
        let data = pattern(new_size as usize, 14);
        write_source(h.dir.path(), "shrink.bin", &data);
        let second = h.transfer(TransferRequest::new(spec)).await;

        assert_eq!(second.urn, first.urn);
        assert_eq!(second.size, new_size);
        let file = h.file(&second.urn);
        assert!(file.is_complete());
        assert_eq!(file.size(), Some(new_size));
        assert_eq!(file.coverage(), vec![0..new_size]);
        assert_eq!(file.read_at(0, old_size).unwrap(), data);
    }

    #[tokio::test]
    async fn fast_rerun_picks_up_changed_chunk() {
        let h = Harness::new(2);
        let mut data = pattern((3 * CHUNK) as usize, 15);
        let spec = write_source(h.dir.path(), "edit.bin", &data);
        h.transfer(TransferRequest::fast(spec.clone())).await;

        data[CHUNK as usize + 5] ^= 0xff;
        write_source(h.dir.path(), "edit.bin", &data);
        let report = h.transfer(TransferRequest::fast(spec)).await;

        let file = h.file(&report.urn);
        assert!(file.is_complete());
        assert_eq!(file.read_at(0, report.size).unwrap(), data);
    }

    #[tokio::test]
    async fn duplicate_chunk_write_is_idempotent() {
        let h = Harness::new(1);
        let data = pattern((2 * CHUNK) as usize, 12);
        let spec = write_source(h.dir.path(), "dup.bin", &data);
        let report = h.transfer(TransferRequest::new(spec)).await;
        let file = h.file(&report.urn);

        let before = file.read_at(0, report.size).unwrap();
        file.write(CHUNK, &data[CHUNK as usize..]).unwrap();
        file.write(CHUNK, &data[CHUNK as usize..]).unwrap();
        assert_eq!(file.read_at(0, report.size).unwrap(), before);
        assert_eq!(file.segments().len(), 2);
    }
}
