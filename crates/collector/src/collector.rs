//! Collection orchestrator.
//!
//! Searches first, then transfers. Matches from all find specs are
//! gathered and de-duplicated by URN before the first transfer starts, so
//! a search error aborts the collection without partial output.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chunkflow_protocol::{PathSpec, VfsUrn};
use chunkflow_transfer::{
    BlobCache, EndpointActions, EngineConfig, FileStore, RequestCounter, TransferFlow,
    TransferMode, TransferRequest, validate_output_name,
};
use futures_util::{StreamExt, stream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::CollectorError;
use crate::types::{CollectRequest, CollectionReport, CollectorEvent, FileResult};

/// Capacity of the event channel created by [`FileCollector::spawn`].
const EVENT_BUFFER: usize = 256;

/// Per-file relay buffer between a transfer flow and the collector.
const RELAY_BUFFER: usize = 64;

/// A match waiting to be transferred.
#[derive(Debug, Clone)]
struct Match {
    pathspec: PathSpec,
    /// Path relative to the search root, used as the output name.
    relative: String,
}

/// Runs collections through one transfer flow.
#[derive(Clone)]
pub struct FileCollector {
    flow: TransferFlow,
    concurrency: usize,
}

impl FileCollector {
    /// Creates a collector running at most `concurrency` transfers at once.
    pub fn new(flow: TransferFlow, concurrency: usize) -> Self {
        Self {
            flow,
            concurrency: concurrency.max(1),
        }
    }

    /// Builds the transfer flow and collector from engine configuration.
    pub fn from_config(
        endpoint: Arc<dyn EndpointActions>,
        files: Arc<FileStore>,
        cache: BlobCache,
        config: &EngineConfig,
    ) -> Self {
        let flow = TransferFlow::new(endpoint, files, cache, config.transfer.clone());
        Self::new(flow, config.collector_concurrency)
    }

    pub fn flow(&self) -> &TransferFlow {
        &self.flow
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Token cancelling every transfer of this collector.
    pub fn cancel_token(&self) -> CancellationToken {
        self.flow.cancel_token()
    }

    /// Runs a collection to completion.
    ///
    /// Events end with `Finished`, or `Failed` when an error is returned.
    pub async fn collect(
        &self,
        request: &CollectRequest,
        events: &mpsc::Sender<CollectorEvent>,
    ) -> Result<CollectionReport, CollectorError> {
        match self.collect_inner(request, events).await {
            Ok(report) => Ok(report),
            Err(e) => {
                error!(output = %request.output, error = %e, "collection failed");
                let _ = events
                    .send(CollectorEvent::Failed {
                        error: e.to_string(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    /// Runs a collection on a background task.
    pub fn spawn(&self, request: CollectRequest) -> CollectorHandle {
        let cancel = self.flow.cancel_token().child_token();
        let collector = Self {
            flow: self.flow.clone().with_cancellation(cancel.clone()),
            concurrency: self.concurrency,
        };
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let task = tokio::spawn(async move { collector.collect(&request, &tx).await });
        CollectorHandle {
            events: rx,
            task,
            cancel,
        }
    }

    async fn collect_inner(
        &self,
        request: &CollectRequest,
        events: &mpsc::Sender<CollectorEvent>,
    ) -> Result<CollectionReport, CollectorError> {
        if request.find_specs.is_empty() {
            return Err(CollectorError::NoFindSpecs);
        }
        validate_output_name(&request.output)?;

        let endpoint = self.flow.endpoint();
        let client_id = endpoint.client_id();
        let output = VfsUrn::collection(client_id, &request.output);

        let counter = RequestCounter::new(endpoint.as_ref());
        let matches = search_all(&counter, request, events).await?;
        info!(output = %output, matches = matches.len(), "search complete");

        let mut files: Vec<FileResult> = stream::iter(matches)
            .map(|(urn, m)| self.collect_one(urn, m, request.mode, &output, events))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        files.sort_by(|a, b| a.urn.cmp(&b.urn));

        let report = CollectionReport {
            output,
            files,
            searches: counter.counts().find,
        };
        let completed = report.completed().count();
        let failed = report.failed().count();
        info!(output = %report.output, completed, failed, "collection finished");
        let _ = events
            .send(CollectorEvent::Finished { completed, failed })
            .await;
        Ok(report)
    }

    async fn collect_one(
        &self,
        urn: VfsUrn,
        m: Match,
        mode: TransferMode,
        output: &VfsUrn,
        events: &mpsc::Sender<CollectorEvent>,
    ) -> FileResult {
        let request = TransferRequest {
            mode,
            ..TransferRequest::new(m.pathspec.clone())
        };

        let (tx, mut rx) = mpsc::channel(RELAY_BUFFER);
        let run = async move {
            let tx = tx;
            self.flow.run(&request, &tx).await
        };
        let relay = async {
            while let Some(event) = rx.recv().await {
                let _ = events.try_send(CollectorEvent::Transfer(event));
            }
        };
        let (result, ()) = tokio::join!(run, relay);

        match result {
            Ok(report) => {
                let output_urn = output.child(&m.relative);
                if let Some(file) = self.flow.files().open(&report.urn) {
                    self.flow.files().link(output_urn.clone(), file);
                }
                let _ = events
                    .send(CollectorEvent::FileCompleted {
                        urn: urn.clone(),
                        output_urn: output_urn.clone(),
                        size: report.size,
                    })
                    .await;
                FileResult {
                    pathspec: m.pathspec,
                    urn,
                    output_urn: Some(output_urn),
                    success: true,
                    error: None,
                    size: Some(report.size),
                }
            }
            Err(e) => {
                let error = e.to_string();
                warn!(urn = %urn, error = %error, "file transfer failed");
                let _ = events
                    .send(CollectorEvent::FileFailed {
                        urn: urn.clone(),
                        error: error.clone(),
                    })
                    .await;
                FileResult {
                    pathspec: m.pathspec,
                    urn,
                    output_urn: None,
                    success: false,
                    error: Some(error),
                    size: None,
                }
            }
        }
    }
}

/// Runs every find spec and returns distinct matches keyed by URN.
async fn search_all(
    endpoint: &RequestCounter<'_>,
    request: &CollectRequest,
    events: &mpsc::Sender<CollectorEvent>,
) -> Result<BTreeMap<VfsUrn, Match>, CollectorError> {
    let mut matches = BTreeMap::new();
    for spec in &request.find_specs {
        let _ = events
            .send(CollectorEvent::Searching {
                root: spec.pathspec.clone(),
            })
            .await;
        let mut found = endpoint.search(spec);
        while let Some(pathspec) = found.next().await {
            let pathspec = pathspec?;
            let urn = VfsUrn::for_pathspec(endpoint.client_id(), &pathspec);
            if matches.contains_key(&urn) {
                continue;
            }
            let _ = events
                .send(CollectorEvent::Matched {
                    pathspec: pathspec.clone(),
                    urn: urn.clone(),
                })
                .await;
            let relative = relative_name(&spec.pathspec, &pathspec);
            matches.insert(urn, Match { pathspec, relative });
        }
    }
    assign_output_names(&mut matches);
    Ok(matches)
}

/// Makes output names unique across the whole collection.
///
/// A relative name shared by several matches (same layout under different
/// roots) is replaced by each match's full path. Anything still taken gets
/// a numeric suffix, assigned in URN order.
fn assign_output_names(matches: &mut BTreeMap<VfsUrn, Match>) {
    let mut uses: BTreeMap<String, usize> = BTreeMap::new();
    for m in matches.values() {
        *uses.entry(m.relative.clone()).or_default() += 1;
    }

    let mut taken = BTreeSet::new();
    for (urn, m) in matches.iter_mut() {
        let original = m.relative.clone();
        if uses.get(&original).copied().unwrap_or(0) > 1 {
            let full = m.pathspec.innermost().normalized_path();
            m.relative = full.trim_matches('/').to_string();
        }
        let base = m.relative.clone();
        let mut n = 1;
        while !taken.insert(m.relative.clone()) {
            m.relative = format!("{base}.{n}");
            n += 1;
        }
        if m.relative != original {
            debug!(urn = %urn, from = %original, to = %m.relative, "output name disambiguated");
        }
    }
}

/// Path of `found` below `root`, falling back to the basename.
fn relative_name(root: &PathSpec, found: &PathSpec) -> String {
    let root_path = root.innermost().normalized_path();
    let found_path = found.innermost().normalized_path();
    let prefix = root_path.trim_end_matches('/');
    found_path
        .strip_prefix(prefix)
        .filter(|rest| rest.starts_with('/'))
        .map(|rest| rest.trim_start_matches('/').to_string())
        .filter(|rest| !rest.is_empty())
        .or_else(|| found.basename())
        .unwrap_or_else(|| found_path.clone())
}

/// Handle to a collection running on a background task.
pub struct CollectorHandle {
    events: mpsc::Receiver<CollectorEvent>,
    task: JoinHandle<Result<CollectionReport, CollectorError>>,
    cancel: CancellationToken,
}

impl CollectorHandle {
    /// Progress events, ending with `Finished` or `Failed`.
    pub fn events(&mut self) -> &mut mpsc::Receiver<CollectorEvent> {
        &mut self.events
    }

    /// Cancels every transfer of this collection.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the collection, discarding undelivered events.
    pub async fn join(self) -> Result<CollectionReport, CollectorError> {
        let Self { events, task, .. } = self;
        drop(events);
        task.await
            .map_err(|e| CollectorError::Task(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkflow_agent::LocalEndpoint;
    use chunkflow_protocol::{ActionError, FindSpec};
    use chunkflow_transfer::TransferConfig;
    use std::fs;
    use tempfile::TempDir;

    fn create_test_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("data").join("nested")).unwrap();
        fs::write(root.join("data").join("ntfs_img.dd"), vec![7u8; 3000]).unwrap();
        fs::write(root.join("data").join("sqlite"), b"SQLite format 3").unwrap();
        fs::write(root.join("data").join("readme.txt"), b"skip me").unwrap();
        fs::write(
            root.join("data").join("nested").join("inner.sqlite"),
            b"inner",
        )
        .unwrap();
        dir
    }

    fn collector(dir: &TempDir) -> FileCollector {
        let endpoint = Arc::new(LocalEndpoint::rooted("C.1000", dir.path()));
        let config = TransferConfig {
            chunk_size: 1024,
            window_size: 4,
            ..TransferConfig::default()
        };
        let flow = TransferFlow::new(
            endpoint,
            Arc::new(FileStore::default()),
            BlobCache::new(100),
            config,
        );
        FileCollector::new(flow, 2)
    }

    async fn drain(mut rx: mpsc::Receiver<CollectorEvent>) -> Vec<CollectorEvent> {
        let mut out = Vec::new();
        while let Some(event) = rx.recv().await {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn collects_every_match_once() {
        let dir = create_test_tree();
        let collector = collector(&dir);
        let request = CollectRequest::new(
            FindSpec::new(PathSpec::os("/data"), "(ntfs_img.dd|sqlite)$"),
            "analysis/MyDownloadedFiles",
        );
        let (tx, rx) = mpsc::channel(1024);

        let report = collector.collect(&request, &tx).await.unwrap();
        drop(tx);

        assert_eq!(report.files.len(), 3);
        assert!(report.is_complete());
        assert_eq!(report.searches, 1);
        assert_eq!(
            report.output.as_str(),
            "aff4:/C.1000/analysis/MyDownloadedFiles"
        );

        let files = collector.flow().files();
        let children = files.children(&report.output);
        let names: Vec<&str> = children.iter().map(|(urn, _)| urn.name()).collect();
        assert_eq!(names, vec!["ntfs_img.dd", "sqlite"]);
        for (_, file) in &children {
            assert!(file.is_complete());
        }
        let nested = report.output.child("nested").child("inner.sqlite");
        let inner = files.open(&nested).unwrap();
        assert_eq!(inner.read_at(0, 100).unwrap(), b"inner");

        let events = drain(rx).await;
        assert!(matches!(
            events.last(),
            Some(CollectorEvent::Finished {
                completed: 3,
                failed: 0
            })
        ));
        let matched = events
            .iter()
            .filter(|e| matches!(e, CollectorEvent::Matched { .. }))
            .count();
        assert_eq!(matched, 3);
    }

    #[tokio::test]
    async fn overlapping_specs_deduplicated() {
        let dir = create_test_tree();
        let collector = collector(&dir);
        let request = CollectRequest::new(FindSpec::new(PathSpec::os("/data"), "sqlite$"), "out")
            .with_find_spec(FindSpec::new(PathSpec::os("/data/nested"), ".*"));
        let (tx, _rx) = mpsc::channel(1024);

        let report = collector.collect(&request, &tx).await.unwrap();
        assert_eq!(report.files.len(), 2);
        assert_eq!(report.searches, 2);
    }

    /// Local endpoint whose reads of one path always fail.
    struct BrokenReads {
        inner: LocalEndpoint,
        broken: &'static str,
    }

    impl EndpointActions for BrokenReads {
        fn client_id(&self) -> &str {
            self.inner.client_id()
        }

        fn stat<'a>(
            &'a self,
            pathspec: &'a PathSpec,
        ) -> chunkflow_transfer::ActionFuture<'a, chunkflow_protocol::StatEntry> {
            self.inner.stat(pathspec)
        }

        fn read_range<'a>(
            &'a self,
            pathspec: &'a PathSpec,
            offset: u64,
            length: u64,
        ) -> chunkflow_transfer::ActionFuture<'a, Vec<u8>> {
            if pathspec.path == self.broken {
                return Box::pin(async {
                    Err(ActionError::PermissionDenied("locked by another process".into()))
                });
            }
            self.inner.read_range(pathspec, offset, length)
        }

        fn hash_range<'a>(
            &'a self,
            pathspec: &'a PathSpec,
            offset: u64,
            length: u64,
        ) -> chunkflow_transfer::ActionFuture<'a, chunkflow_protocol::ContentHash> {
            self.inner.hash_range(pathspec, offset, length)
        }

        fn search<'a>(
            &'a self,
            spec: &'a FindSpec,
        ) -> chunkflow_transfer::ActionStream<'a, PathSpec> {
            self.inner.search(spec)
        }
    }

    #[tokio::test]
    async fn failed_file_does_not_abort_siblings() {
        let dir = create_test_tree();
        let endpoint = Arc::new(BrokenReads {
            inner: LocalEndpoint::rooted("C.1000", dir.path()),
            broken: "/data/sqlite",
        });
        let flow = TransferFlow::new(
            endpoint,
            Arc::new(FileStore::default()),
            BlobCache::default(),
            TransferConfig {
                chunk_size: 1024,
                window_size: 4,
                ..TransferConfig::default()
            },
        );
        let collector = FileCollector::new(flow, 1);
        let request = CollectRequest::new(
            FindSpec::new(PathSpec::os("/data"), "(ntfs_img.dd|sqlite)$"),
            "out",
        );
        let (tx, _rx) = mpsc::channel(1024);

        let report = collector.collect(&request, &tx).await.unwrap();
        assert_eq!(report.files.len(), 3);
        assert_eq!(report.completed().count(), 2);

        let failed: Vec<_> = report.failed().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].pathspec.path, "/data/sqlite");
        assert!(failed[0].output_urn.is_none());
        assert!(failed[0].error.as_deref().unwrap().contains("locked"));

        let children = collector.flow().files().children(&report.output);
        let names: Vec<&str> = children.iter().map(|(urn, _)| urn.name()).collect();
        assert_eq!(names, vec!["ntfs_img.dd"]);
    }

    #[tokio::test]
    async fn search_error_aborts_collection() {
        let dir = create_test_tree();
        let collector = collector(&dir);
        let request = CollectRequest::new(FindSpec::new(PathSpec::os("/absent"), ".*"), "out");
        let (tx, rx) = mpsc::channel(16);

        let err = collector.collect(&request, &tx).await.unwrap_err();
        drop(tx);
        assert!(matches!(err, CollectorError::Search(_)));
        let events = drain(rx).await;
        assert!(matches!(events.last(), Some(CollectorEvent::Failed { .. })));
    }

    #[tokio::test]
    async fn invalid_output_rejected() {
        let dir = create_test_tree();
        let collector = collector(&dir);
        let request = CollectRequest::new(FindSpec::new(PathSpec::os("/data"), ".*"), "../escape");
        let (tx, _rx) = mpsc::channel(16);
        assert!(matches!(
            collector.collect(&request, &tx).await,
            Err(CollectorError::Transfer(_))
        ));
    }

    #[tokio::test]
    async fn empty_request_rejected() {
        let dir = create_test_tree();
        let collector = collector(&dir);
        let request = CollectRequest {
            find_specs: Vec::new(),
            output: "out".into(),
            mode: TransferMode::Plain,
        };
        let (tx, _rx) = mpsc::channel(16);
        assert!(matches!(
            collector.collect(&request, &tx).await,
            Err(CollectorError::NoFindSpecs)
        ));
    }

    #[tokio::test]
    async fn spawned_collection_cancelled() {
        let dir = create_test_tree();
        let collector = collector(&dir);
        let handle = collector.spawn(CollectRequest::new(
            FindSpec::new(PathSpec::os("/data"), "sqlite$"),
            "out",
        ));
        handle.cancel();
        let report = handle.join().await.unwrap();
        assert_eq!(report.files.len(), 2);
        assert_eq!(report.completed().count(), 0);
        assert!(
            report
                .failed()
                .all(|f| f.error.as_deref() == Some("cancelled"))
        );
    }

    #[tokio::test]
    async fn same_name_under_different_roots_kept_apart() {
        let dir = TempDir::new().unwrap();
        for (root, content) in [("x", b"from x"), ("y", b"from y")] {
            fs::create_dir_all(dir.path().join(root)).unwrap();
            fs::write(dir.path().join(root).join("a.db"), content).unwrap();
        }
        let collector = collector(&dir);
        let request = CollectRequest::new(FindSpec::new(PathSpec::os("/x"), r"a\.db$"), "out")
            .with_find_spec(FindSpec::new(PathSpec::os("/y"), r"a\.db$"));
        let (tx, _rx) = mpsc::channel(1024);

        let report = collector.collect(&request, &tx).await.unwrap();
        assert_eq!(report.files.len(), 2);
        assert!(report.is_complete());

        let aliases: Vec<&str> = report
            .files
            .iter()
            .map(|f| f.output_urn.as_ref().unwrap().as_str())
            .collect();
        assert_eq!(aliases, vec!["aff4:/C.1000/out/x/a.db", "aff4:/C.1000/out/y/a.db"]);

        let files = collector.flow().files();
        for (alias, expected) in [("x", &b"from x"[..]), ("y", &b"from y"[..])] {
            let file = files.open(&report.output.child(alias).child("a.db")).unwrap();
            assert_eq!(file.read_at(0, 100).unwrap(), expected);
        }
    }

    fn named(entries: &[(&str, &str)]) -> Vec<String> {
        let mut matches: BTreeMap<VfsUrn, Match> = entries
            .iter()
            .map(|&(path, relative)| {
                let pathspec = PathSpec::os(path);
                (
                    VfsUrn::for_pathspec("C.1", &pathspec),
                    Match {
                        pathspec,
                        relative: relative.to_string(),
                    },
                )
            })
            .collect();
        assign_output_names(&mut matches);
        matches.into_values().map(|m| m.relative).collect()
    }

    #[test]
    fn output_names_are_unique() {
        assert_eq!(named(&[("/x/a", "a"), ("/y/b", "b")]), vec!["a", "b"]);
        assert_eq!(named(&[("/x/a", "a"), ("/y/a", "a")]), vec!["x/a", "y/a"]);
        // A full path that collides with another match's name is suffixed.
        assert_eq!(
            named(&[("/x/a", "a"), ("/y/a", "a"), ("/z/x/a", "x/a")]),
            vec!["x/a", "y/a", "x/a.1"]
        );
    }

    #[test]
    fn relative_names() {
        let root = PathSpec::os("/data");
        assert_eq!(relative_name(&root, &PathSpec::os("/data/a.db")), "a.db");
        assert_eq!(
            relative_name(&root, &PathSpec::os("/data/x/b.db")),
            "x/b.db"
        );
        assert_eq!(relative_name(&PathSpec::os("/data/"), &PathSpec::os("/data/c")), "c");
        // Sibling with a shared prefix is not "below" the root.
        assert_eq!(relative_name(&root, &PathSpec::os("/database/d")), "d");
    }
}
