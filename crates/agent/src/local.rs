use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chunkflow_protocol::{ActionError, ContentHash, FindSpec, PathSpec, PathType, StatEntry};
use chunkflow_transfer::{ActionFuture, ActionStream, EndpointActions};
use futures_util::{StreamExt, future, stream};
use regex::Regex;
use tracing::debug;

use crate::search;

/// Read buffers are preallocated up to this size; larger reads grow.
const MAX_PREALLOC: u64 = 4 * 1024 * 1024;

/// Endpoint serving OS paths from this machine.
///
/// With a root, endpoint paths are resolved beneath it (`/a/b` maps to
/// `<root>/a/b`) and may not escape it.
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    client_id: String,
    root: Option<PathBuf>,
}

impl LocalEndpoint {
    /// Endpoint over the whole filesystem.
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            root: None,
        }
    }

    /// Endpoint confined to `root`.
    pub fn rooted(client_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            client_id: client_id.into(),
            root: Some(root.into()),
        }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Maps a pathspec to a local path.
    fn resolve(&self, pathspec: &PathSpec) -> Result<PathBuf, ActionError> {
        if pathspec.nested.is_some() {
            return Err(ActionError::Unsupported(format!(
                "nested pathspec: {pathspec}"
            )));
        }
        if pathspec.path_type != PathType::Os {
            return Err(ActionError::Unsupported(format!(
                "path type {}",
                pathspec.path_type
            )));
        }
        let Some(root) = &self.root else {
            return Ok(PathBuf::from(&pathspec.path));
        };

        let mut resolved = root.clone();
        for part in pathspec.normalized_path().split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    return Err(ActionError::PermissionDenied(format!(
                        "path escapes endpoint root: {}",
                        pathspec.path
                    )));
                }
                name => resolved.push(name),
            }
        }
        Ok(resolved)
    }

    /// Maps a local path back into the endpoint's namespace.
    fn to_pathspec(&self, path: &Path) -> PathSpec {
        let relative = self
            .root
            .as_deref()
            .and_then(|root| path.strip_prefix(root).ok());
        match relative {
            Some(rel) => PathSpec::os(format!(
                "/{}",
                rel.to_string_lossy().replace('\\', "/")
            )),
            None => PathSpec::os(path.to_string_lossy()),
        }
    }
}

/// Runs filesystem work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, ActionError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ActionError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ActionError::Io(format!("blocking task failed: {e}")))?
}

fn stat_path(path: &Path, pathspec: PathSpec) -> Result<StatEntry, ActionError> {
    match std::fs::metadata(path) {
        Ok(metadata) => Ok(StatEntry {
            pathspec,
            exists: true,
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            is_dir: metadata.is_dir(),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(StatEntry {
            pathspec,
            exists: false,
            size: 0,
            is_dir: false,
        }),
        Err(e) => Err(e.into()),
    }
}

/// Reads up to `length` bytes at `offset`; short only at end of file.
fn read_span(path: &Path, offset: u64, length: u64) -> Result<Vec<u8>, ActionError> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(length.min(MAX_PREALLOC) as usize);
    file.take(length).read_to_end(&mut buf)?;
    Ok(buf)
}

impl EndpointActions for LocalEndpoint {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn stat<'a>(&'a self, pathspec: &'a PathSpec) -> ActionFuture<'a, StatEntry> {
        Box::pin(async move {
            let path = self.resolve(pathspec)?;
            let pathspec = pathspec.clone();
            blocking(move || stat_path(&path, pathspec)).await
        })
    }

    fn read_range<'a>(
        &'a self,
        pathspec: &'a PathSpec,
        offset: u64,
        length: u64,
    ) -> ActionFuture<'a, Vec<u8>> {
        Box::pin(async move {
            let path = self.resolve(pathspec)?;
            blocking(move || read_span(&path, offset, length)).await
        })
    }

    fn hash_range<'a>(
        &'a self,
        pathspec: &'a PathSpec,
        offset: u64,
        length: u64,
    ) -> ActionFuture<'a, ContentHash> {
        Box::pin(async move {
            let path = self.resolve(pathspec)?;
            blocking(move || read_span(&path, offset, length).map(|data| ContentHash::digest(&data)))
                .await
        })
    }

    fn search<'a>(&'a self, spec: &'a FindSpec) -> ActionStream<'a, PathSpec> {
        let root = self.resolve(&spec.pathspec);
        let regex = Regex::new(&spec.path_regex)
            .map_err(|e| ActionError::InvalidArgument(format!("invalid path_regex: {e}")));
        let max_depth = spec.max_depth;

        stream::once(async move {
            let root = root?;
            let regex = regex?;
            debug!(root = %root.display(), regex = regex.as_str(), max_depth, "searching");
            blocking(move || search::find(&root, &regex, max_depth)).await
        })
        .flat_map(move |result| match result {
            Ok(paths) => stream::iter(
                paths
                    .into_iter()
                    .map(|path| Ok(self.to_pathspec(&path)))
                    .collect::<Vec<_>>(),
            )
            .left_stream(),
            Err(e) => stream::once(future::ready(Err(e))).right_stream(),
        })
        .boxed()
    }
}
