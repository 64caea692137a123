use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_FIND_MAX_DEPTH;

/// Access method used to reach a path on the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathType {
    /// Regular filesystem access through the operating system.
    #[serde(rename = "os")]
    Os,
    /// Raw device / image access through a filesystem parser.
    #[serde(rename = "tsk")]
    Tsk,
    #[serde(rename = "registry")]
    Registry,
    #[serde(rename = "memory")]
    Memory,
}

impl PathType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Os => "os",
            Self::Tsk => "tsk",
            Self::Registry => "registry",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for PathType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies a target on a remote endpoint.
///
/// `nested` layers a second access method on top of this one, e.g. a
/// file inside a raw disk image that is itself opened through the OS.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathSpec {
    pub path: String,
    pub path_type: PathType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nested: Option<Box<PathSpec>>,
}

impl PathSpec {
    pub fn new(path: impl Into<String>, path_type: PathType) -> Self {
        Self {
            path: path.into(),
            path_type,
            nested: None,
        }
    }

    /// Shorthand for an OS path.
    pub fn os(path: impl Into<String>) -> Self {
        Self::new(path, PathType::Os)
    }

    /// Appends `inner` at the end of the nesting chain.
    pub fn with_nested(mut self, inner: PathSpec) -> Self {
        let chained = match self.nested.take() {
            Some(next) => (*next).with_nested(inner),
            None => inner,
        };
        self.nested = Some(Box::new(chained));
        self
    }

    /// The deepest layer of the chain (the actual target).
    pub fn innermost(&self) -> &PathSpec {
        let mut cur = self;
        while let Some(next) = cur.nested.as_deref() {
            cur = next;
        }
        cur
    }

    /// Iterates over the layers, outermost first.
    pub fn layers(&self) -> impl Iterator<Item = &PathSpec> {
        std::iter::successors(Some(self), |p| p.nested.as_deref())
    }

    /// Path with Windows separators normalized to `/`.
    pub fn normalized_path(&self) -> String {
        self.path.replace('\\', "/")
    }

    /// Final component of the innermost path, if any.
    pub fn basename(&self) -> Option<String> {
        let path = self.innermost().normalized_path();
        path.rsplit('/')
            .find(|c| !c.is_empty())
            .map(str::to_string)
    }
}

impl fmt::Display for PathSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for layer in self.layers() {
            if !first {
                f.write_str(" > ")?;
            }
            write!(f, "{}:{}", layer.path_type, layer.path)?;
            first = false;
        }
        Ok(())
    }
}

/// Result of a stat action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatEntry {
    pub pathspec: PathSpec,
    pub exists: bool,
    pub size: u64,
    #[serde(default)]
    pub is_dir: bool,
}

/// Remote directory search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindSpec {
    /// Root to search from.
    pub pathspec: PathSpec,
    /// Regex matched against each entry's file name.
    pub path_regex: String,
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
}

fn default_max_depth() -> u32 {
    DEFAULT_FIND_MAX_DEPTH
}

impl FindSpec {
    pub fn new(pathspec: PathSpec, path_regex: impl Into<String>) -> Self {
        Self {
            pathspec,
            path_regex: path_regex.into(),
            max_depth: DEFAULT_FIND_MAX_DEPTH,
        }
    }

    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }
}
