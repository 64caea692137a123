//! Server-side addresses for assembled files and collections.
//!
//! Layout:
//! - files: `aff4:/<client_id>/fs/<pathtype>/<path>[/<pathtype>/<path>...]`
//! - collections: `aff4:/<client_id>/<output>/<name>`

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::PathSpec;

const SCHEME: &str = "aff4:/";

/// Normalized, slash-separated address of a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VfsUrn(String);

impl VfsUrn {
    /// Builds a URN from raw segments, dropping empty components.
    pub fn from_segments<'a>(segments: impl IntoIterator<Item = &'a str>) -> Self {
        let mut urn = String::from(SCHEME);
        let mut first = true;
        for segment in segments {
            for part in segment.split(['/', '\\']).filter(|p| !p.is_empty()) {
                if !first {
                    urn.push('/');
                }
                urn.push_str(part);
                first = false;
            }
        }
        Self(urn)
    }

    /// Parses an `aff4:/...` string, normalizing separators.
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix(SCHEME)?;
        Some(Self::from_segments([rest]))
    }

    /// Address of the virtual file mirroring `pathspec` on `client_id`.
    pub fn for_pathspec(client_id: &str, pathspec: &PathSpec) -> Self {
        let mut segments: Vec<&str> = vec![client_id, "fs"];
        for layer in pathspec.layers() {
            segments.push(layer.path_type.as_str());
            segments.push(&layer.path);
        }
        Self::from_segments(segments)
    }

    /// Address of a named collection (output location) under a client.
    pub fn collection(client_id: &str, output: &str) -> Self {
        Self::from_segments([client_id, output])
    }

    /// Appends a child segment.
    pub fn child(&self, name: &str) -> Self {
        Self::from_segments([self.path(), name])
    }

    /// Parent address, or `None` at the root.
    pub fn parent(&self) -> Option<Self> {
        let path = self.path();
        let (parent, _) = path.rsplit_once('/')?;
        Some(Self::from_segments([parent]))
    }

    /// Final segment.
    pub fn name(&self) -> &str {
        let path = self.path();
        path.rsplit_once('/').map_or(path, |(_, name)| name)
    }

    /// Returns `true` if `self` is a direct child of `parent`.
    pub fn is_child_of(&self, parent: &VfsUrn) -> bool {
        self.parent().as_ref() == Some(parent)
    }

    /// Path portion without the scheme.
    pub fn path(&self) -> &str {
        &self.0[SCHEME.len()..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VfsUrn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
