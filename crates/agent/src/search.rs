//! Recursive file search.
//!
//! Walks a directory tree and returns the files whose name matches a
//! regex. Entries directly in the root are at depth 0; a subdirectory is
//! entered only while its depth stays within `max_depth`. Symlinks are not
//! followed.

use std::path::{Path, PathBuf};

use chunkflow_protocol::ActionError;
use regex::Regex;
use tracing::debug;

/// Returns matching files under `root`, in name order per directory.
pub(crate) fn find(root: &Path, regex: &Regex, max_depth: u32) -> Result<Vec<PathBuf>, ActionError> {
    let metadata = std::fs::metadata(root)?;
    if !metadata.is_dir() {
        return Err(ActionError::InvalidArgument(format!(
            "search root is not a directory: {}",
            root.display()
        )));
    }

    let mut found = Vec::new();
    walk_dir(root, 0, regex, max_depth, &mut found)?;
    debug!(root = %root.display(), matches = found.len(), "search finished");
    Ok(found)
}

fn walk_dir(
    current: &Path,
    depth: u32,
    regex: &Regex,
    max_depth: u32,
    found: &mut Vec<PathBuf>,
) -> Result<(), ActionError> {
    let mut entries: Vec<_> = std::fs::read_dir(current)?
        .filter_map(|entry| entry.ok())
        .collect();
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let path = entry.path();

        if file_type.is_dir() {
            if depth < max_depth {
                // Unreadable subdirectories are skipped, not fatal.
                if let Err(e) = walk_dir(&path, depth + 1, regex, max_depth, found) {
                    debug!(path = %path.display(), error = %e, "skipping directory");
                }
            }
        } else if file_type.is_file() {
            let name = entry.file_name();
            if regex.is_match(&name.to_string_lossy()) {
                found.push(path);
            }
        }
    }

    Ok(())
}
