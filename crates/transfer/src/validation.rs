use std::path::{Component, Path};

use crate::TransferError;

/// Validates a collector output name such as `analysis/MyDownloadedFiles`.
///
/// The name becomes URN segments under the client, so it must be a
/// relative path of plain components. Rejects:
/// - Empty or whitespace-only names
/// - Absolute paths and Windows prefixes (`C:`, `\\server`)
/// - `.` and `..` components
/// - A leading `fs` segment, which would collide with mirrored files
pub fn validate_output_name(output: &str) -> Result<(), TransferError> {
    if output.trim().is_empty() {
        return Err(TransferError::InvalidPath("empty output name".into()));
    }

    let normalized = output.replace('\\', "/");
    let path = Path::new(&normalized);

    let mut first = true;
    for component in path.components() {
        match component {
            Component::Normal(name) => {
                if first && name == "fs" {
                    return Err(TransferError::InvalidPath(format!(
                        "output name may not start with `fs`: {output}"
                    )));
                }
                first = false;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(TransferError::InvalidPath(format!(
                    "absolute output name not allowed: {output}"
                )));
            }
            Component::ParentDir | Component::CurDir => {
                return Err(TransferError::InvalidPath(format!(
                    "relative components not allowed: {output}"
                )));
            }
        }
    }

    Ok(())
}
