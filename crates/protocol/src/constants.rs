use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default search depth when a find spec leaves it unset.
pub const DEFAULT_FIND_MAX_DEPTH: u32 = 4;

/// Default deadline for a single remote action.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote action identifier.
///
/// Names match the endpoint-side action registry so request logs from
/// both sides line up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    #[serde(rename = "StatFile")]
    Stat,
    #[serde(rename = "TransferBuffer")]
    ReadRange,
    #[serde(rename = "HashBuffer")]
    HashRange,
    #[serde(rename = "Find")]
    Find,
}

impl ActionKind {
    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stat => "StatFile",
            Self::ReadRange => "TransferBuffer",
            Self::HashRange => "HashBuffer",
            Self::Find => "Find",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
