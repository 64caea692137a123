//! Data model shared between server-side flows and remote endpoints.
//!
//! Everything a flow names on the wire lives here: path specifications,
//! stat results, search specifications, content hashes and the action
//! error taxonomy. No transport or storage code.

pub mod constants;
pub mod error;
pub mod hash;
pub mod types;
pub mod urn;

// Re-export primary types for convenience.
pub use constants::ActionKind;
pub use error::ActionError;
pub use hash::{ContentHash, ParseHashError};
pub use types::{FindSpec, PathSpec, PathType, StatEntry};
pub use urn::VfsUrn;
