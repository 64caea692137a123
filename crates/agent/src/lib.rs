//! Endpoint actions answered from the local filesystem.
//!
//! [`LocalEndpoint`] implements
//! [`EndpointActions`](chunkflow_transfer::EndpointActions) with plain
//! `std::fs` calls on tokio's blocking pool. It backs single-host
//! deployments and the end-to-end tests.

mod local;
mod search;

pub use local::LocalEndpoint;
