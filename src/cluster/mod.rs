//! Relay mode: provisioning remote workers and fanning commands out to them.
//!
//! # Components
//!
//! - [`ClusterProvisioner`]: creates one worker per workload chunk inside an
//!   isolated namespace and removes them again
//! - [`DockerProvisioner`]: provisioner backed by the `docker` CLI
//! - [`RelayServer`]: command handler that forwards every command to all
//!   workers

pub mod docker;
pub mod relay;

use std::net::SocketAddr;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;

pub use docker::DockerProvisioner;
pub use relay::RelayServer;

/// One piece of a partitioned workload, written to its own file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerChunk {
    pub index: usize,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Pending,
    Ready,
    Terminating,
    Gone,
}

/// A provisioned worker serving one chunk.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub name: String,
    pub chunk: WorkerChunk,
    /// Reachable address once the worker is ready.
    pub address: Option<SocketAddr>,
    pub state: WorkerState,
}

impl WorkerHandle {
    pub fn pending(name: impl Into<String>, chunk: WorkerChunk) -> Self {
        Self {
            name: name.into(),
            chunk,
            address: None,
            state: WorkerState::Pending,
        }
    }

    pub fn ready(name: impl Into<String>, chunk: WorkerChunk, address: SocketAddr) -> Self {
        Self {
            name: name.into(),
            chunk,
            address: Some(address),
            state: WorkerState::Ready,
        }
    }
}

/// External cluster orchestration, reduced to what the relay needs.
#[async_trait]
pub trait ClusterProvisioner: Send {
    /// Create an isolated namespace and one worker per chunk, and wait until
    /// every worker is ready.
    async fn provision(&mut self, chunks: &[WorkerChunk]) -> Result<Vec<WorkerHandle>>;

    /// Remove every worker and the namespace created by `provision`,
    /// including resources left behind by a failed `provision`. Workers that
    /// have already exited are not an error.
    async fn teardown(&mut self) -> Result<()>;
}
