//! Adapter between the execution core and the simulation engine.
//!
//! The core never looks inside a simulation: a [`Workload`] turns a RUN's
//! overrides into runnable jobs and answers READ queries from whatever its
//! jobs produced.

pub mod process;
pub mod store;

use std::path::Path;
use std::sync::Arc;

use crate::cluster::WorkerChunk;
use crate::error::Result;
use crate::jobs::{JobError, Runnable};
use crate::protocol::{DataTable, Override};

pub use process::{ProcessWorkload, SimulationSpec, WorkloadFile, OVERRIDES_ENV};
pub use store::{ResultStore, SIMULATION_COLUMN};

pub trait Workload: Send + Sync + 'static {
    /// Jobs for one RUN with the given overrides applied. An empty list is a
    /// valid, trivially successful run.
    fn jobs(&self, overrides: &[Override]) -> std::result::Result<Vec<Arc<dyn Runnable>>, JobError>;

    /// Current contents of a result table.
    fn read_table(&self, table: &str) -> Result<DataTable>;
}

/// Splits a workload into chunks that can be served by separate workers.
pub trait Partition {
    /// Write at most `pieces` chunk files under `staging`.
    fn partition(&self, pieces: usize, staging: &Path) -> Result<Vec<WorkerChunk>>;
}
