use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cluster::WorkerChunk;
use crate::error::{ExecError, Result};
use crate::jobs::{JobError, Runnable};
use crate::protocol::{DataTable, Override};
use crate::workload::store::ResultStore;
use crate::workload::{Partition, Workload};

/// Environment variable carrying a run's overrides, as a JSON array, to the
/// engine process.
pub const OVERRIDES_ENV: &str = "SIM_EXEC_OVERRIDES";

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

fn default_table() -> String {
    "Report".to_string()
}

/// One simulation of a workload file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSpec {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Table that receives the CSV the program prints on stdout.
    #[serde(default = "default_table")]
    pub table: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkloadFile {
    pub simulations: Vec<SimulationSpec>,
}

/// A workload whose simulations are external engine processes.
#[derive(Debug)]
pub struct ProcessWorkload {
    simulations: Vec<SimulationSpec>,
    store: Arc<ResultStore>,
}

impl ProcessWorkload {
    pub fn new(simulations: Vec<SimulationSpec>) -> Self {
        Self {
            simulations,
            store: Arc::new(ResultStore::new()),
        }
    }

    /// Read a JSON workload file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let file: WorkloadFile = serde_json::from_str(&contents).map_err(|e| {
            ExecError::Workload(format!("failed to parse {}: {}", path.display(), e))
        })?;
        tracing::info!(
            path = %path.display(),
            simulations = file.simulations.len(),
            "Loaded workload"
        );
        Ok(Self::new(file.simulations))
    }

    pub fn simulations(&self) -> &[SimulationSpec] {
        &self.simulations
    }

    pub fn store(&self) -> &Arc<ResultStore> {
        &self.store
    }
}

impl Workload for ProcessWorkload {
    fn jobs(&self, overrides: &[Override]) -> std::result::Result<Vec<Arc<dyn Runnable>>, JobError> {
        let overrides = serde_json::to_string(overrides)?;
        Ok(self
            .simulations
            .iter()
            .map(|spec| {
                Arc::new(SimulationJob {
                    spec: spec.clone(),
                    overrides: overrides.clone(),
                    store: Arc::clone(&self.store),
                }) as Arc<dyn Runnable>
            })
            .collect())
    }

    fn read_table(&self, table: &str) -> Result<DataTable> {
        self.store.table(table)
    }
}

impl Partition for ProcessWorkload {
    /// Deal simulations round-robin into at most `pieces` chunk files.
    fn partition(&self, pieces: usize, staging: &Path) -> Result<Vec<WorkerChunk>> {
        if self.simulations.is_empty() {
            return Err(ExecError::Provisioning(
                "workload has no simulations to distribute".to_string(),
            ));
        }
        let pieces = pieces.clamp(1, self.simulations.len());
        std::fs::create_dir_all(staging)?;

        let mut buckets = vec![Vec::new(); pieces];
        for (i, spec) in self.simulations.iter().enumerate() {
            buckets[i % pieces].push(spec.clone());
        }

        buckets
            .into_iter()
            .enumerate()
            .map(|(index, simulations)| {
                let path = staging.join(format!("chunk-{}.json", index));
                let count = simulations.len();
                let json = serde_json::to_vec_pretty(&WorkloadFile { simulations })
                    .map_err(|e| ExecError::Workload(e.to_string()))?;
                std::fs::write(&path, json)?;
                tracing::debug!(chunk = index, simulations = count, path = %path.display(), "Wrote chunk");
                Ok(WorkerChunk { index, path })
            })
            .collect()
    }
}

/// Runs one simulation's engine process and stores its report.
struct SimulationJob {
    spec: SimulationSpec,
    overrides: String,
    store: Arc<ResultStore>,
}

impl Runnable for SimulationJob {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn prepare(&self) -> std::result::Result<(), JobError> {
        self.store.clear_simulation(&self.spec.name);
        Ok(())
    }

    fn run(&self, cancel: &CancellationToken) -> std::result::Result<(), JobError> {
        let mut child = Command::new(&self.spec.program)
            .args(&self.spec.args)
            .env(OVERRIDES_ENV, &self.overrides)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("failed to start {}: {}", self.spec.program, e))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if cancel.is_cancelled() {
                tracing::debug!(simulation = %self.spec.name, "Killing cancelled simulation");
                let _ = child.kill();
                let _ = child.wait();
                return Err(format!("simulation {} was cancelled", self.spec.name).into());
            }
            std::thread::sleep(EXIT_POLL_INTERVAL);
        };

        let output = stdout.join().unwrap_or_default();
        let errors = stderr.join().unwrap_or_default();
        if !status.success() {
            return Err(format!(
                "simulation {} failed ({}): {}",
                self.spec.name,
                status,
                errors.trim()
            )
            .into());
        }

        let rows = self
            .store
            .insert_csv(&self.spec.table, &self.spec.name, &output)?;
        tracing::debug!(simulation = %self.spec.name, table = %self.spec.table, rows, "Stored report");
        Ok(())
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    })
}

