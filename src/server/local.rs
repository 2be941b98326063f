use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::RunnerConfig;
use crate::error::{ExecError, Result};
use crate::jobs::{EmptyJob, JobManager, JobRunner};
use crate::protocol::{Command, CommandOutput, Override};
use crate::server::CommandHandler;
use crate::status::RunMonitor;
use crate::workload::Workload;

/// Executes commands against a local workload: RUN schedules the workload's
/// jobs on a fresh [`JobRunner`], READ queries its result store.
pub struct LocalExecutor<W> {
    workload: Arc<W>,
    runner: RunnerConfig,
    monitor: Arc<RunMonitor>,
    shutdown: CancellationToken,
}

impl<W> std::fmt::Debug for LocalExecutor<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalExecutor")
            .field("runner", &self.runner)
            .field("monitor", &self.monitor)
            .finish()
    }
}

impl<W: Workload> LocalExecutor<W> {
    pub fn new(workload: Arc<W>, runner: RunnerConfig) -> Self {
        Self {
            workload,
            runner,
            monitor: Arc::new(RunMonitor::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Stop an in-flight run when `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn monitor(&self) -> Arc<RunMonitor> {
        Arc::clone(&self.monitor)
    }

    pub fn workload(&self) -> &Arc<W> {
        &self.workload
    }

    async fn run_jobs(&self, overrides: &[Override]) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ExecError::CommandFailed("run cancelled by shutdown".to_string()));
        }
        let jobs = self
            .workload
            .jobs(overrides)
            .map_err(|e| ExecError::Workload(e.to_string()))?;

        let manager = Arc::new(JobManager::new("run"));
        if jobs.is_empty() {
            manager.add_job(EmptyJob);
        }
        for job in jobs {
            manager.add(job);
        }
        tracing::info!(jobs = manager.num_jobs(), overrides = overrides.len(), "Starting run");

        let runner = JobRunner::new(self.runner.clone());
        runner.add(Arc::clone(&manager));
        self.monitor.track(runner.clone());

        // Start before selecting so a stop request always finds this run's token.
        runner.run(false);
        let background = runner.clone();
        let mut task = tokio::task::spawn_blocking(move || background.wait());

        let (joined, cancelled) = tokio::select! {
            joined = &mut task => (joined, false),
            _ = self.shutdown.cancelled() => {
                tracing::info!("Shutdown requested, stopping run");
                let stopper = runner.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || stopper.stop()).await {
                    tracing::error!(error = %e, "Failed to stop job runner");
                }
                (task.await, true)
            }
        };

        let record = joined
            .map_err(|e| ExecError::Internal(format!("job runner task failed: {}", e)))?
            .ok_or_else(|| ExecError::Internal("job runner returned no result".to_string()))?;

        if let Some(e) = record.error {
            return Err(ExecError::CommandFailed(e.to_string()));
        }
        if cancelled {
            return Err(ExecError::CommandFailed("run cancelled by shutdown".to_string()));
        }

        let errors = manager.errors();
        if !errors.is_empty() {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            return Err(ExecError::CommandFailed(messages.join("\n")));
        }

        tracing::info!(
            jobs = manager.num_jobs(),
            elapsed_ms = record.elapsed.as_millis() as u64,
            "Run completed"
        );
        Ok(())
    }
}

#[async_trait]
impl<W: Workload> CommandHandler for LocalExecutor<W> {
    async fn run_command(&mut self, command: &Command) -> Result<CommandOutput> {
        match command {
            Command::Run { overrides } => {
                self.run_jobs(overrides).await?;
                Ok(CommandOutput::Completed)
            }
            Command::Read { table, .. } => {
                let table = self.workload.read_table(table)?;
                Ok(CommandOutput::Table(table))
            }
            Command::Version => Ok(CommandOutput::Completed),
        }
    }
}
