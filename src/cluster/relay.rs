use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::cluster::{ClusterProvisioner, WorkerChunk, WorkerHandle, WorkerState};
use crate::config::{RelayConfig, TransportConfig};
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::{ExecError, Result};
use crate::protocol::{Command, CommandOutput, CommandReply};
use crate::server::CommandHandler;
use crate::workload::Partition;

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(200);

struct RelayWorker {
    handle: WorkerHandle,
    connection: Option<ConnectionManager>,
}

impl RelayWorker {
    /// Send one command, connecting first if there is no live connection.
    async fn send(&mut self, command: &Command, connect_timeout: Duration) -> Result<CommandReply> {
        let addr = self
            .handle
            .address
            .ok_or_else(|| ExecError::WorkerAddressUnknown(self.handle.name.clone()))?;

        if self.connection.is_none() {
            self.connection = Some(connect_with_retry(&self.handle.name, addr, connect_timeout).await?);
        }
        let Some(connection) = self.connection.as_mut() else {
            return Err(ExecError::NotConnected);
        };

        let reply = connection.send_command(command).await;
        let keep = match &reply {
            Ok(_) | Err(ExecError::CommandFailed(_)) => connection.state() != ConnectionState::Closed,
            Err(_) => false,
        };
        if !keep {
            // The stream may be out of step with the worker; start over next time.
            if let Some(mut connection) = self.connection.take() {
                connection.disconnect().await;
            }
        }
        reply
    }
}

async fn connect_with_retry(
    name: &str,
    addr: std::net::SocketAddr,
    timeout: Duration,
) -> Result<ConnectionManager> {
    let deadline = Instant::now() + timeout;
    loop {
        match ConnectionManager::connect(TransportConfig::tcp(addr)).await {
            Ok(connection) => {
                tracing::debug!(worker = name, addr = %addr, "Connected to worker");
                return Ok(connection);
            }
            Err(e) if Instant::now() < deadline => {
                tracing::debug!(worker = name, addr = %addr, error = %e, "Worker not reachable yet");
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Serves commands by forwarding them to a set of provisioned workers.
///
/// Every command goes to every worker, in worker order. A failure on one
/// worker does not stop delivery to the others; the command then fails
/// with the list of workers that did not accept it. Per-worker results are
/// not merged, so READ is delivered but reported as unsupported.
pub struct RelayServer<P: ClusterProvisioner> {
    provisioner: P,
    workers: Vec<RelayWorker>,
    connect_timeout: Duration,
    torn_down: bool,
}

impl<P: ClusterProvisioner> std::fmt::Debug for RelayServer<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("workers", &self.workers.len())
            .field("torn_down", &self.torn_down)
            .finish()
    }
}

impl<P: ClusterProvisioner> RelayServer<P> {
    /// Partition `workload` into `config.worker_count` chunks and start a
    /// relay over them.
    pub async fn start(
        config: &RelayConfig,
        provisioner: P,
        workload: &impl Partition,
    ) -> Result<Self> {
        let chunks = workload.partition(config.worker_count, &config.staging_dir)?;
        Self::start_with_chunks(config, provisioner, &chunks).await
    }

    /// Provision one worker per chunk and connect to each of them. Any
    /// failure tears down whatever was created and aborts startup.
    pub async fn start_with_chunks(
        config: &RelayConfig,
        mut provisioner: P,
        chunks: &[WorkerChunk],
    ) -> Result<Self> {
        tracing::info!(workers = chunks.len(), "Provisioning workers");
        let handles = match provisioner.provision(chunks).await {
            Ok(handles) => handles,
            Err(e) => {
                tracing::error!(error = %e, "Provisioning failed");
                if let Err(cleanup) = provisioner.teardown().await {
                    tracing::warn!(error = %cleanup, "Cleanup after failed provisioning failed");
                }
                return Err(e);
            }
        };

        let mut relay = Self {
            provisioner,
            workers: handles
                .into_iter()
                .map(|handle| RelayWorker {
                    handle,
                    connection: None,
                })
                .collect(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            torn_down: false,
        };

        if let Err(e) = relay.connect_all().await {
            tracing::error!(error = %e, "Failed to reach workers");
            if let Err(cleanup) = relay.teardown().await {
                tracing::warn!(error = %cleanup, "Cleanup after failed startup failed");
            }
            return Err(e);
        }

        tracing::info!(workers = relay.workers.len(), "Relay server ready");
        Ok(relay)
    }

    /// Open a connection to every worker whose address is known. Workers
    /// without an address are reported when a command is relayed.
    async fn connect_all(&mut self) -> Result<()> {
        for worker in &mut self.workers {
            let Some(addr) = worker.handle.address else {
                tracing::warn!(worker = %worker.handle.name, "Worker has no address yet");
                continue;
            };
            let connection = connect_with_retry(&worker.handle.name, addr, self.connect_timeout)
                .await
                .map_err(|e| {
                    ExecError::Provisioning(format!(
                        "worker {} at {} is unreachable: {}",
                        worker.handle.name, addr, e
                    ))
                })?;
            worker.connection = Some(connection);
        }
        Ok(())
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.workers.iter().map(|w| &w.handle)
    }

    pub fn provisioner(&self) -> &P {
        &self.provisioner
    }

    /// Send `command` to every worker, then report which ones failed.
    pub async fn relay(&mut self, command: &Command) -> Result<()> {
        let total = self.workers.len();
        let mut failures = Vec::new();

        for worker in &mut self.workers {
            match worker.send(command, self.connect_timeout).await {
                Ok(_) => tracing::info!(
                    worker = %worker.handle.name,
                    command = command.keyword(),
                    "Relayed command"
                ),
                Err(e) => {
                    tracing::warn!(worker = %worker.handle.name, error = %e, "Relay to worker failed");
                    failures.push(format!("{}: {}", worker.handle.name, e));
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ExecError::Relay {
                failed: failures.len(),
                total,
                details: failures.join("; "),
            })
        }
    }

    /// Close every worker connection and remove the provisioned workers.
    pub async fn shutdown(mut self) -> Result<()> {
        self.teardown().await
    }

    async fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        tracing::info!(workers = self.workers.len(), "Tearing down workers");
        for worker in &mut self.workers {
            worker.handle.state = WorkerState::Terminating;
            if let Some(mut connection) = worker.connection.take() {
                connection.disconnect().await;
            }
        }
        let result = self.provisioner.teardown().await;
        for worker in &mut self.workers {
            worker.handle.state = WorkerState::Gone;
        }
        self.torn_down = true;
        result
    }
}

impl<P: ClusterProvisioner> Drop for RelayServer<P> {
    fn drop(&mut self) {
        if !self.torn_down && !self.workers.is_empty() {
            tracing::warn!(
                workers = self.workers.len(),
                "Relay dropped without shutdown; workers were not removed"
            );
        }
    }
}

#[async_trait]
impl<P: ClusterProvisioner> CommandHandler for RelayServer<P> {
    async fn run_command(&mut self, command: &Command) -> Result<CommandOutput> {
        self.relay(command).await?;
        match command {
            Command::Read { table, .. } => Err(ExecError::CommandFailed(format!(
                "READ {} was delivered to every worker but this relay has no result aggregator configured",
                table
            ))),
            Command::Run { .. } | Command::Version => Ok(CommandOutput::Completed),
        }
    }
}
