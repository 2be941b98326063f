use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use uuid::Uuid;

use crate::cluster::{ClusterProvisioner, WorkerChunk, WorkerHandle, WorkerState};
use crate::config::ClusterConfig;
use crate::error::{ExecError, Result};

/// Where chunk files are mounted inside worker containers.
const INPUT_DIR: &str = "/inputs";

/// Provisions workers as docker containers on a private docker network.
///
/// The network plays the role of the namespace; each container runs
/// `sim-exec listen` in keep-alive mode on the configured worker port with
/// its chunk bind-mounted read-only.
#[derive(Debug)]
pub struct DockerProvisioner {
    config: ClusterConfig,
    worker_port: u16,
    network: Option<String>,
    containers: Vec<String>,
}

impl DockerProvisioner {
    pub fn new(config: ClusterConfig, worker_port: u16) -> Self {
        Self {
            config,
            worker_port,
            network: None,
            containers: Vec::new(),
        }
    }

    pub fn network(&self) -> Option<&str> {
        self.network.as_deref()
    }

    async fn docker(&self, args: &[&str]) -> Result<String> {
        tracing::debug!(args = ?args, "Running docker");
        let output = Command::new("docker")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| ExecError::Provisioning(format!("failed to run docker: {}", e)))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(ExecError::Provisioning(format!(
                "docker {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn start_worker(&mut self, network: &str, chunk: &WorkerChunk) -> Result<WorkerHandle> {
        let name = format!("{}-worker-{}", network, chunk.index);
        let host_path = std::fs::canonicalize(&chunk.path)?;
        let file_name = host_path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .ok_or_else(|| {
                ExecError::Provisioning(format!("invalid chunk path {}", chunk.path.display()))
            })?;
        let mount = format!("{}:{}/{}:ro", host_path.display(), INPUT_DIR, file_name);
        let input = format!("{}/{}", INPUT_DIR, file_name);
        let port = self.worker_port.to_string();

        self.docker(&[
            "run",
            "-d",
            "--name",
            &name,
            "--network",
            network,
            "-v",
            &mount,
            &self.config.image,
            "listen",
            "--verbose",
            "--keep-alive",
            "-a",
            "0.0.0.0",
            "-p",
            &port,
            "-f",
            &input,
        ])
        .await?;
        self.containers.push(name.clone());
        tracing::info!(worker = %name, chunk = chunk.index, "Worker container created");

        Ok(WorkerHandle::pending(name, chunk.clone()))
    }

    /// Poll `docker inspect` until every worker is running and has an
    /// address on the network.
    async fn wait_until_ready(&self, workers: &mut [WorkerHandle]) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(self.config.ready_timeout_ms);
        let format = "{{.State.Status}} {{range .NetworkSettings.Networks}}{{.IPAddress}} {{end}}";

        loop {
            for worker in workers.iter_mut().filter(|w| w.state == WorkerState::Pending) {
                let inspected = self
                    .docker(&["inspect", "-f", format, &worker.name])
                    .await?;
                let mut fields = inspected.split_whitespace();
                match fields.next() {
                    Some("running") => {
                        if let Some(ip) = fields.next().and_then(|ip| ip.parse::<IpAddr>().ok()) {
                            worker.address = Some(SocketAddr::new(ip, self.worker_port));
                            worker.state = WorkerState::Ready;
                            tracing::info!(worker = %worker.name, addr = ?worker.address, "Worker ready");
                        }
                    }
                    Some(status @ ("exited" | "dead")) => {
                        return Err(ExecError::Provisioning(format!(
                            "worker {} is {} before becoming ready",
                            worker.name, status
                        )));
                    }
                    _ => {}
                }
            }

            if workers.iter().all(|w| w.state == WorkerState::Ready) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let pending: Vec<&str> = workers
                    .iter()
                    .filter(|w| w.state != WorkerState::Ready)
                    .map(|w| w.name.as_str())
                    .collect();
                return Err(ExecError::Provisioning(format!(
                    "timed out waiting for workers: {}",
                    pending.join(", ")
                )));
            }
            tokio::time::sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
        }
    }
}

fn already_gone(e: &ExecError) -> bool {
    let message = e.to_string();
    message.contains("No such container") || message.contains("not found")
}

#[async_trait]
impl ClusterProvisioner for DockerProvisioner {
    async fn provision(&mut self, chunks: &[WorkerChunk]) -> Result<Vec<WorkerHandle>> {
        let network = format!("{}-{}", self.config.network_prefix, Uuid::new_v4().simple());
        self.docker(&["network", "create", &network]).await?;
        tracing::info!(network = %network, "Created worker network");
        self.network = Some(network.clone());

        let mut workers = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            workers.push(self.start_worker(&network, chunk).await?);
        }

        self.wait_until_ready(&mut workers).await?;
        Ok(workers)
    }

    async fn teardown(&mut self) -> Result<()> {
        let mut first_error = None;

        for name in std::mem::take(&mut self.containers) {
            match self.docker(&["rm", "-f", &name]).await {
                Ok(_) => tracing::info!(worker = %name, "Worker removed"),
                Err(e) if already_gone(&e) => {
                    tracing::debug!(worker = %name, "Worker already gone")
                }
                Err(e) => {
                    tracing::warn!(worker = %name, error = %e, "Failed to remove worker");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(network) = self.network.take() {
            match self.docker(&["network", "rm", &network]).await {
                Ok(_) => tracing::info!(network = %network, "Removed worker network"),
                Err(e) if already_gone(&e) => {}
                Err(e) => {
                    tracing::warn!(network = %network, error = %e, "Failed to remove network");
                    first_error.get_or_insert(e);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }
}
