//! Relay server tests with a scripted provisioner and in-process workers.


use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use sim_exec::cluster::{ClusterProvisioner, RelayServer, WorkerChunk, WorkerHandle, WorkerState};
use sim_exec::config::RelayConfig;
use sim_exec::error::{ExecError, Result};
use sim_exec::protocol::{Command, CommandReply, Override, ParamValue};
use sim_exec::server::CommandHandler;
use sim_exec::workload::{ProcessWorkload, SimulationSpec};
use tokio_util::sync::CancellationToken;

use test_harness::{connect, spawn_server, spawn_server_on, RecordingHandler, TestServer};

/// Hands out pre-started workers instead of creating real ones.
#[derive(Default)]
struct MockProvisioner {
    addresses: Vec<Option<SocketAddr>>,
    fail: bool,
    chunks_seen: Arc<Mutex<Vec<WorkerChunk>>>,
    teardowns: Arc<AtomicUsize>,
}

impl MockProvisioner {
    fn with_workers(addresses: Vec<Option<SocketAddr>>) -> Self {
        Self {
            addresses,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ClusterProvisioner for MockProvisioner {
    async fn provision(&mut self, chunks: &[WorkerChunk]) -> Result<Vec<WorkerHandle>> {
        self.chunks_seen.lock().extend(chunks.iter().cloned());
        if self.fail {
            return Err(ExecError::Provisioning("quota exceeded".to_string()));
        }
        Ok(chunks
            .iter()
            .map(|chunk| {
                let name = format!("worker-{}", chunk.index);
                match self.addresses.get(chunk.index).copied().flatten() {
                    Some(addr) => WorkerHandle::ready(name, chunk.clone(), addr),
                    None => WorkerHandle::pending(name, chunk.clone()),
                }
            })
            .collect())
    }

    async fn teardown(&mut self) -> Result<()> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn chunks(count: usize) -> Vec<WorkerChunk> {
    (0..count)
        .map(|index| WorkerChunk {
            index,
            path: PathBuf::from(format!("chunk-{}.json", index)),
        })
        .collect()
}

fn relay_config(workers: usize) -> RelayConfig {
    RelayConfig::new(workers).with_connect_timeout_ms(500)
}

fn run_command() -> Command {
    Command::Run {
        overrides: vec![Override::new("[Sim].Seed", ParamValue::Integer(9))],
    }
}

async fn start_workers(handlers: &[RecordingHandler]) -> Vec<TestServer<RecordingHandler>> {
    let mut servers = Vec::new();
    for handler in handlers {
        servers.push(spawn_server(handler.clone(), true).await);
    }
    servers
}

async fn stop_workers(servers: Vec<TestServer<RecordingHandler>>) {
    for server in servers {
        server.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_relay_reaches_every_worker_despite_a_failure() {
    let handlers = vec![
        RecordingHandler::default(),
        RecordingHandler::failing(),
        RecordingHandler::default(),
    ];
    let servers = start_workers(&handlers).await;
    let provisioner =
        MockProvisioner::with_workers(servers.iter().map(|s| Some(s.addr)).collect());
    let teardowns = Arc::clone(&provisioner.teardowns);

    let mut relay = RelayServer::start_with_chunks(&relay_config(3), provisioner, &chunks(3))
        .await
        .unwrap();
    assert_eq!(relay.workers().count(), 3);
    assert!(relay.workers().all(|w| w.state == WorkerState::Ready));

    let err = relay.run_command(&run_command()).await.unwrap_err();
    match err {
        ExecError::Relay {
            failed,
            total,
            details,
        } => {
            assert_eq!(failed, 1);
            assert_eq!(total, 3);
            assert!(details.contains("worker-1"));
            assert!(details.contains("worker refused the run"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    for handler in &handlers {
        assert_eq!(handler.received(), vec![run_command()]);
    }

    // The failing worker keeps its connection and still takes commands.
    relay.run_command(&Command::Version).await.unwrap();
    assert!(handlers.iter().all(|h| h.received().len() == 2));

    relay.shutdown().await.unwrap();
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    stop_workers(servers).await;
}

fn relay_failure(err: ExecError) -> (usize, usize, String) {
    match err {
        ExecError::Relay {
            failed,
            total,
            details,
        } => (failed, total, details),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_lost_worker_connection_does_not_block_the_others() {
    let handlers = vec![
        RecordingHandler::default(),
        RecordingHandler::default(),
        RecordingHandler::default(),
    ];
    let mut servers = start_workers(&handlers).await;
    let provisioner =
        MockProvisioner::with_workers(servers.iter().map(|s| Some(s.addr)).collect());

    let mut relay = RelayServer::start_with_chunks(&relay_config(3), provisioner, &chunks(3))
        .await
        .unwrap();

    // worker-1 goes away after the relay connected to it.
    let lost = servers.remove(1);
    let lost_addr = lost.addr;
    lost.stop().await.unwrap();

    let (failed, total, details) = relay_failure(relay.run_command(&run_command()).await.unwrap_err());
    assert_eq!((failed, total), (1, 3));
    assert!(details.starts_with("worker-1: "));
    assert_eq!(handlers[0].received(), vec![run_command()]);
    assert!(handlers[1].received().is_empty());
    assert_eq!(handlers[2].received(), vec![run_command()]);

    // Still down: the relay tries to reconnect and reports it again.
    let (failed, _, details) = relay_failure(relay.run_command(&Command::Version).await.unwrap_err());
    assert_eq!(failed, 1);
    assert!(details.contains("worker-1"));

    // Back on the same address: the next command reaches it over a new connection.
    let revived = RecordingHandler::default();
    let back = spawn_server_on(lost_addr, revived.clone(), true, CancellationToken::new()).await;
    relay.run_command(&Command::Version).await.unwrap();
    assert_eq!(revived.received(), vec![Command::Version]);
    assert_eq!(handlers[0].received().len(), 3);
    assert_eq!(handlers[2].received().len(), 3);

    relay.shutdown().await.unwrap();
    back.stop().await.unwrap();
    stop_workers(servers).await;
}

#[tokio::test]
async fn test_worker_without_address_is_reported() {
    let handlers = vec![RecordingHandler::default(), RecordingHandler::default()];
    let servers = start_workers(&handlers).await;
    let provisioner =
        MockProvisioner::with_workers(vec![Some(servers[0].addr), None, Some(servers[1].addr)]);

    let mut relay = RelayServer::start_with_chunks(&relay_config(3), provisioner, &chunks(3))
        .await
        .unwrap();
    let pending: Vec<&str> = relay
        .workers()
        .filter(|w| w.state == WorkerState::Pending)
        .map(|w| w.name.as_str())
        .collect();
    assert_eq!(pending, vec!["worker-1"]);

    let err = relay.run_command(&run_command()).await.unwrap_err();
    match err {
        ExecError::Relay {
            failed,
            total,
            details,
        } => {
            assert_eq!((failed, total), (1, 3));
            assert!(details.contains("Address of worker worker-1 is not known yet"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    for handler in &handlers {
        assert_eq!(handler.received(), vec![run_command()]);
    }

    relay.shutdown().await.unwrap();
    stop_workers(servers).await;
}

#[tokio::test]
async fn test_provisioning_failure_aborts_and_cleans_up() {
    let provisioner = MockProvisioner {
        fail: true,
        ..Default::default()
    };
    let teardowns = Arc::clone(&provisioner.teardowns);

    let err = RelayServer::start_with_chunks(&relay_config(2), provisioner, &chunks(2))
        .await
        .unwrap_err();

    assert!(matches!(err, ExecError::Provisioning(ref m) if m == "quota exceeded"));
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unreachable_worker_aborts_startup() {
    let closed = {
        let server = spawn_server(RecordingHandler::default(), true).await;
        let addr = server.addr;
        server.stop().await.unwrap();
        addr
    };
    let provisioner = MockProvisioner::with_workers(vec![Some(closed)]);
    let teardowns = Arc::clone(&provisioner.teardowns);

    let err = RelayServer::start_with_chunks(&relay_config(1), provisioner, &chunks(1))
        .await
        .unwrap_err();

    assert!(matches!(err, ExecError::Provisioning(ref m) if m.contains("unreachable")));
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_read_is_delivered_but_not_aggregated() {
    let handlers = vec![RecordingHandler::default(), RecordingHandler::default()];
    let servers = start_workers(&handlers).await;
    let provisioner = MockProvisioner::with_workers(servers.iter().map(|s| Some(s.addr)).collect());

    let mut relay = RelayServer::start_with_chunks(&relay_config(2), provisioner, &chunks(2))
        .await
        .unwrap();

    let read = Command::Read {
        table: "Report".to_string(),
        columns: vec![],
    };
    let err = relay.run_command(&read).await.unwrap_err();
    assert!(err.to_string().contains("no result aggregator configured"));
    for handler in &handlers {
        assert_eq!(handler.received(), vec![read.clone()]);
    }

    relay.shutdown().await.unwrap();
    stop_workers(servers).await;
}

#[tokio::test]
async fn test_relay_serves_clients_through_execution_server() {
    let handlers = vec![RecordingHandler::default(), RecordingHandler::default()];
    let servers = start_workers(&handlers).await;
    let provisioner = MockProvisioner::with_workers(servers.iter().map(|s| Some(s.addr)).collect());
    let teardowns = Arc::clone(&provisioner.teardowns);

    let relay = RelayServer::start_with_chunks(&relay_config(2), provisioner, &chunks(2))
        .await
        .unwrap();
    let front = spawn_server(relay, false).await;

    let mut client = connect(front.addr).await;
    assert_eq!(
        client.send_command(&run_command()).await.unwrap(),
        CommandReply::Completed
    );
    assert_eq!(
        client.send_command(&Command::Version).await.unwrap(),
        CommandReply::Version { major: 1, minor: 0 }
    );
    client.disconnect().await;

    let relay = front.stop().await.unwrap();
    relay.shutdown().await.unwrap();
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    for handler in &handlers {
        assert_eq!(handler.received(), vec![run_command(), Command::Version]);
    }
    stop_workers(servers).await;
}

#[tokio::test]
async fn test_start_partitions_the_workload() {
    let staging = tempfile::tempdir().unwrap();
    let simulations = (0..5)
        .map(|i| SimulationSpec {
            name: format!("sim-{}", i),
            program: "true".to_string(),
            args: vec![],
            table: "Report".to_string(),
        })
        .collect();
    let workload = ProcessWorkload::new(simulations);
    let provisioner = MockProvisioner::default();
    let chunks_seen = Arc::clone(&provisioner.chunks_seen);

    let config = relay_config(2).with_staging_dir(staging.path().to_path_buf());
    let relay = RelayServer::start(&config, provisioner, &workload)
        .await
        .unwrap();

    let seen = chunks_seen.lock().clone();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|c| c.path.starts_with(staging.path())));
    assert!(seen.iter().all(|c| c.path.exists()));
    assert_eq!(relay.workers().count(), 2);

    relay.shutdown().await.unwrap();
}
