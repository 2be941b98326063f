use std::net::SocketAddr;
use std::path::PathBuf;

/// Port used for worker connections and the default listen port.
pub const DEFAULT_PORT: u16 = 27746;

/// Environment variable consulted for the processor count when no explicit
/// worker count is configured.
pub const PROCESSOR_COUNT_ENV: &str = "NUMBER_OF_PROCESSORS";

/// Configuration for the job runner's worker pool.
#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    /// Explicit number of concurrently executing jobs. `None` falls back to
    /// the environment and then to the logical processor count.
    pub max_workers: Option<usize>,
}

impl RunnerConfig {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            max_workers: Some(workers),
        }
    }

    /// Resolve the effective worker count.
    ///
    /// Order: explicit override, then `NUMBER_OF_PROCESSORS`, then
    /// (logical processors - 1). Never less than 1.
    pub fn worker_count(&self) -> usize {
        let env = std::env::var(PROCESSOR_COUNT_ENV).ok();
        Self::resolve_worker_count(self.max_workers, env.as_deref(), num_cpus::get())
    }

    fn resolve_worker_count(explicit: Option<usize>, env: Option<&str>, cpus: usize) -> usize {
        let count = explicit
            .or_else(|| env.and_then(|v| v.trim().parse::<usize>().ok()))
            .unwrap_or_else(|| cpus.saturating_sub(1));
        count.max(1)
    }
}

/// Transport a server listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportConfig {
    /// TCP socket bound to `addr` with the given listen backlog.
    Tcp { addr: SocketAddr, backlog: u32 },
    /// Local named pipe (a Unix domain socket in the temp directory).
    LocalPipe { name: String },
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Tcp {
            addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            backlog: 10,
        }
    }
}

impl TransportConfig {
    pub fn tcp(addr: SocketAddr) -> Self {
        Self::Tcp { addr, backlog: 10 }
    }

    pub fn pipe(name: impl Into<String>) -> Self {
        Self::LocalPipe { name: name.into() }
    }

    /// Filesystem path of the socket backing a local pipe.
    pub fn pipe_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("sim-exec-{}.sock", name))
    }
}

/// Configuration for an execution (or relay) server.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub transport: TransportConfig,
    /// Keep accepting connections after a client disconnects.
    pub keep_alive: bool,
    /// Log at debug level.
    pub verbose: bool,
    pub runner: RunnerConfig,
    /// Address of the optional HTTP status endpoint.
    pub status_addr: Option<SocketAddr>,
}

impl ServerConfig {
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            ..Default::default()
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_runner(mut self, runner: RunnerConfig) -> Self {
        self.runner = runner;
        self
    }

    /// Log filter used when `RUST_LOG` is not set.
    pub fn log_level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else {
            "info"
        }
    }
}

/// Settings for the docker-backed cluster provisioner.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Image that runs `sim-exec listen` inside each worker container.
    pub image: String,
    /// Prefix of the per-relay docker network (the isolation namespace).
    pub network_prefix: String,
    /// How long to wait for every worker to report running.
    pub ready_timeout_ms: u64,
    /// Interval between readiness polls.
    pub poll_interval_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            image: "sim-exec:latest".to_string(),
            network_prefix: "sim-exec-cluster".to_string(),
            ready_timeout_ms: 120_000,
            poll_interval_ms: 500,
        }
    }
}

/// Configuration for a relay server.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Number of workers (and chunks) to split the workload into.
    pub worker_count: usize,
    /// Port every worker listens on, on all interfaces.
    pub worker_port: u16,
    /// How long to keep retrying the initial connection to a worker.
    pub connect_timeout_ms: u64,
    /// Directory that receives the partitioned workload chunks.
    pub staging_dir: PathBuf,
    pub cluster: ClusterConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            worker_count: 1,
            worker_port: DEFAULT_PORT,
            connect_timeout_ms: 30_000,
            staging_dir: std::env::temp_dir().join("sim-exec-chunks"),
            cluster: ClusterConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Default::default()
        }
    }

    pub fn with_staging_dir(mut self, dir: PathBuf) -> Self {
        self.staging_dir = dir;
        self
    }

    pub fn with_connect_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = timeout_ms;
        self
    }
}
