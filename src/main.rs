use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use sim_exec::cluster::{DockerProvisioner, RelayServer};
use sim_exec::config::{
    ClusterConfig, RelayConfig, RunnerConfig, ServerConfig, TransportConfig, DEFAULT_PORT,
};
use sim_exec::connection::ConnectionManager;
use sim_exec::protocol::{Command, CommandReply, ColumnValues, DataTable, Override};
use sim_exec::server::{ExecutionServer, LocalExecutor};
use sim_exec::shutdown::install_shutdown_handler;
use sim_exec::status::{run_status_server, StatusState};
use sim_exec::workload::ProcessWorkload;

#[derive(Parser, Debug)]
#[command(name = "sim-exec")]
#[command(version)]
#[command(about = "Runs simulation workloads behind a command protocol, locally or across a cluster")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Serve commands and execute them on this machine
    Listen(ListenArgs),

    /// Provision workers and relay commands to all of them
    Relay(RelayArgs),

    /// Send a command to a running server
    Client {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: ClientCommands,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct TransportArgs {
    /// Address to bind (or connect to)
    #[arg(long, short = 'a', default_value = "127.0.0.1")]
    address: IpAddr,

    /// TCP port
    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Use the named local pipe instead of TCP
    #[arg(long)]
    pipe: Option<String>,
}

impl TransportArgs {
    fn transport(&self, backlog: u32) -> TransportConfig {
        match &self.pipe {
            Some(name) => TransportConfig::pipe(name.clone()),
            None => TransportConfig::Tcp {
                addr: SocketAddr::new(self.address, self.port),
                backlog,
            },
        }
    }
}

#[derive(Parser, Debug)]
struct ListenArgs {
    #[command(flatten)]
    transport: TransportArgs,

    /// Log at debug level
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Keep serving new connections after a client disconnects
    #[arg(long, short = 'k')]
    keep_alive: bool,

    /// Workload file (JSON list of simulations)
    #[arg(long, short = 'f')]
    file: Option<PathBuf>,

    /// Listen backlog for the TCP transport
    #[arg(long, default_value = "10")]
    backlog: u32,

    /// Maximum number of concurrently running jobs
    #[arg(long)]
    workers: Option<usize>,

    /// Port for the HTTP status endpoint (optional)
    #[arg(long)]
    status_port: Option<u16>,
}

#[derive(Parser, Debug)]
struct RelayArgs {
    #[command(flatten)]
    transport: TransportArgs,

    /// Log at debug level
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Keep serving new connections after a client disconnects
    #[arg(long, short = 'k')]
    keep_alive: bool,

    /// Workload file to split across workers
    #[arg(long, short = 'f')]
    file: PathBuf,

    /// Number of workers to provision
    #[arg(long, short = 'n', default_value = "1")]
    workers: usize,

    /// Container image that runs `sim-exec listen`
    #[arg(long, default_value = "sim-exec:latest")]
    image: String,

    /// Port every worker listens on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    worker_port: u16,

    /// Directory receiving the workload chunks
    #[arg(long)]
    staging_dir: Option<PathBuf>,

    /// Seconds to wait for workers to become ready
    #[arg(long, default_value = "120")]
    ready_timeout_secs: u64,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    #[command(flatten)]
    transport: TransportArgs,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum ClientCommands {
    /// Query the server's protocol version
    Version,
    /// Run the workload with optional parameter overrides
    Run {
        /// Override as path=kind:value, e.g. "[Clock].Start=date:2020-01-01"
        #[arg(long = "set", short = 's')]
        overrides: Vec<Override>,
    },
    /// Read columns of a result table
    Read {
        #[arg(long, short = 't', default_value = "Report")]
        table: String,

        /// Comma-separated column names
        #[arg(long, short = 'c', value_delimiter = ',', required = true)]
        columns: Vec<String>,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct VersionOutput {
    major: i32,
    minor: i32,
}

#[derive(Serialize)]
struct RunOutput {
    status: &'static str,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn init_logging(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();
}

fn format_values(values: &ColumnValues) -> Vec<String> {
    fn text<T: ToString>(values: &[T]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }
    match values {
        ColumnValues::Int32(v) => text(v),
        ColumnValues::Double(v) => text(v),
        ColumnValues::Boolean(v) => text(v),
        ColumnValues::DateTime(v) => v
            .iter()
            .map(|d| d.format("%Y-%m-%dT%H:%M:%S").to_string())
            .collect(),
        ColumnValues::String(v) => v.clone(),
    }
}

fn print_table(table: &DataTable) {
    let columns: Vec<Vec<String>> = table
        .columns()
        .iter()
        .map(|c| format_values(&c.values))
        .collect();
    let widths: Vec<usize> = table
        .columns()
        .iter()
        .zip(&columns)
        .map(|(c, values)| {
            values
                .iter()
                .map(String::len)
                .chain(std::iter::once(c.name.len()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let header: Vec<String> = table
        .columns()
        .iter()
        .zip(&widths)
        .map(|(c, w)| format!("{:<w$}", c.name, w = *w))
        .collect();
    println!("{}", header.join("  "));
    println!("{}", "-".repeat(header.join("  ").len()));

    for row in 0..table.num_rows() {
        let cells: Vec<String> = columns
            .iter()
            .zip(&widths)
            .map(|(values, w)| {
                format!("{:<w$}", values.get(row).map(String::as_str).unwrap_or(""), w = *w)
            })
            .collect();
        println!("{}", cells.join("  "));
    }
    println!();
    println!("{} row(s) from {}", table.num_rows(), table.name);
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_listen(args: ListenArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig {
        transport: args.transport.transport(args.backlog),
        keep_alive: args.keep_alive,
        verbose: args.verbose,
        runner: RunnerConfig {
            max_workers: args.workers,
        },
        status_addr: match args.status_port {
            Some(p) => Some(format!("0.0.0.0:{}", p).parse()?),
            None => None,
        },
    };
    init_logging(config.log_level());

    let workload = match &args.file {
        Some(path) => ProcessWorkload::load(path)?,
        None => {
            tracing::warn!("No workload file given, RUN commands will complete immediately");
            ProcessWorkload::new(Vec::new())
        }
    };

    let shutdown = install_shutdown_handler();
    let executor = LocalExecutor::new(Arc::new(workload), config.runner.clone())
        .with_shutdown(shutdown.clone());

    if let Some(addr) = config.status_addr {
        let state = StatusState {
            monitor: executor.monitor(),
        };
        tokio::spawn(async move {
            run_status_server(addr, state).await;
        });
    }

    tracing::info!(
        transport = ?config.transport,
        keep_alive = config.keep_alive,
        workers = config.runner.worker_count(),
        "Starting execution server"
    );

    let mut server = ExecutionServer::bind(&config, executor)
        .await?
        .with_shutdown(shutdown);
    server.run().await?;
    Ok(())
}

async fn run_relay(args: RelayArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(if args.verbose { "debug" } else { "info" });

    let workload = ProcessWorkload::load(&args.file)?;

    let mut relay_config = RelayConfig::new(args.workers);
    relay_config.worker_port = args.worker_port;
    if let Some(dir) = args.staging_dir {
        relay_config = relay_config.with_staging_dir(dir);
    }
    relay_config.cluster = ClusterConfig {
        image: args.image,
        ready_timeout_ms: args.ready_timeout_secs * 1000,
        ..ClusterConfig::default()
    };

    let server_config =
        ServerConfig::new(args.transport.transport(10)).with_keep_alive(args.keep_alive);

    // Bind first so a busy port fails before any worker exists.
    let connection = ConnectionManager::bind(server_config.transport.clone()).await?;

    let shutdown = install_shutdown_handler();
    let provisioner =
        DockerProvisioner::new(relay_config.cluster.clone(), relay_config.worker_port);
    let relay = RelayServer::start(&relay_config, provisioner, &workload).await?;

    let mut server = ExecutionServer::from_connection(connection, relay, server_config.keep_alive)
        .with_shutdown(shutdown);

    tracing::info!(transport = ?server_config.transport, "Starting relay server");
    let served = server.run().await;

    if let Err(e) = server.into_handler().shutdown().await {
        tracing::error!(error = %e, "Failed to tear down workers");
    }
    served?;
    Ok(())
}

// =============================================================================
// Client Implementation
// =============================================================================

async fn run_client(
    client: ClientArgs,
    command: ClientCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    init_logging("warn");

    let command = match command {
        ClientCommands::Version => Command::Version,
        ClientCommands::Run { overrides } => Command::Run { overrides },
        ClientCommands::Read { table, columns } => Command::Read { table, columns },
    };

    let mut connection = ConnectionManager::connect(client.transport.transport(10)).await?;
    let reply = connection.send_command(&command).await;
    connection.disconnect().await;

    match (reply?, &client.output) {
        (CommandReply::Version { major, minor }, OutputFormat::Json) => {
            println!("{}", serde_json::to_string_pretty(&VersionOutput { major, minor })?);
        }
        (CommandReply::Version { major, minor }, OutputFormat::Table) => {
            println!("Protocol version {}.{}", major, minor);
        }
        (CommandReply::Completed, OutputFormat::Json) => {
            println!("{}", serde_json::to_string_pretty(&RunOutput { status: "completed" })?);
        }
        (CommandReply::Completed, OutputFormat::Table) => {
            println!("Command completed successfully.");
        }
        (CommandReply::Table(table), OutputFormat::Json) => {
            println!("{}", serde_json::to_string_pretty(&table)?);
        }
        (CommandReply::Table(table), OutputFormat::Table) => {
            print_table(&table);
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Listen(listen_args) => run_listen(listen_args).await?,
        Commands::Relay(relay_args) => run_relay(relay_args).await?,
        Commands::Client { client, command } => run_client(client, command).await?,
    }

    Ok(())
}
