use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Column {column} does not exist in table {table}")]
    ColumnNotFound { table: String, column: String },

    #[error("Address of worker {0} is not known yet")]
    WorkerAddressUnknown(String),

    #[error("Failed to relay command to {failed} of {total} workers: {details}")]
    Relay {
        failed: usize,
        total: usize,
        details: String,
    },

    #[error("Cluster provisioning failed: {0}")]
    Provisioning(String),

    #[error("Failed to enumerate jobs: {0}")]
    JobSource(String),

    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Workload error: {0}")]
    Workload(String),

    #[error("{0}")]
    CommandFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExecError {
    /// True when the underlying stream can no longer carry messages.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ExecError::ConnectionClosed | ExecError::NotConnected => true,
            ExecError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;
