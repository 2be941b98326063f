pub mod cluster;
pub mod config;
pub mod connection;
pub mod error;
pub mod jobs;
pub mod protocol;
pub mod server;
pub mod shutdown;
pub mod status;
pub mod workload;
