//! Command servers.
//!
//! [`ExecutionServer`] owns the accept/serve loop and delegates each command
//! to a [`CommandHandler`]. [`LocalExecutor`] runs commands on a local
//! [`JobRunner`](crate::jobs::JobRunner); the relay in
//! [`crate::cluster`] forwards them to remote workers instead.

pub mod execution;
pub mod local;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::{Command, CommandOutput};

pub use execution::ExecutionServer;
pub use local::LocalExecutor;

/// Executes one received command.
///
/// An `Err` is reported to the peer as the command's error text; it does not
/// end the connection.
#[async_trait]
pub trait CommandHandler: Send {
    async fn run_command(&mut self, command: &Command) -> Result<CommandOutput>;
}
