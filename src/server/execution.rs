use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::Result;
use crate::server::CommandHandler;

/// Accepts connections and serves their commands one at a time.
///
/// In single-shot mode the server returns after its first client
/// disconnects. With keep-alive it goes back to accepting until the
/// shutdown token fires.
pub struct ExecutionServer<H> {
    connection: ConnectionManager,
    handler: H,
    keep_alive: bool,
    shutdown: CancellationToken,
}

impl<H> std::fmt::Debug for ExecutionServer<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionServer")
            .field("connection", &self.connection)
            .field("keep_alive", &self.keep_alive)
            .finish()
    }
}

impl<H: CommandHandler> ExecutionServer<H> {
    /// Bind the configured transport. Nothing is accepted until `run`.
    pub async fn bind(config: &ServerConfig, handler: H) -> Result<Self> {
        let connection = ConnectionManager::bind(config.transport.clone()).await?;
        Ok(Self::from_connection(connection, handler, config.keep_alive))
    }

    /// Serve on an already bound listening connection.
    pub fn from_connection(connection: ConnectionManager, handler: H, keep_alive: bool) -> Self {
        Self {
            connection,
            handler,
            keep_alive,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.connection.local_addr()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Serve clients until single-shot mode ends or shutdown is requested.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Shutdown requested, no longer accepting connections");
                    return Ok(());
                }
                accepted = self.connection.wait_for_connection() => accepted?,
            }

            let served = self.serve_connection().await;
            self.connection.disconnect().await;

            if let Err(e) = served {
                if !self.keep_alive {
                    return Err(e);
                }
                tracing::warn!(error = %e, "Connection ended with an error");
            }

            if !self.keep_alive || self.shutdown.is_cancelled() {
                tracing::info!("Server stopping");
                return Ok(());
            }
        }
    }

    async fn serve_connection(&mut self) -> Result<()> {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                next = self.connection.wait_for_command() => next?,
            };
            let Some(command) = next else {
                return Ok(());
            };

            self.connection.mark_executing();
            tracing::info!(command = %command, "Running command");
            let outcome = self.handler.run_command(&command).await;
            match &outcome {
                Ok(_) => tracing::info!(command = command.keyword(), "Command finished"),
                Err(e) => tracing::warn!(command = command.keyword(), error = %e, "Command failed"),
            }
            self.connection.on_command_finished(&command, outcome).await?;
        }
    }
}
