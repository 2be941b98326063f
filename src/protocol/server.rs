use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{ExecError, Result};
use crate::protocol::codec::MessageStream;
use crate::protocol::command::{Command, CommandOutput, Override, ParamType};
use crate::protocol::table::DataTable;
use crate::protocol::{
    ACK, FIN, PROTOCOL_VERSION_MAJOR, PROTOCOL_VERSION_MINOR, READ, RUN, VERSION,
};

/// Server side of the command protocol on one connection.
#[derive(Debug)]
pub struct ServerProtocol<S> {
    stream: MessageStream<S>,
}

impl<S> ServerProtocol<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream: MessageStream::new(stream),
        }
    }

    pub fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    /// Block until the peer has sent a complete command.
    ///
    /// Returns `Ok(None)` when the peer disconnects. Malformed input is
    /// reported to the peer as an error message and the wait continues.
    pub async fn wait_for_command(&mut self) -> Result<Option<Command>> {
        loop {
            match self.next_command().await {
                Ok(Some(command)) => {
                    tracing::debug!(command = %command, "Command received");
                    return Ok(Some(command));
                }
                Ok(None) => continue,
                Err(e) if e.is_disconnect() => {
                    tracing::debug!("Peer disconnected");
                    return Ok(None);
                }
                Err(ExecError::Protocol(message)) => {
                    tracing::warn!(error = %message, "Protocol error");
                    let error = ExecError::Protocol(message);
                    self.stream.send_str(&error.to_string()).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read one keyword and, for a known command, its payload. `None` means
    /// the token was acknowledged and ignored.
    async fn next_command(&mut self) -> Result<Option<Command>> {
        let token = self.stream.recv_str().await?;
        match token.as_str() {
            RUN => self.read_run().await.map(Some),
            READ => self.read_read().await.map(Some),
            VERSION => {
                self.stream.send_str(ACK).await?;
                Ok(Some(Command::Version))
            }
            other => {
                tracing::debug!(token = other, "Ignoring unrecognised token");
                self.stream.send_str(ACK).await?;
                Ok(None)
            }
        }
    }

    async fn read_run(&mut self) -> Result<Command> {
        self.stream.send_str(ACK).await?;
        let mut overrides = Vec::new();
        loop {
            let path = self.stream.recv_str().await?;
            self.stream.send_str(ACK).await?;
            if path == FIN {
                break;
            }

            let param_type = ParamType::try_from(self.stream.recv_i32().await?)?;
            self.stream.send_str(ACK).await?;

            let value = self.stream.recv_value(param_type).await?;
            self.stream.send_str(ACK).await?;

            overrides.push(Override::new(path, value));
        }
        Ok(Command::Run { overrides })
    }

    async fn read_read(&mut self) -> Result<Command> {
        self.stream.send_str(ACK).await?;
        let table = self.stream.recv_str().await?;
        self.stream.send_str(ACK).await?;

        let mut columns = Vec::new();
        loop {
            let column = self.stream.recv_str().await?;
            self.stream.send_str(ACK).await?;
            if column == FIN {
                break;
            }
            columns.push(column);
        }
        Ok(Command::Read { table, columns })
    }

    /// Report the outcome of `command` to the peer: `FIN` on success, the
    /// error text otherwise. A successful `READ` is followed by the
    /// requested columns.
    pub async fn on_command_finished(
        &mut self,
        command: &Command,
        outcome: Result<CommandOutput>,
    ) -> Result<()> {
        if let Command::Version = command {
            self.stream.send_i32(PROTOCOL_VERSION_MAJOR).await?;
            self.stream.send_i32(PROTOCOL_VERSION_MINOR).await?;
        }

        let output = match outcome {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!(command = command.keyword(), error = %e, "Command failed");
                return self.stream.send_str(&e.to_string()).await;
            }
        };

        match (command, output) {
            (Command::Read { columns, .. }, CommandOutput::Table(table)) => {
                self.send_table(&table, columns).await
            }
            (Command::Read { table, .. }, CommandOutput::Completed) => {
                let error = ExecError::TableNotFound(table.clone());
                self.stream.send_str(&error.to_string()).await
            }
            _ => self.stream.send_str(FIN).await,
        }
    }

    async fn send_table(&mut self, table: &DataTable, columns: &[String]) -> Result<()> {
        // Every requested column must exist before success is declared.
        let selected = match table.select(columns) {
            Ok(selected) => selected,
            Err(e) => return self.stream.send_str(&e.to_string()).await,
        };

        self.stream.send_str(FIN).await?;
        self.stream.expect_ack().await?;

        for column in selected {
            self.stream.send_str(column.values.type_name()).await?;
            self.stream.expect_ack().await?;
            self.stream.send_frame(&column.values.encode()).await?;
            self.stream.expect_ack().await?;
        }
        tracing::debug!(
            table = %table.name,
            columns = columns.len(),
            rows = table.num_rows(),
            "Table sent"
        );
        Ok(())
    }
}
