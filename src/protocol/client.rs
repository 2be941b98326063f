use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{ExecError, Result};
use crate::protocol::codec::MessageStream;
use crate::protocol::command::{Command, Override};
use crate::protocol::table::{ColumnValues, DataTable};
use crate::protocol::{ACK, FIN, READ, RUN, VERSION};

/// What the server sent back for a successfully completed command.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    Completed,
    Version { major: i32, minor: i32 },
    Table(DataTable),
}

/// Client side of the command protocol. Used by the CLI and by relays to
/// talk to their workers.
#[derive(Debug)]
pub struct ClientProtocol<S> {
    stream: MessageStream<S>,
}

impl<S> ClientProtocol<S>
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

    /// Send any command and collect its reply.
    pub async fn send(&mut self, command: &Command) -> Result<CommandReply> {
        match command {
            Command::Version => {
                let (major, minor) = self.version().await?;
                Ok(CommandReply::Version { major, minor })
            }
            Command::Run { overrides } => {
                self.run(overrides).await?;
                Ok(CommandReply::Completed)
            }
            Command::Read { table, columns } => {
                let table = self.read(table, columns).await?;
                Ok(CommandReply::Table(table))
            }
        }
    }

    pub async fn version(&mut self) -> Result<(i32, i32)> {
        self.stream.send_str(VERSION).await?;
        self.ack().await?;
        let major = self.stream.recv_i32().await?;
        let minor = self.stream.recv_i32().await?;
        self.finish().await?;
        Ok((major, minor))
    }

    /// Send a RUN with the given overrides and wait for the run to finish.
    pub async fn run(&mut self, overrides: &[Override]) -> Result<()> {
        self.stream.send_str(RUN).await?;
        self.ack().await?;
        for o in overrides {
            self.stream.send_str(&o.path).await?;
            self.ack().await?;
            self.stream.send_i32(o.value.param_type() as i32).await?;
            self.ack().await?;
            self.stream.send_value(&o.value).await?;
            self.ack().await?;
        }
        self.stream.send_str(FIN).await?;
        self.ack().await?;
        self.finish().await
    }

    /// Send a READ and receive the requested columns.
    pub async fn read(&mut self, table: &str, columns: &[String]) -> Result<DataTable> {
        self.stream.send_str(READ).await?;
        self.ack().await?;
        self.stream.send_str(table).await?;
        self.ack().await?;
        for column in columns {
            self.stream.send_str(column).await?;
            self.ack().await?;
        }
        self.stream.send_str(FIN).await?;
        self.ack().await?;
        self.finish().await?;
        self.stream.send_str(ACK).await?;

        let mut result = DataTable::new(table);
        for column in columns {
            let type_name = self.stream.recv_str().await?;
            self.stream.send_str(ACK).await?;
            let payload = self.stream.recv_frame().await?;
            self.stream.send_str(ACK).await?;
            result.push_column(column.as_str(), ColumnValues::decode(&type_name, &payload)?);
        }
        Ok(result)
    }

    /// Wait for the end of a command: `FIN`, or the server's error text.
    async fn finish(&mut self) -> Result<()> {
        let message = self.stream.recv_str().await?;
        if message == FIN {
            Ok(())
        } else {
            Err(ExecError::CommandFailed(message))
        }
    }

    /// Anything other than `ACK` at this point is an error report.
    async fn ack(&mut self) -> Result<()> {
        let message = self.stream.recv_str().await?;
        if message == ACK {
            Ok(())
        } else {
            Err(ExecError::CommandFailed(message))
        }
    }
}
