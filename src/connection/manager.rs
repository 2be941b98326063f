use std::net::SocketAddr;

use crate::config::TransportConfig;
use crate::connection::transport::{self, BoxedStream, Listener};
use crate::error::{ExecError, Result};
use crate::protocol::{ClientProtocol, Command, CommandOutput, CommandReply, ServerProtocol};

/// Lifecycle of the current connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No peer; a listening manager may accept one.
    Idle,
    Connected,
    CommandReceived,
    Executing,
    ResultSent,
    /// The peer went away, or the manager was disconnected for good.
    Closed,
}

enum Session {
    Server(ServerProtocol<BoxedStream>),
    Client(ClientProtocol<BoxedStream>),
}

/// Owns one transport and the protocol session running over it.
///
/// A listening manager serves commands from whoever connects and can accept
/// again after [`ConnectionManager::disconnect`]. A connecting manager only
/// sends commands to a remote server.
pub struct ConnectionManager {
    listener: Option<Listener>,
    transport: TransportConfig,
    session: Option<Session>,
    state: ConnectionState,
    peer: Option<String>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("transport", &self.transport)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .finish()
    }
}

impl ConnectionManager {
    /// Bind a listening transport. No peer is connected yet.
    pub async fn bind(transport: TransportConfig) -> Result<Self> {
        let listener = Listener::bind(&transport).await?;
        Ok(Self {
            listener: Some(listener),
            transport,
            session: None,
            state: ConnectionState::Idle,
            peer: None,
        })
    }

    /// Connect to a remote server for sending commands.
    pub async fn connect(transport: TransportConfig) -> Result<Self> {
        let stream = transport::connect(&transport).await?;
        tracing::debug!(transport = ?transport, "Connected to server");
        Ok(Self {
            listener: None,
            transport,
            session: Some(Session::Client(ClientProtocol::new(stream))),
            state: ConnectionState::Connected,
            peer: None,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Address actually bound, useful when listening on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(Listener::local_addr)
    }

    pub fn peer(&self) -> Option<&str> {
        self.peer.as_deref()
    }

    /// Block until a peer connects and bind a server session to it.
    pub async fn wait_for_connection(&mut self) -> Result<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| ExecError::Internal("not a listening connection".to_string()))?;
        let (stream, peer) = listener.accept().await?;
        tracing::info!(peer = %peer, "Client connected");
        self.session = Some(Session::Server(ServerProtocol::new(stream)));
        self.peer = Some(peer);
        self.state = ConnectionState::Connected;
        Ok(())
    }

    /// Wait for the next command on the server session. `None` once the
    /// peer has disconnected.
    pub async fn wait_for_command(&mut self) -> Result<Option<Command>> {
        let next = self.server_session()?.wait_for_command().await?;
        match next {
            Some(command) => {
                self.state = ConnectionState::CommandReceived;
                Ok(Some(command))
            }
            None => {
                self.state = ConnectionState::Closed;
                Ok(None)
            }
        }
    }

    pub fn mark_executing(&mut self) {
        self.state = ConnectionState::Executing;
    }

    pub async fn on_command_finished(
        &mut self,
        command: &Command,
        outcome: Result<CommandOutput>,
    ) -> Result<()> {
        self.server_session()?
            .on_command_finished(command, outcome)
            .await?;
        self.state = ConnectionState::ResultSent;
        Ok(())
    }

    /// Send a command to the remote server and wait for its reply.
    pub async fn send_command(&mut self, command: &Command) -> Result<CommandReply> {
        let protocol = match self.session.as_mut() {
            Some(Session::Client(protocol)) => protocol,
            Some(Session::Server(_)) => {
                return Err(ExecError::Internal(
                    "cannot send commands on a listening connection".to_string(),
                ))
            }
            None => return Err(ExecError::NotConnected),
        };
        let reply = protocol.send(command).await;
        if matches!(&reply, Err(e) if e.is_disconnect()) {
            self.session = None;
            self.state = ConnectionState::Closed;
        }
        reply
    }

    /// Drop the current stream. A listening manager returns to `Idle` and
    /// may accept again; a connecting manager is closed.
    pub async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            let mut stream = match session {
                Session::Server(protocol) => protocol.into_inner(),
                Session::Client(protocol) => protocol.into_inner(),
            };
            if let Err(e) = tokio::io::AsyncWriteExt::shutdown(&mut stream).await {
                tracing::debug!(error = %e, "Error shutting down stream");
            }
        }
        if let Some(peer) = self.peer.take() {
            tracing::info!(peer = %peer, "Client disconnected");
        }
        self.state = if self.listener.is_some() {
            ConnectionState::Idle
        } else {
            ConnectionState::Closed
        };
    }

    fn server_session(&mut self) -> Result<&mut ServerProtocol<BoxedStream>> {
        match self.session.as_mut() {
            Some(Session::Server(protocol)) => Ok(protocol),
            Some(Session::Client(_)) => Err(ExecError::Internal(
                "cannot receive commands on an outbound connection".to_string(),
            )),
            None => Err(ExecError::NotConnected),
        }
    }
}
