use std::net::SocketAddr;
#[cfg(unix)]
use std::path::PathBuf;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::config::TransportConfig;
use crate::error::Result;

/// Any bidirectional byte stream the protocol can run over.
pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Duplex for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// Transport-erased stream handed to the protocol layer.
pub type BoxedStream = Box<dyn Duplex>;

/// A bound, listening transport.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Pipe {
        listener: tokio::net::UnixListener,
        path: PathBuf,
    },
}

impl Listener {
    pub async fn bind(transport: &TransportConfig) -> Result<Self> {
        match transport {
            TransportConfig::Tcp { addr, backlog } => {
                let socket = if addr.is_ipv4() {
                    TcpSocket::new_v4()?
                } else {
                    TcpSocket::new_v6()?
                };
                socket.set_reuseaddr(true)?;
                socket.bind(*addr)?;
                let listener = socket.listen(*backlog)?;
                tracing::info!(addr = %listener.local_addr()?, backlog, "Listening on TCP");
                Ok(Listener::Tcp(listener))
            }
            #[cfg(unix)]
            TransportConfig::LocalPipe { name } => {
                let path = TransportConfig::pipe_path(name);
                if path.exists() {
                    std::fs::remove_file(&path)?;
                }
                let listener = tokio::net::UnixListener::bind(&path)?;
                tracing::info!(path = %path.display(), "Listening on local pipe");
                Ok(Listener::Pipe { listener, path })
            }
            #[cfg(not(unix))]
            TransportConfig::LocalPipe { .. } => Err(crate::error::ExecError::Internal(
                "local pipes are only supported on unix platforms".to_string(),
            )),
        }
    }

    /// Wait for a peer. Returns the stream and a printable peer description.
    pub async fn accept(&self) -> Result<(BoxedStream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Listener::Pipe { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok((Box::new(stream), path.display().to_string()))
            }
        }
    }

    /// Bound TCP address; `None` for local pipes.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Listener::Tcp(listener) => listener.local_addr().ok(),
            #[cfg(unix)]
            Listener::Pipe { .. } => None,
        }
    }
}

impl Drop for Listener {
    #[cfg(unix)]
    fn drop(&mut self) {
        if let Listener::Pipe { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }

    #[cfg(not(unix))]
    fn drop(&mut self) {}
}

/// Open an outbound stream to a server listening on `transport`.
pub async fn connect(transport: &TransportConfig) -> Result<BoxedStream> {
    match transport {
        TransportConfig::Tcp { addr, .. } => {
            let stream = TcpStream::connect(addr).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        TransportConfig::LocalPipe { name } => {
            let stream = tokio::net::UnixStream::connect(TransportConfig::pipe_path(name)).await?;
            Ok(Box::new(stream))
        }
        #[cfg(not(unix))]
        TransportConfig::LocalPipe { .. } => Err(crate::error::ExecError::Internal(
            "local pipes are only supported on unix platforms".to_string(),
        )),
    }
}
