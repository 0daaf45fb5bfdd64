//! TCP acceptor that runs one session per client.

use crate::config::ServerConfig;
use crate::session::Session;
use crate::simulation::Simulation;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket};
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to set up listener: {0}")]
    Listen(#[source] io::Error),
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
}

/// Accepts TCP clients and runs one [`Session`] per connection against the
/// shared simulation.
pub struct Server {
    listener: TcpListener,
    sim: Arc<Simulation>,
    config: ServerConfig,
}

impl Server {
    /// Binds `0.0.0.0:<port>` with the configured backlog.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(config: ServerConfig, sim: Arc<Simulation>) -> Result<Self, ServerError> {
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);
        let socket = TcpSocket::new_v4().map_err(ServerError::Listen)?;
        socket.set_reuseaddr(true).map_err(ServerError::Listen)?;
        socket.bind(addr.into()).map_err(ServerError::Listen)?;
        let listener = socket.listen(config.backlog).map_err(ServerError::Listen)?;
        Ok(Self::from_listener(listener, sim, config))
    }

    pub fn from_listener(listener: TcpListener, sim: Arc<Simulation>, config: ServerConfig) -> Self {
        Self {
            listener,
            sim,
            config,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until accepting fails.
    pub async fn run(self) -> Result<(), ServerError> {
        let local = self.local_addr().map_err(ServerError::Listen)?;
        info!("waiting for incoming connections on {}", local);

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("error accepting client: {}", e);
                    return Err(ServerError::Accept(e));
                }
            };
            info!(%peer, "has connected");

            let session = Session::new(Arc::clone(&self.sim), peer, self.config.status_interval);
            tokio::spawn(async move {
                if let Err(e) = session.serve(stream).await {
                    debug!(%peer, "session ended with error: {}", e);
                }
            });
        }
    }
}
