use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use tessera_types::Error;

use crate::connection::Connection;
use crate::frame::{Frame, Protocol};

const QUEUE_DEPTH: usize = 128;

#[derive(Debug, Clone)]
pub struct MuxConfig {
    pub max_frame_bytes: usize,
    /// How long a fresh connection may take to send its startup frame.
    pub startup_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        MuxConfig {
            max_frame_bytes: 64 * 1024 * 1024,
            startup_timeout: Duration::from_secs(5),
        }
    }
}

/// A connection routed to a [`MuxListener`], startup frame already consumed.
pub struct Accepted {
    pub conn: Connection,
    pub peer_addr: SocketAddr,
    /// Startup payload following the magic number.
    pub params: Bytes,
}

/// One TCP listener fanned out to a queue per protocol family.
pub struct Mux {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: MuxConfig,
    routes: HashMap<Protocol, mpsc::Sender<Accepted>>,
}

impl Mux {
    pub async fn bind(addr: &str, config: MuxConfig) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Mux { listener, local_addr, config, routes: HashMap::new() })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register the queue for `protocol`. Registering twice replaces the
    /// earlier listener.
    pub fn listener(&mut self, protocol: Protocol) -> MuxListener {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        self.routes.insert(protocol, tx);
        MuxListener {
            protocol,
            local_addr: self.local_addr,
            rx,
            config: self.config.clone(),
        }
    }

    /// Accept loop. Each connection is routed on its own task.
    pub async fn serve(self) -> Result<(), Error> {
        tracing::info!(addr = %self.local_addr, "multiplexed listener starting");
        let routes = Arc::new(self.routes);
        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let routes = routes.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                route(stream, peer_addr, &routes, &config).await;
            });
        }
    }
}

async fn route(
    stream: TcpStream,
    peer_addr: SocketAddr,
    routes: &HashMap<Protocol, mpsc::Sender<Accepted>>,
    config: &MuxConfig,
) {
    let _ = stream.set_nodelay(true);
    let mut conn = Connection::new(stream, config.max_frame_bytes);
    let first = match tokio::time::timeout(config.startup_timeout, conn.read_frame()).await {
        Ok(Ok(Some(frame))) => frame,
        Ok(Ok(None)) => return,
        Ok(Err(e)) => {
            tracing::debug!(%peer_addr, error = %e, "bad startup frame");
            let _ = conn.reject(&e.to_string()).await;
            return;
        }
        Err(_) => {
            tracing::debug!(%peer_addr, "startup frame timed out");
            let _ = conn.reject("startup timed out").await;
            return;
        }
    };

    let (protocol, params) = match first.parse_startup() {
        Ok(parsed) => parsed,
        Err(e) => {
            tracing::warn!(%peer_addr, error = %e, "rejecting connection");
            let _ = conn.reject(&e.to_string()).await;
            return;
        }
    };

    let Some(tx) = routes.get(&protocol) else {
        tracing::warn!(%peer_addr, %protocol, "no handler for protocol");
        let _ = conn.reject(&format!("protocol {protocol} not served")).await;
        return;
    };

    tracing::debug!(%peer_addr, %protocol, "routing connection");
    if let Err(mpsc::error::SendError(accepted)) = tx.send(Accepted { conn, peer_addr, params }).await {
        let _ = accepted.conn.reject("listener closed").await;
    }
}

/// The per-protocol view of the shared listener.
pub struct MuxListener {
    protocol: Protocol,
    local_addr: SocketAddr,
    rx: mpsc::Receiver<Accepted>,
    config: MuxConfig,
}

impl MuxListener {
    pub async fn accept(&mut self) -> Result<Accepted, Error> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| Error::Network(format!("{} listener closed", self.protocol)))
    }

    pub fn addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Stop taking connections. Queued and later arrivals are rejected.
    pub async fn close(&mut self) {
        self.rx.close();
        while let Ok(accepted) = self.rx.try_recv() {
            if let Err(e) = accepted.conn.reject("listener closed").await {
                tracing::debug!(peer_addr = %accepted.peer_addr, error = %e, "rejection failed");
            }
        }
    }

    /// Open an outbound connection of this listener's protocol.
    pub async fn dial(&self, addr: &str) -> Result<Connection, Error> {
        dial(addr, self.protocol, &self.config).await
    }
}

/// Connect to `addr` and announce `protocol` with a startup frame.
pub async fn dial(addr: &str, protocol: Protocol, config: &MuxConfig) -> Result<Connection, Error> {
    let stream = tokio::time::timeout(config.startup_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Network(format!("connect to {addr} timed out")))??;
    stream.set_nodelay(true)?;
    let mut conn = Connection::new(stream, config.max_frame_bytes);
    conn.write_frame(&Frame::startup(protocol, &[])).await?;
    Ok(conn)
}
