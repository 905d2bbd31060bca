//! WebSocket accept loop

use crate::config::ServerConfig;
use crate::handler::handle_connection;
use crate::rooms::RoomRegistry;
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Relay server for room membership and signaling
pub struct SignalingServer {
    config: ServerConfig,
    rooms: Arc<RoomRegistry>,
}

impl SignalingServer {
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let rooms = Arc::new(RoomRegistry::new(config.max_room_size));
        Ok(Self { config, rooms })
    }

    /// Room state shared by every connection
    pub fn rooms(&self) -> Arc<RoomRegistry> {
        Arc::clone(&self.rooms)
    }

    /// Bind the listener and start accepting connections
    ///
    /// Returns once the socket is bound. The accept loop runs until the
    /// returned handle is shut down.
    pub async fn start(self) -> Result<ServerHandle> {
        let listener = TcpListener::bind(self.config.bind).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "WebSocket signaling server bound and listening on ws://{}/ws",
            local_addr
        );

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
        let rooms = Arc::clone(&self.rooms);
        let outbound_capacity = self.config.outbound_capacity;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, peer_addr)) => {
                                let rooms = Arc::clone(&rooms);
                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, rooms, outbound_capacity).await {
                                        error!("WebSocket connection error from {}: {}", peer_addr, e);
                                    }
                                });
                            }
                            Err(e) => error!("Failed to accept connection: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Shutdown signal received, stopping signaling server");
                        break;
                    }
                }
            }
        });

        Ok(ServerHandle {
            local_addr,
            rooms: self.rooms,
            shutdown_tx,
            task,
        })
    }
}

/// Handle to a running [`SignalingServer`]
pub struct ServerHandle {
    local_addr: SocketAddr,
    rooms: Arc<RoomRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL clients connect to
    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    pub fn rooms(&self) -> &Arc<RoomRegistry> {
        &self.rooms
    }

    /// Stop accepting connections and wait for the accept loop to exit
    ///
    /// Connections already open keep running until their client disconnects.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            error!("Signaling server task failed: {}", e);
        }
    }
}
