//! Mesh session
//!
//! Wires the registry, track synchronizer and negotiator together and runs
//! the three event loops that drive them.

use crate::config::MeshConfig;
use crate::events::MeshEvent;
use crate::media::{TrackSource, TrackSynchronizer};
use crate::negotiation::Negotiator;
use crate::peer::{ConnectionFactory, PeerInfo, PeerRegistry, WebRtcConnectionFactory};
use crate::signaling::{SignalingChannel, SignalingEvent, WebSocketSignalingChannel};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// A running mesh: one negotiator and one connection per remote peer
pub struct MeshSession {
    negotiator: Arc<Negotiator>,
    registry: Arc<PeerRegistry>,
    source: Arc<TrackSource>,
    websocket: Option<Arc<WebSocketSignalingChannel>>,
    tasks: Vec<JoinHandle<()>>,
}

impl MeshSession {
    /// Start a session on an already opened signaling channel
    ///
    /// Spawns the signaling, connection-event and track-event loops. Must be
    /// called from within a Tokio runtime.
    pub fn start(
        config: &MeshConfig,
        factory: Arc<dyn ConnectionFactory>,
        channel: Arc<dyn SignalingChannel>,
        signaling_events: mpsc::Receiver<SignalingEvent>,
        source: Arc<TrackSource>,
    ) -> Result<Self> {
        config.validate()?;

        let track_events = source.subscribe();
        let synchronizer = Arc::new(TrackSynchronizer::new(Arc::clone(&source)));
        let (registry, connection_events) = PeerRegistry::new(
            factory,
            Arc::clone(&synchronizer),
            config.event_channel_capacity,
        );
        let registry = Arc::new(registry);
        let negotiator = Arc::new(Negotiator::new(
            Arc::clone(&registry),
            channel,
            config.glare_policy,
        ));

        let tasks = vec![
            tokio::spawn(Arc::clone(&negotiator).run_signaling(signaling_events)),
            tokio::spawn(Arc::clone(&negotiator).run_connection_events(connection_events)),
            tokio::spawn(synchronizer.run(Arc::clone(&registry), track_events)),
        ];

        info!(
            room_id = %config.room_id,
            glare_policy = ?config.glare_policy,
            "Mesh session started"
        );

        Ok(Self {
            negotiator,
            registry,
            source,
            websocket: None,
            tasks,
        })
    }

    /// Connect to the relay server in `config` and start a session backed by
    /// real WebRTC connections
    pub async fn connect(config: MeshConfig, source: Arc<TrackSource>) -> Result<Self> {
        config.validate()?;

        let factory = Arc::new(WebRtcConnectionFactory::new(config.clone()));
        let (channel, events) = WebSocketSignalingChannel::connect(
            &config.signaling_url,
            &config.room_id,
            config.event_channel_capacity,
        )
        .await?;
        let channel = Arc::new(channel);

        let mut session = Self::start(&config, factory, channel.clone(), events, source)?;
        session.websocket = Some(channel);
        Ok(session)
    }

    /// Subscribe to peer lifecycle and remote track events
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.registry.subscribe()
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn negotiator(&self) -> &Arc<Negotiator> {
        &self.negotiator
    }

    /// Local tracks shared with every peer
    pub fn track_source(&self) -> &Arc<TrackSource> {
        &self.source
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.registry.list_peers().await
    }

    /// Drop a peer locally, e.g. after it failed ICE for good
    ///
    /// Its signals are ignored until it joins again, which creates a fresh
    /// connection.
    pub async fn remove_peer(&self, peer_id: &str) -> Result<()> {
        if self.registry.remove(peer_id).await {
            Ok(())
        } else {
            Err(Error::PeerNotFound(peer_id.to_string()))
        }
    }

    /// Leave the room and close every peer connection
    pub async fn shutdown(mut self) {
        if let Some(websocket) = self.websocket.take() {
            if let Err(e) = websocket.close().await {
                warn!("Failed to leave signaling room: {}", e);
            }
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.registry.clear().await;
        info!("Mesh session shut down");
    }
}

impl Drop for MeshSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
