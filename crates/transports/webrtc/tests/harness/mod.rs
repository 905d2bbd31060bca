//! Mesh test harness
//!
//! Two kinds of node:
//!
//! - [`ManualNode`]: a negotiator driven step by step. Signals are recorded,
//!   not delivered, so a test decides exactly when each description or
//!   candidate reaches the other side.
//! - [`LiveNode`]: a full [`MeshSession`] joined to a [`LoopbackSignaling`]
//!   room, with every loop running.

#![allow(dead_code)]

use meshcall_webrtc::config::{GlarePolicy, MeshConfig};
use meshcall_webrtc::peer::{ConnectionEvent, PeerRegistry};
use meshcall_webrtc::testing::{
    FakeConnection, FakeConnectionFactory, LoopbackChannel, LoopbackSignaling, RecordingSignaling,
};
use meshcall_webrtc::{
    Error, MediaKind, MeshEvent, MeshSession, Negotiator, SessionDescription, TrackSource,
    TrackSynchronizer,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Initialize tracing for tests (safe to call from every test)
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info,meshcall_webrtc=debug,webrtc=warn")
        .with_test_writer()
        .try_init();
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll an async condition until it holds or `timeout` passes
pub async fn wait_until_async<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn ufrag_of(description: &SessionDescription) -> String {
    description
        .sdp
        .lines()
        .find_map(|line| line.strip_prefix("a=ice-ufrag:"))
        .map(|ufrag| ufrag.trim().to_string())
        .unwrap_or_default()
}

// =============================================================================
// Manual nodes
// =============================================================================

pub struct ManualNode {
    pub id: String,
    pub source: Arc<TrackSource>,
    pub factory: Arc<FakeConnectionFactory>,
    pub registry: Arc<PeerRegistry>,
    pub signaling: Arc<RecordingSignaling>,
    pub negotiator: Arc<Negotiator>,
    connection_events: Mutex<mpsc::UnboundedReceiver<ConnectionEvent>>,
}

impl ManualNode {
    pub fn new(id: &str, policy: GlarePolicy, kinds: &[MediaKind]) -> Self {
        let source = Arc::new(TrackSource::new(64));
        for kind in kinds {
            source.add_track(source.create_track(*kind));
        }

        let factory = Arc::new(FakeConnectionFactory::new());
        let synchronizer = Arc::new(TrackSynchronizer::new(Arc::clone(&source)));
        let (registry, connection_events) = PeerRegistry::new(factory.clone(), synchronizer, 64);
        let registry = Arc::new(registry);
        let signaling = Arc::new(RecordingSignaling::new(id));
        let negotiator = Arc::new(Negotiator::new(
            Arc::clone(&registry),
            signaling.clone(),
            policy,
        ));

        Self {
            id: id.to_string(),
            source,
            factory,
            registry,
            signaling,
            negotiator,
            connection_events: Mutex::new(connection_events),
        }
    }

    /// Connection this node holds towards `peer_id`
    pub fn connection(&self, peer_id: &str) -> Arc<FakeConnection> {
        self.factory
            .connection(peer_id)
            .unwrap_or_else(|| panic!("{} has no connection to {}", self.id, peer_id))
    }

    /// Latest description this node sent to `peer_id`
    pub fn last_description_to(&self, peer_id: &str) -> SessionDescription {
        self.signaling
            .descriptions_to(peer_id)
            .pop()
            .unwrap_or_else(|| panic!("{} sent no description to {}", self.id, peer_id))
    }

    /// Apply a description from `from`
    pub async fn receive(&self, from: &ManualNode, description: SessionDescription) {
        self.negotiator
            .handle_description(&from.id, description)
            .await
            .unwrap();
    }

    /// Handle every queued connection event, including ones raised while
    /// handling. Returns the errors the negotiator reported.
    pub async fn pump(&self) -> Vec<Error> {
        let mut errors = Vec::new();
        loop {
            let batch: Vec<ConnectionEvent> = {
                let mut rx = self.connection_events.lock();
                std::iter::from_fn(|| rx.try_recv().ok()).collect()
            };
            if batch.is_empty() {
                break;
            }
            for event in batch {
                if let Err(e) = self.negotiator.handle_connection_event(event).await {
                    errors.push(e);
                }
            }
        }
        errors
    }
}

/// `a` sees `b` join and offers; descriptions then flow both ways until
/// neither side has anything left to send
pub async fn exchange(a: &ManualNode, b: &ManualNode) {
    a.negotiator.on_peer_joined(&b.id).await.unwrap();
    settle(a, b).await;
}

/// Deliver every description not yet delivered, in send order, until quiet
pub async fn settle(a: &ManualNode, b: &ManualNode) {
    let (mut to_b, mut to_a) = (0, 0);
    loop {
        let for_b = a.signaling.descriptions_to(&b.id);
        let for_a = b.signaling.descriptions_to(&a.id);
        if for_b.len() == to_b && for_a.len() == to_a {
            return;
        }

        for description in &for_b[to_b..] {
            b.receive(a, description.clone()).await;
        }
        to_b = for_b.len();
        for description in &for_a[to_a..] {
            a.receive(b, description.clone()).await;
        }
        to_a = for_a.len();

        assert!(a.pump().await.is_empty());
        assert!(b.pump().await.is_empty());
    }
}

// =============================================================================
// Live nodes
// =============================================================================

pub struct LiveNode {
    pub id: String,
    pub session: MeshSession,
    pub channel: Arc<LoopbackChannel>,
    pub factory: Arc<FakeConnectionFactory>,
    events: Arc<Mutex<Vec<MeshEvent>>>,
    recorder: JoinHandle<()>,
}

impl LiveNode {
    /// Join `room` as `id`, sending one track of each kind in `kinds`
    pub fn join(room: &Arc<LoopbackSignaling>, id: &str, kinds: &[MediaKind]) -> Self {
        let source = Arc::new(TrackSource::new(64));
        for kind in kinds {
            source.add_track(source.create_track(*kind));
        }

        let factory = Arc::new(FakeConnectionFactory::new());
        let (channel, signaling_events) = room.join(id);
        let session = MeshSession::start(
            &MeshConfig::default(),
            factory.clone(),
            channel.clone(),
            signaling_events,
            source,
        )
        .unwrap();

        // Subscribe before any spawned loop gets to run
        let mut rx = session.subscribe();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let recorder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => sink.lock().push(event),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Self {
            id: id.to_string(),
            session,
            channel,
            factory,
            events,
            recorder,
        }
    }

    pub fn events(&self) -> Vec<MeshEvent> {
        self.events.lock().clone()
    }

    /// Distinct remote track ids received from `peer_id`
    pub fn remote_tracks_from(&self, peer_id: &str) -> usize {
        let mut ids: Vec<String> = self
            .events
            .lock()
            .iter()
            .filter_map(|event| match event {
                MeshEvent::RemoteTrackReceived { peer_id: from, track } if from == peer_id => {
                    Some(track.track_id.clone())
                }
                _ => None,
            })
            .collect();
        ids.sort();
        ids.dedup();
        ids.len()
    }

    pub fn saw(&self, expected: &MeshEvent) -> bool {
        self.events.lock().iter().any(|event| event == expected)
    }

    pub fn source(&self) -> &Arc<TrackSource> {
        self.session.track_source()
    }
}

impl Drop for LiveNode {
    fn drop(&mut self) {
        self.recorder.abort();
    }
}
