//! Fan-out of local track changes to every peer connection
//!
//! Every peer should carry exactly one sender per live local track. Peer
//! creation and each fan-out pass run under one async gate, so a peer created
//! while a track is being added sees it either in its initial attach or in the
//! fan-out, never both and never neither.

use super::track_source::{LocalTrack, TrackEvent, TrackSource};
use crate::peer::{PeerEntry, PeerRegistry};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Applies [`TrackEvent`]s to every registered peer
pub struct TrackSynchronizer {
    source: Arc<TrackSource>,
    gate: Mutex<()>,
}

impl TrackSynchronizer {
    pub fn new(source: Arc<TrackSource>) -> Self {
        Self {
            source,
            gate: Mutex::new(()),
        }
    }

    pub fn source(&self) -> &Arc<TrackSource> {
        &self.source
    }

    /// Hold off fan-out while a peer is being created
    pub(crate) async fn lock(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().await
    }

    /// Attach every live track a new peer does not carry yet. The caller holds
    /// the gate.
    pub(crate) async fn attach_live_tracks(&self, entry: &PeerEntry) {
        for track in self.source.live_tracks() {
            attach(entry, &track).await;
        }
    }

    /// Start sending `track` to every peer. Returns the number of new senders.
    pub async fn on_local_track_added(&self, registry: &PeerRegistry, track: &LocalTrack) -> usize {
        let _gate = self.gate.lock().await;
        let mut added = 0;
        for entry in registry.snapshot().await {
            if !entry.is_removed() && attach(&entry, track).await {
                added += 1;
            }
        }
        info!(track_id = %track.id(), peers = added, "Local track fanned out");
        added
    }

    /// Swap `from` for `to` on every peer. Peers without a sender for `from`
    /// get `to` added instead, and so do peers whose replace failed once the
    /// stale `from` sender is dropped.
    pub async fn on_local_track_replaced(
        &self,
        registry: &PeerRegistry,
        from: &LocalTrack,
        to: &LocalTrack,
    ) {
        let _gate = self.gate.lock().await;
        for entry in registry.snapshot().await {
            if entry.is_removed() {
                continue;
            }

            match entry.sender_for(from.id()) {
                Some(sender) => match entry.connection().replace_track(sender, to).await {
                    Ok(()) => {
                        entry.rekey_sender(from.id(), to.id().clone());
                        debug!(peer_id = %entry.peer_id(), from = %from.id(), to = %to.id(), "Replaced track");
                    }
                    Err(e) => {
                        warn!(
                            peer_id = %entry.peer_id(),
                            "Failed to replace track {}, re-adding: {}", from.id(), e
                        );
                        detach(&entry, from.id()).await;
                        attach(&entry, to).await;
                    }
                },
                None => {
                    attach(&entry, to).await;
                }
            }
        }
    }

    /// Stop sending `track` to every peer
    pub async fn on_local_track_removed(&self, registry: &PeerRegistry, track: &LocalTrack) {
        let _gate = self.gate.lock().await;
        for entry in registry.snapshot().await {
            detach(&entry, track.id()).await;
        }
    }

    /// Bring every peer in line with the live track set. Used after missed
    /// events.
    pub async fn reconcile(&self, registry: &PeerRegistry) {
        let _gate = self.gate.lock().await;
        let live = self.source.live_tracks();

        for entry in registry.snapshot().await {
            if entry.is_removed() {
                continue;
            }
            for stale in entry
                .outbound_tracks()
                .into_iter()
                .filter(|id| !live.iter().any(|t| t.id() == id))
            {
                detach(&entry, &stale).await;
            }
            for track in &live {
                attach(&entry, track).await;
            }
        }
        info!(tracks = live.len(), "Reconciled peers with live tracks");
    }

    pub async fn apply(&self, registry: &PeerRegistry, event: &TrackEvent) {
        match event {
            TrackEvent::Added(track) => {
                self.on_local_track_added(registry, track).await;
            }
            TrackEvent::Replaced { from, to } => {
                self.on_local_track_replaced(registry, from, to).await
            }
            TrackEvent::Removed(track) => self.on_local_track_removed(registry, track).await,
        }
    }

    /// Apply track events until the source goes away
    pub async fn run(
        self: Arc<Self>,
        registry: Arc<PeerRegistry>,
        mut events: broadcast::Receiver<TrackEvent>,
    ) {
        loop {
            match events.recv().await {
                Ok(event) => self.apply(&registry, &event).await,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Track events lagged, reconciling");
                    self.reconcile(&registry).await;
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Track event stream ended");
    }
}

/// Add a sender for `track` unless the peer already has one
async fn attach(entry: &PeerEntry, track: &LocalTrack) -> bool {
    if entry.sender_for(track.id()).is_some() {
        return false;
    }

    let touched = entry.touch_senders();
    match entry.connection().add_track(track).await {
        Ok(sender) => {
            entry.record_sender(track.id().clone(), sender);
            debug!(peer_id = %entry.peer_id(), track_id = %track.id(), "Attached track");
            true
        }
        Err(e) => {
            entry.untouch_senders(touched);
            warn!(
                peer_id = %entry.peer_id(),
                "Failed to attach track {}: {}", track.id(), e
            );
            false
        }
    }
}

async fn detach(entry: &PeerEntry, track_id: &super::TrackId) {
    let Some(sender) = entry.take_sender(track_id) else {
        return;
    };
    if let Err(e) = entry.connection().remove_track(sender).await {
        warn!(
            peer_id = %entry.peer_id(),
            "Failed to remove track {}: {}", track_id, e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaKind;
    use crate::peer::MediaConnection;
    use crate::testing::FakeConnectionFactory;

    struct Fixture {
        source: Arc<TrackSource>,
        synchronizer: Arc<TrackSynchronizer>,
        registry: Arc<PeerRegistry>,
        factory: Arc<FakeConnectionFactory>,
    }

    fn fixture() -> Fixture {
        let source = Arc::new(TrackSource::new(16));
        let factory = Arc::new(FakeConnectionFactory::new());
        let synchronizer = Arc::new(TrackSynchronizer::new(Arc::clone(&source)));
        let (registry, _rx) = PeerRegistry::new(factory.clone(), Arc::clone(&synchronizer), 16);
        Fixture {
            source,
            synchronizer,
            registry: Arc::new(registry),
            factory,
        }
    }

    #[tokio::test]
    async fn test_added_track_reaches_every_peer_once() {
        let f = fixture();
        for peer in ["a", "b", "c"] {
            f.registry.get_or_create(peer).await.unwrap();
        }

        let mic = f.source.create_track(MediaKind::Audio);
        f.source.add_track(mic.clone());
        assert_eq!(f.synchronizer.on_local_track_added(&f.registry, &mic).await, 3);
        // Second delivery of the same event is a no-op
        assert_eq!(f.synchronizer.on_local_track_added(&f.registry, &mic).await, 0);

        for peer in ["a", "b", "c"] {
            assert_eq!(f.factory.connection(peer).unwrap().sender_count(), 1);
        }

        f.registry.get_or_create("d").await.unwrap();
        assert_eq!(f.factory.connection("d").unwrap().sender_count(), 1);
    }

    #[tokio::test]
    async fn test_replace_swaps_or_adds() {
        let f = fixture();
        let camera = f.source.create_track(MediaKind::Camera);
        f.source.add_track(camera.clone());
        let with_camera = f.registry.get_or_create("a").await.unwrap();

        // Peer without a camera sender
        f.source.remove_track(camera.id());
        let without_camera = f.registry.get_or_create("b").await.unwrap();
        assert_eq!(without_camera.sender_count(), 0);

        let screen = f.source.create_track(MediaKind::Screen);
        f.synchronizer
            .on_local_track_replaced(&f.registry, &camera, &screen)
            .await;

        assert_eq!(with_camera.sender_count(), 1);
        assert!(with_camera.sender_for(camera.id()).is_none());
        assert!(with_camera.sender_for(screen.id()).is_some());
        assert_eq!(f.factory.connection("a").unwrap().replace_count(), 1);

        assert!(without_camera.sender_for(screen.id()).is_some());
        assert_eq!(f.factory.connection("b").unwrap().replace_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_replace_drops_stale_sender_and_adds_new_track() {
        let f = fixture();
        let camera = f.source.create_track(MediaKind::Camera);
        f.source.add_track(camera.clone());
        let entry = f.registry.get_or_create("a").await.unwrap();
        let connection = f.factory.connection("a").unwrap();
        connection.fail_replace(true);

        let screen = f.source.create_track(MediaKind::Screen);
        f.synchronizer
            .on_local_track_replaced(&f.registry, &camera, &screen)
            .await;

        assert_eq!(entry.outbound_tracks(), vec![screen.id().clone()]);
        assert_eq!(connection.sender_count(), 1);
        assert_eq!(connection.replace_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_attach_leaves_generation_alone() {
        let f = fixture();
        let entry = f.registry.get_or_create("a").await.unwrap();
        let before = entry.sender_generation();
        entry.connection().close().await.unwrap();

        let mic = f.source.create_track(MediaKind::Audio);
        f.source.add_track(mic.clone());
        assert_eq!(f.synchronizer.on_local_track_added(&f.registry, &mic).await, 0);

        assert_eq!(entry.sender_generation(), before);
        assert!(entry.sender_for(mic.id()).is_none());
    }

    #[tokio::test]
    async fn test_removed_track_detaches_everywhere() {
        let f = fixture();
        let mic = f.source.create_track(MediaKind::Audio);
        f.source.add_track(mic.clone());
        f.registry.get_or_create("a").await.unwrap();
        f.registry.get_or_create("b").await.unwrap();

        f.synchronizer.on_local_track_removed(&f.registry, &mic).await;

        assert_eq!(f.factory.connection("a").unwrap().sender_count(), 0);
        assert_eq!(f.factory.connection("b").unwrap().sender_count(), 0);
    }

    #[tokio::test]
    async fn test_reconcile_repairs_drift() {
        let f = fixture();
        let mic = f.source.create_track(MediaKind::Audio);
        let camera = f.source.create_track(MediaKind::Camera);
        f.source.add_track(mic.clone());
        let entry = f.registry.get_or_create("a").await.unwrap();

        // Events for these two changes were never applied
        f.source.remove_track(mic.id());
        f.source.add_track(camera.clone());

        f.synchronizer.reconcile(&f.registry).await;

        assert_eq!(entry.outbound_tracks(), vec![camera.id().clone()]);
        assert_eq!(f.factory.connection("a").unwrap().sender_count(), 1);
    }

    #[tokio::test]
    async fn test_run_applies_source_events() {
        let f = fixture();
        f.registry.get_or_create("a").await.unwrap();

        let task = tokio::spawn(
            Arc::clone(&f.synchronizer).run(Arc::clone(&f.registry), f.source.subscribe()),
        );

        let mic = f.source.create_track(MediaKind::Audio);
        f.source.add_track(mic.clone());

        let connection = f.factory.connection("a").unwrap();
        for _ in 0..100 {
            if connection.sender_count() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(connection.sender_count(), 1);
        task.abort();
    }
}
