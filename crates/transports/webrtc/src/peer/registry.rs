//! Registry of peer connections, keyed by remote peer id

use super::connection::{ConnectionEvent, ConnectionEventSink, ConnectionFactory, PeerStatus};
use super::entry::PeerEntry;
use crate::events::MeshEvent;
use crate::media::TrackSynchronizer;
use crate::signaling::IceCandidate;
use crate::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};

/// Information about a registered peer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub peer_id: String,
    pub connection_id: String,
    pub status: PeerStatus,
    /// Number of local tracks sent to the peer
    pub outbound_tracks: usize,
}

/// Owns at most one connection per remote peer in a mesh
///
/// New entries get every live local track attached before they become
/// visible, while the track synchronizer's gate is held, so a track change
/// racing with creation reaches the new peer exactly once.
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, Arc<PeerEntry>>>,

    /// Candidates that arrived before any description from their peer
    orphan_candidates: Mutex<HashMap<String, VecDeque<IceCandidate>>>,
    orphan_capacity: usize,

    /// Peers removed since they last joined; late signals for them are dropped
    departed: Mutex<HashSet<String>>,

    factory: Arc<dyn ConnectionFactory>,
    synchronizer: Arc<TrackSynchronizer>,
    connection_events: mpsc::UnboundedSender<ConnectionEvent>,
    events: broadcast::Sender<MeshEvent>,
}

impl PeerRegistry {
    /// Create a registry. Returns the receiver for events raised by the
    /// connections it creates.
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        synchronizer: Arc<TrackSynchronizer>,
        event_capacity: usize,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (connection_events, connection_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(event_capacity.max(1));

        let registry = Self {
            peers: RwLock::new(HashMap::new()),
            orphan_candidates: Mutex::new(HashMap::new()),
            orphan_capacity: event_capacity.max(1),
            departed: Mutex::new(HashSet::new()),
            factory,
            synchronizer,
            connection_events,
            events,
        };

        (registry, connection_rx)
    }

    /// Subscribe to UI events
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: MeshEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn synchronizer(&self) -> &Arc<TrackSynchronizer> {
        &self.synchronizer
    }

    /// Return the entry for `peer_id`, creating it on first use
    ///
    /// A new entry starts with all flags false, receives any candidates
    /// buffered for the peer, and has every live local track attached.
    pub async fn get_or_create(&self, peer_id: &str) -> Result<Arc<PeerEntry>> {
        if let Some(entry) = self.get(peer_id).await {
            return Ok(entry);
        }

        let _gate = self.synchronizer.lock().await;

        // Lost a creation race while waiting for the gate
        if let Some(entry) = self.get(peer_id).await {
            return Ok(entry);
        }

        let connection_id = uuid::Uuid::new_v4().to_string();
        let sink =
            ConnectionEventSink::new(peer_id, &connection_id, self.connection_events.clone());
        let connection = self.factory.create(peer_id, sink).await?;
        let entry = Arc::new(PeerEntry::new(peer_id.to_string(), connection));

        if let Some(buffered) = self.orphan_candidates.lock().remove(peer_id) {
            debug!(
                peer_id = %peer_id,
                count = buffered.len(),
                "Moving buffered candidates to new peer"
            );
            for candidate in buffered {
                entry.queue_candidate(candidate);
            }
        }
        self.departed.lock().remove(peer_id);

        self.synchronizer.attach_live_tracks(&entry).await;

        self.peers
            .write()
            .await
            .insert(peer_id.to_string(), Arc::clone(&entry));

        info!(peer_id = %peer_id, connection_id = %connection_id, "Created peer entry");
        self.emit(MeshEvent::PeerConnectionCreated {
            peer_id: peer_id.to_string(),
            connection_id,
        });

        Ok(entry)
    }

    /// Get the entry for `peer_id` without creating one
    pub async fn get(&self, peer_id: &str) -> Option<Arc<PeerEntry>> {
        self.peers.read().await.get(peer_id).cloned()
    }

    /// Whether `entry` is still the registered entry for its peer
    pub async fn is_current(&self, entry: &Arc<PeerEntry>) -> bool {
        match self.peers.read().await.get(entry.peer_id()) {
            Some(current) => Arc::ptr_eq(current, entry),
            None => false,
        }
    }

    /// Remove a peer and close its connection
    ///
    /// Closing is best effort; a failure is logged and the entry is removed
    /// regardless. Returns false if the peer was unknown.
    pub async fn remove(&self, peer_id: &str) -> bool {
        let entry = self.peers.write().await.remove(peer_id);
        self.orphan_candidates.lock().remove(peer_id);
        self.departed.lock().insert(peer_id.to_string());

        let Some(entry) = entry else {
            debug!(peer_id = %peer_id, "Remove for unknown peer");
            return false;
        };

        info!(peer_id = %peer_id, "Removing peer");
        entry.mark_removed();
        entry.clear();

        if let Err(e) = entry.connection().close().await {
            warn!("Error closing peer connection for {}: {}", peer_id, e);
        }

        if entry.set_status(PeerStatus::Closed) {
            self.emit(MeshEvent::PeerStatusChanged {
                peer_id: peer_id.to_string(),
                status: PeerStatus::Closed,
            });
        }
        self.emit(MeshEvent::PeerLeft {
            peer_id: peer_id.to_string(),
        });

        true
    }

    /// Forget that `peer_id` departed so its signals are accepted again
    pub fn mark_joined(&self, peer_id: &str) {
        self.departed.lock().remove(peer_id);
    }

    pub fn is_departed(&self, peer_id: &str) -> bool {
        self.departed.lock().contains(peer_id)
    }

    /// Hold a candidate for a peer that has no entry yet. Candidates for
    /// departed peers are dropped; returns whether it was kept.
    ///
    /// At most `event_capacity` candidates are held per peer. The oldest one
    /// is dropped to make room.
    pub fn buffer_orphan_candidate(&self, peer_id: &str, candidate: IceCandidate) -> bool {
        if self.is_departed(peer_id) {
            return false;
        }
        let mut orphans = self.orphan_candidates.lock();
        let buffered = orphans.entry(peer_id.to_string()).or_default();
        if buffered.len() >= self.orphan_capacity {
            buffered.pop_front();
            debug!(peer_id = %peer_id, "Orphan candidate buffer full, dropped oldest");
        }
        buffered.push_back(candidate);
        true
    }

    pub fn orphan_candidate_count(&self, peer_id: &str) -> usize {
        self.orphan_candidates
            .lock()
            .get(peer_id)
            .map_or(0, VecDeque::len)
    }

    /// Snapshot of all live entries
    pub async fn snapshot(&self) -> Vec<Arc<PeerEntry>> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn list_peers(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self
            .peers
            .read()
            .await
            .values()
            .map(|entry| PeerInfo {
                peer_id: entry.peer_id().to_string(),
                connection_id: entry.connection_id().to_string(),
                status: entry.status(),
                outbound_tracks: entry.sender_count(),
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, peer_id: &str) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    /// Remove all peers and close their connections
    pub async fn clear(&self) {
        debug!("Clearing all peers from registry");

        let peer_ids: Vec<String> = self.peers.read().await.keys().cloned().collect();
        for peer_id in peer_ids {
            self.remove(&peer_id).await;
        }
        self.orphan_candidates.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaKind, TrackSource};
    use crate::testing::FakeConnectionFactory;

    fn registry_with(source: Arc<TrackSource>) -> (Arc<PeerRegistry>, Arc<FakeConnectionFactory>) {
        let factory = Arc::new(FakeConnectionFactory::new());
        let synchronizer = Arc::new(TrackSynchronizer::new(source));
        let (registry, _rx) = PeerRegistry::new(factory.clone(), synchronizer, 16);
        (Arc::new(registry), factory)
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host", n, n),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let (registry, factory) = registry_with(Arc::new(TrackSource::new(8)));

        let first = registry.get_or_create("peer-1").await.unwrap();
        let second = registry.get_or_create("peer-1").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.peer_count().await, 1);
        assert_eq!(factory.created_count(), 1);
        assert_eq!(first.flags(), Default::default());
    }

    #[tokio::test]
    async fn test_concurrent_creation_yields_one_connection() {
        let (registry, factory) = registry_with(Arc::new(TrackSource::new(8)));

        let a = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move { registry.get_or_create("peer-1").await.unwrap() }
        });
        let b = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move { registry.get_or_create("peer-1").await.unwrap() }
        });

        let (a, b) = (a.await.unwrap(), b.await.unwrap());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(factory.created_count(), 1);
    }

    #[tokio::test]
    async fn test_new_entry_gets_live_tracks() {
        let source = Arc::new(TrackSource::new(8));
        source.add_track(source.create_track(MediaKind::Audio));
        source.add_track(source.create_track(MediaKind::Camera));
        let (registry, factory) = registry_with(Arc::clone(&source));

        let entry = registry.get_or_create("peer-1").await.unwrap();

        assert_eq!(entry.sender_count(), 2);
        assert_eq!(factory.connection("peer-1").unwrap().sender_count(), 2);
    }

    #[tokio::test]
    async fn test_orphan_candidates_move_to_new_entry() {
        let (registry, _factory) = registry_with(Arc::new(TrackSource::new(8)));

        assert!(registry.buffer_orphan_candidate("peer-1", candidate(1)));
        assert!(registry.buffer_orphan_candidate("peer-1", candidate(2)));
        assert_eq!(registry.orphan_candidate_count("peer-1"), 2);

        let entry = registry.get_or_create("peer-1").await.unwrap();
        assert_eq!(registry.orphan_candidate_count("peer-1"), 0);
        assert_eq!(entry.take_pending_candidates(), vec![candidate(1), candidate(2)]);
    }

    #[tokio::test]
    async fn test_orphan_buffer_keeps_newest_candidates() {
        let source = Arc::new(TrackSource::new(8));
        let synchronizer = Arc::new(TrackSynchronizer::new(source));
        let (registry, _rx) =
            PeerRegistry::new(Arc::new(FakeConnectionFactory::new()), synchronizer, 2);

        for n in 1..=3 {
            assert!(registry.buffer_orphan_candidate("peer-1", candidate(n)));
        }
        assert_eq!(registry.orphan_candidate_count("peer-1"), 2);

        let entry = registry.get_or_create("peer-1").await.unwrap();
        assert_eq!(entry.take_pending_candidates(), vec![candidate(2), candidate(3)]);
    }

    #[tokio::test]
    async fn test_remove_closes_and_tombstones() {
        let (registry, factory) = registry_with(Arc::new(TrackSource::new(8)));
        let mut events = registry.subscribe();

        let entry = registry.get_or_create("peer-1").await.unwrap();
        entry.queue_candidate(candidate(1));

        assert!(registry.remove("peer-1").await);
        assert!(!registry.remove("peer-1").await);

        assert!(entry.is_removed());
        assert_eq!(entry.pending_candidate_count(), 0);
        assert!(factory.connection("peer-1").unwrap().is_closed());
        assert!(registry.is_departed("peer-1"));
        assert!(!registry.buffer_orphan_candidate("peer-1", candidate(2)));

        assert!(matches!(
            events.recv().await.unwrap(),
            MeshEvent::PeerConnectionCreated { .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            MeshEvent::PeerStatusChanged { status: PeerStatus::Closed, .. }
        ));
        assert_eq!(
            events.recv().await.unwrap(),
            MeshEvent::PeerLeft {
                peer_id: "peer-1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_remove_survives_close_failure() {
        let (registry, factory) = registry_with(Arc::new(TrackSource::new(8)));
        factory.fail_close(true);

        registry.get_or_create("peer-1").await.unwrap();
        assert!(registry.remove("peer-1").await);
        assert!(!registry.has_peer("peer-1").await);
    }

    #[tokio::test]
    async fn test_rejoin_clears_tombstone() {
        let (registry, _factory) = registry_with(Arc::new(TrackSource::new(8)));

        registry.get_or_create("peer-1").await.unwrap();
        registry.remove("peer-1").await;
        registry.mark_joined("peer-1");

        assert!(!registry.is_departed("peer-1"));
        assert!(registry.buffer_orphan_candidate("peer-1", candidate(1)));
    }

    #[tokio::test]
    async fn test_clear_and_list() {
        let (registry, _factory) = registry_with(Arc::new(TrackSource::new(8)));
        registry.get_or_create("b").await.unwrap();
        registry.get_or_create("a").await.unwrap();

        let peers = registry.list_peers().await;
        assert_eq!(
            peers.iter().map(|p| p.peer_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert!(peers.iter().all(|p| p.status == PeerStatus::Connecting));

        registry.clear().await;
        assert_eq!(registry.peer_count().await, 0);
    }
}
