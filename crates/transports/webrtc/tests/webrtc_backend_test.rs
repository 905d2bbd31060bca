//! Negotiation over real webrtc-rs peer connections
//!
//! Descriptions are carried by hand between two negotiators; no ICE traffic is
//! needed to check what each side describes.

use meshcall_webrtc::config::{GlarePolicy, MeshConfig};
use meshcall_webrtc::peer::{ConnectionEvent, PeerRegistry, SignalingState};
use meshcall_webrtc::testing::RecordingSignaling;
use meshcall_webrtc::{
    LocalTrack, MediaConnection, MediaKind, Negotiator, TrackSource, TrackSynchronizer,
    WebRtcConnectionFactory,
};
use std::sync::Arc;
use tokio::sync::mpsc;

struct Node {
    source: Arc<TrackSource>,
    registry: Arc<PeerRegistry>,
    signaling: Arc<RecordingSignaling>,
    negotiator: Negotiator,
    _connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

fn node(id: &str, kinds: &[MediaKind]) -> Node {
    let source = Arc::new(TrackSource::new(16));
    for kind in kinds {
        source.add_track(source.create_track(*kind));
    }

    let factory = Arc::new(WebRtcConnectionFactory::new(MeshConfig::default()));
    let synchronizer = Arc::new(TrackSynchronizer::new(Arc::clone(&source)));
    let (registry, connection_events) = PeerRegistry::new(factory, synchronizer, 64);
    let registry = Arc::new(registry);
    let signaling = Arc::new(RecordingSignaling::new(id));
    let negotiator = Negotiator::new(
        Arc::clone(&registry),
        signaling.clone(),
        GlarePolicy::PhaseOnly,
    );

    Node {
        source,
        registry,
        signaling,
        negotiator,
        _connection_events: connection_events,
    }
}

fn camera_of(node: &Node) -> LocalTrack {
    node.source.live_track(MediaKind::Camera).unwrap()
}

#[tokio::test]
async fn test_extra_answerer_track_is_offered_over_webrtc() {
    let a = node("a", &[MediaKind::Audio]);
    let b = node("b", &[MediaKind::Audio, MediaKind::Camera]);
    let camera = camera_of(&b);

    a.negotiator.on_peer_joined("b").await.unwrap();
    let offer = a.signaling.descriptions_to("b").remove(0);
    assert!(offer.is_offer());
    assert!(!offer.sdp.contains("m=video"));

    b.negotiator.handle_description("a", offer).await.unwrap();
    let from_b = b.signaling.descriptions_to("a");
    assert_eq!(from_b.len(), 2);

    let answer = from_b[0].clone();
    assert!(answer.is_answer());
    assert!(!answer.sdp.contains("m=video"));

    let follow_up = from_b[1].clone();
    assert!(follow_up.is_offer());
    assert!(follow_up.sdp.contains("m=video"));
    assert!(follow_up.track_ids().contains(&camera.id().as_str()));

    a.negotiator.handle_description("b", answer).await.unwrap();
    a.negotiator.handle_description("b", follow_up).await.unwrap();

    let a_answer = a.signaling.descriptions_to("b").pop().unwrap();
    assert!(a_answer.is_answer());
    assert!(a_answer.sdp.contains("m=video"));

    b.negotiator.handle_description("a", a_answer).await.unwrap();

    let a_entry = a.registry.get("b").await.unwrap();
    let b_entry = b.registry.get("a").await.unwrap();
    assert_eq!(a_entry.connection().signaling_state(), SignalingState::Stable);
    assert_eq!(b_entry.connection().signaling_state(), SignalingState::Stable);
    assert_eq!(b_entry.flags().described_generation, b_entry.sender_generation());

    a_entry.connection().close().await.unwrap();
    b_entry.connection().close().await.unwrap();
}
