//! Local track source
//!
//! Owns the set of locally captured tracks (microphone, camera, screen) and
//! publishes every change on a broadcast feed. Capture itself happens outside
//! this crate; producers write samples into [`LocalTrack::rtp_track`].

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Identity of a local track
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(String);

impl TrackId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TrackId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TrackId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a local track carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Microphone audio
    Audio,
    /// Webcam video
    Camera,
    /// Screen share video
    Screen,
}

impl MediaKind {
    pub fn is_video(&self) -> bool {
        matches!(self, MediaKind::Camera | MediaKind::Screen)
    }

    /// Codec the RTP track is created with
    pub fn codec_capability(&self) -> RTCRtpCodecCapability {
        match self {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Camera | MediaKind::Screen => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        }
    }
}

/// A locally captured track shared by reference across all peers
///
/// Peers only forward the track; none of them may stop or mutate it.
#[derive(Clone)]
pub struct LocalTrack {
    id: TrackId,
    kind: MediaKind,
    stream_id: String,
    enabled: Arc<AtomicBool>,
    rtp: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    /// Create a new track belonging to `stream_id`
    pub fn new(kind: MediaKind, stream_id: impl Into<String>) -> Self {
        let id = TrackId::generate();
        let stream_id = stream_id.into();
        let rtp = Arc::new(TrackLocalStaticSample::new(
            kind.codec_capability(),
            id.to_string(),
            stream_id.clone(),
        ));

        Self {
            id,
            kind,
            stream_id,
            enabled: Arc::new(AtomicBool::new(true)),
            rtp,
        }
    }

    pub fn id(&self) -> &TrackId {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Whether samples should currently be written (false while muted)
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// RTP track samples are written into
    pub fn rtp_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.rtp)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for LocalTrack {}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Change to the live track set
#[derive(Debug, Clone)]
pub enum TrackEvent {
    /// A track started
    Added(LocalTrack),
    /// `from` was swapped out for `to`
    Replaced { from: LocalTrack, to: LocalTrack },
    /// A track stopped
    Removed(LocalTrack),
}

/// Owner of the live local track set
pub struct TrackSource {
    stream_id: String,
    live: RwLock<Vec<LocalTrack>>,
    events: broadcast::Sender<TrackEvent>,
}

impl TrackSource {
    /// Create an empty source whose tracks share one stream id
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            stream_id: uuid::Uuid::new_v4().to_string(),
            live: RwLock::new(Vec::new()),
            events,
        }
    }

    /// Stream id shared by every track created through this source
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// Create a track on this source's stream (not yet live)
    pub fn create_track(&self, kind: MediaKind) -> LocalTrack {
        LocalTrack::new(kind, self.stream_id.clone())
    }

    /// Subscribe to track changes
    pub fn subscribe(&self) -> broadcast::Receiver<TrackEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the live tracks in the order they started
    pub fn live_tracks(&self) -> Vec<LocalTrack> {
        self.live.read().clone()
    }

    pub fn is_live(&self, id: &TrackId) -> bool {
        self.live.read().iter().any(|t| t.id() == id)
    }

    /// First live track of the given kind
    pub fn live_track(&self, kind: MediaKind) -> Option<LocalTrack> {
        self.live.read().iter().find(|t| t.kind() == kind).cloned()
    }

    /// Start a track. Returns false if it was already live.
    pub fn add_track(&self, track: LocalTrack) -> bool {
        let mut live = self.live.write();
        if live.iter().any(|t| t.id() == track.id()) {
            debug!(track_id = %track.id(), "Track already live");
            return false;
        }

        info!(track_id = %track.id(), kind = ?track.kind(), "Local track added");
        live.push(track.clone());
        // Sent under the lock so subscribers observe changes in mutation order
        let _ = self.events.send(TrackEvent::Added(track));
        true
    }

    /// Swap `from` for `to`. `from` need not be live; peers that never saw it
    /// receive `to` as a fresh track.
    pub fn replace_track(&self, from: &LocalTrack, to: LocalTrack) {
        let mut live = self.live.write();
        live.retain(|t| t.id() != from.id());
        if !live.iter().any(|t| t.id() == to.id()) {
            live.push(to.clone());
        }

        info!(from = %from.id(), to = %to.id(), "Local track replaced");
        let _ = self.events.send(TrackEvent::Replaced {
            from: from.clone(),
            to,
        });
    }

    /// Stop a track. Returns the removed track if it was live.
    pub fn remove_track(&self, id: &TrackId) -> Option<LocalTrack> {
        let mut live = self.live.write();
        let index = live.iter().position(|t| t.id() == id)?;
        let track = live.remove(index);

        info!(track_id = %id, "Local track removed");
        let _ = self.events.send(TrackEvent::Removed(track.clone()));
        Some(track)
    }

    /// Switch video to the webcam, replacing a live screen share
    pub fn use_camera(&self, camera: LocalTrack) {
        self.swap_video(MediaKind::Screen, camera);
    }

    /// Switch video to a screen share, replacing a live webcam
    pub fn use_screen(&self, screen: LocalTrack) {
        self.swap_video(MediaKind::Camera, screen);
    }

    /// A muted track is still live and still gets replaced
    fn swap_video(&self, other: MediaKind, track: LocalTrack) {
        match self.live_track(other) {
            Some(current) => self.replace_track(&current, track),
            None => {
                self.add_track(track);
            }
        }
    }

    /// Mute or unmute a live track. Does not touch negotiation.
    pub fn set_enabled(&self, id: &TrackId, enabled: bool) -> bool {
        match self.live.read().iter().find(|t| t.id() == id) {
            Some(track) => {
                track.set_enabled(enabled);
                debug!(track_id = %id, enabled, "Local track toggled");
                true
            }
            None => false,
        }
    }
}
