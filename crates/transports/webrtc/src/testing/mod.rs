//! In-memory test doubles
//!
//! [`FakeConnection`] models the offer/answer state machine of a browser peer
//! connection closely enough to exercise glare, rollback and candidate
//! buffering without any networking. Its SDP is a small text format: the ICE
//! ufrag, then one `m=audio`/`m=video` section per transceiver with an
//! `a=msid:` line when a track is sent on it. Answers mirror the sections of
//! the offer, so a sender with no matching offered section stays out of the
//! answer until its own side offers, as in JSEP.

mod signaling;

pub use signaling::{LoopbackChannel, LoopbackSignaling, RecordingSignaling};

use crate::media::{LocalTrack, TrackId};
use crate::peer::{
    ConnectionEventKind, ConnectionEventSink, ConnectionFactory, IceConnectionState,
    MediaConnection, RemoteTrack, RemoteTrackKind, SenderId, SignalingState,
};
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
struct OutboundTrack {
    track_id: TrackId,
    stream_id: String,
    video: bool,
}

/// One media section: whether it is video, and the track sent on it
type Section<'a> = (bool, Option<&'a OutboundTrack>);

struct FakeState {
    signaling: SignalingState,
    ice: IceConnectionState,
    current_local: Option<SessionDescription>,
    pending_local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    senders: BTreeMap<SenderId, OutboundTrack>,
    next_sender: u64,
    applied_candidates: Vec<IceCandidate>,
    announced_remote: HashSet<String>,
    negotiation_deferred: bool,
    ice_generation: u32,
    candidates_gathered: u32,
    offers_created: usize,
    replace_count: usize,
    closed: bool,
}

impl FakeState {
    fn new() -> Self {
        Self {
            signaling: SignalingState::Stable,
            ice: IceConnectionState::New,
            current_local: None,
            pending_local: None,
            remote: None,
            senders: BTreeMap::new(),
            next_sender: 1,
            applied_candidates: Vec::new(),
            announced_remote: HashSet::new(),
            negotiation_deferred: false,
            ice_generation: 0,
            candidates_gathered: 0,
            offers_created: 0,
            replace_count: 0,
            closed: false,
        }
    }

    fn set_signaling(&mut self, next: SignalingState, out: &mut Vec<ConnectionEventKind>) {
        if self.signaling != next {
            self.signaling = next;
            out.push(ConnectionEventKind::SignalingStateChanged(next));
        }
        if next == SignalingState::Stable && self.negotiation_deferred {
            self.negotiation_deferred = false;
            out.push(ConnectionEventKind::NegotiationNeeded);
        }
    }

    fn set_ice(&mut self, next: IceConnectionState, out: &mut Vec<ConnectionEventKind>) {
        if self.ice != next {
            self.ice = next;
            out.push(ConnectionEventKind::IceConnectionStateChanged(next));
        }
    }

    fn needs_negotiation(&mut self, out: &mut Vec<ConnectionEventKind>) {
        if self.signaling == SignalingState::Stable {
            out.push(ConnectionEventKind::NegotiationNeeded);
        } else {
            self.negotiation_deferred = true;
        }
    }

    /// ICE "connects" once a full exchange has completed
    fn maybe_connect(&mut self, out: &mut Vec<ConnectionEventKind>) {
        let exchanged = self.current_local.is_some() && self.remote.is_some();
        if self.signaling == SignalingState::Stable
            && exchanged
            && !matches!(
                self.ice,
                IceConnectionState::Connected | IceConnectionState::Completed
            )
        {
            self.set_ice(IceConnectionState::Checking, out);
            self.set_ice(IceConnectionState::Connected, out);
        }
    }

    /// A section per sender, plus receive-only sections so no section the
    /// remote already negotiated disappears
    fn offer_sections(&self) -> Vec<Section<'_>> {
        let negotiated = self
            .remote
            .as_ref()
            .map(|remote| parse_media(&remote.sdp))
            .unwrap_or_default();

        let mut sections = Vec::new();
        for video in [false, true] {
            let senders: Vec<&OutboundTrack> =
                self.senders.values().filter(|t| t.video == video).collect();
            let remote = negotiated.iter().filter(|kind| **kind == video).count();
            for i in 0..senders.len().max(remote) {
                sections.push((video, senders.get(i).copied()));
            }
        }
        sections
    }

    /// The offer's sections in order, each taking an unused sender of its kind
    fn answer_sections(&self) -> Vec<Section<'_>> {
        let offered = self
            .remote
            .as_ref()
            .map(|remote| parse_media(&remote.sdp))
            .unwrap_or_default();

        let mut unused: Vec<&OutboundTrack> = self.senders.values().collect();
        offered
            .into_iter()
            .map(|video| {
                let track = unused
                    .iter()
                    .position(|t| t.video == video)
                    .map(|i| unused.remove(i));
                (video, track)
            })
            .collect()
    }

    fn announce_remote_tracks(&mut self, sdp: &str, out: &mut Vec<ConnectionEventKind>) {
        for track in parse_tracks(sdp) {
            if self.announced_remote.insert(track.track_id.clone()) {
                out.push(ConnectionEventKind::RemoteTrack(track));
            }
        }
    }
}

/// In-memory [`MediaConnection`]
pub struct FakeConnection {
    peer_id: String,
    connection_id: String,
    events: ConnectionEventSink,
    state: Mutex<FakeState>,
    offer_gate: Mutex<Option<Arc<Semaphore>>>,
    fail_close: bool,
    fail_replace: AtomicBool,
}

impl FakeConnection {
    pub fn new(events: ConnectionEventSink, fail_close: bool) -> Self {
        Self {
            peer_id: events.peer_id().to_string(),
            connection_id: events.connection_id().to_string(),
            events,
            state: Mutex::new(FakeState::new()),
            offer_gate: Mutex::new(None),
            fail_close,
            fail_replace: AtomicBool::new(false),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Park every subsequent `create_offer` until [`Self::release_offer`]
    pub fn hold_offers(&self) {
        *self.offer_gate.lock() = Some(Arc::new(Semaphore::new(0)));
    }

    /// Let one parked offer proceed
    pub fn release_offer(&self) {
        if let Some(gate) = self.offer_gate.lock().as_ref() {
            gate.add_permits(1);
        }
    }

    /// Stop parking offers and release any that are waiting
    pub fn release_all_offers(&self) {
        if let Some(gate) = self.offer_gate.lock().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// Force an ICE state, raising the matching event
    pub fn set_ice_state(&self, next: IceConnectionState) {
        let mut out = Vec::new();
        self.state.lock().set_ice(next, &mut out);
        self.flush(out);
    }

    /// Make `replace_track` fail from now on
    pub fn fail_replace(&self, fail: bool) {
        self.fail_replace.store(fail, Ordering::SeqCst);
    }

    /// Raise negotiation-needed as if the transceiver set had changed
    pub fn trigger_negotiation_needed(&self) {
        self.events.emit(ConnectionEventKind::NegotiationNeeded);
    }

    pub fn sender_count(&self) -> usize {
        self.state.lock().senders.len()
    }

    pub fn replace_count(&self) -> usize {
        self.state.lock().replace_count
    }

    pub fn offers_created(&self) -> usize {
        self.state.lock().offers_created
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied_candidates.clone()
    }

    /// Pending local description if any, else the current one
    pub fn local_description(&self) -> Option<SessionDescription> {
        let state = self.state.lock();
        state
            .pending_local
            .clone()
            .or_else(|| state.current_local.clone())
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn flush(&self, events: Vec<ConnectionEventKind>) {
        for event in events {
            self.events.emit(event);
        }
    }

    fn ufrag(&self, generation: u32) -> String {
        format!("{}.{}", self.connection_id, generation)
    }

    fn render_sdp(&self, ice_generation: u32, sections: &[Section<'_>]) -> String {
        let mut sdp = format!(
            "v=0\r\no=- {} 0 IN IP4 127.0.0.1\r\ns=-\r\na=ice-ufrag:{}\r\n",
            self.connection_id,
            self.ufrag(ice_generation)
        );
        for (video, track) in sections {
            let kind = if *video { "video" } else { "audio" };
            sdp.push_str(&format!("m={}\r\n", kind));
            if let Some(track) = track {
                sdp.push_str(&format!(
                    "a=msid:{} {} {}\r\n",
                    track.stream_id, track.track_id, kind
                ));
            }
        }
        sdp
    }

    fn gather_candidate(&self, state: &mut FakeState, sdp: &str, out: &mut Vec<ConnectionEventKind>) {
        state.candidates_gathered += 1;
        let n = state.candidates_gathered;
        let ufrag = parse_ufrag(sdp).unwrap_or_default();
        out.push(ConnectionEventKind::LocalCandidate(IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host ufrag {}",
                n,
                50000 + n,
                ufrag
            ),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }));
    }

    fn ensure_open(state: &FakeState) -> Result<()> {
        if state.closed {
            return Err(Error::PeerConnectionError("connection closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MediaConnection for FakeConnection {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        self.state.lock().ice
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let gate = self.offer_gate.lock().clone();
        if let Some(gate) = gate {
            gate.acquire()
                .await
                .map_err(|_| Error::ChannelClosed("offer gate closed".to_string()))?
                .forget();
        }

        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.signaling == SignalingState::HaveRemoteOffer {
            return Err(Error::SdpError(
                "Cannot create offer in have-remote-offer".to_string(),
            ));
        }
        if ice_restart {
            state.ice_generation += 1;
        }
        state.offers_created += 1;
        let sdp = self.render_sdp(state.ice_generation, &state.offer_sections());
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let state = self.state.lock();
        Self::ensure_open(&state)?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(Error::SdpError(format!(
                "Cannot create answer in {:?}",
                state.signaling
            )));
        }
        let sdp = self.render_sdp(state.ice_generation, &state.answer_sections());
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let mut out = Vec::new();
        {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            match (description.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    self.gather_candidate(&mut state, &description.sdp, &mut out);
                    state.pending_local = Some(description);
                    state.set_signaling(SignalingState::HaveLocalOffer, &mut out);
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => {
                    self.gather_candidate(&mut state, &description.sdp, &mut out);
                    state.current_local = Some(description);
                    state.set_signaling(SignalingState::Stable, &mut out);
                    state.maybe_connect(&mut out);
                }
                (SdpType::Rollback, SignalingState::HaveLocalOffer) => {
                    state.pending_local = None;
                    state.set_signaling(SignalingState::Stable, &mut out);
                }
                (sdp_type, signaling) => {
                    return Err(Error::SdpError(format!(
                        "Cannot set local {:?} in {:?}",
                        sdp_type, signaling
                    )));
                }
            }
        }
        self.flush(out);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let mut out = Vec::new();
        {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            match (description.sdp_type, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveRemoteOffer) => {
                    state.announce_remote_tracks(&description.sdp, &mut out);
                    state.remote = Some(description);
                    state.set_signaling(SignalingState::HaveRemoteOffer, &mut out);
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                    state.announce_remote_tracks(&description.sdp, &mut out);
                    state.remote = Some(description);
                    state.current_local = state.pending_local.take();
                    state.set_signaling(SignalingState::Stable, &mut out);
                    state.maybe_connect(&mut out);
                }
                (sdp_type, signaling) => {
                    return Err(Error::SdpError(format!(
                        "Cannot set remote {:?} in {:?}",
                        sdp_type, signaling
                    )));
                }
            }
        }
        self.flush(out);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        let Some(remote) = state.remote.as_ref() else {
            return Err(Error::IceCandidateError(
                "No remote description".to_string(),
            ));
        };

        if let Some(ufrag) = candidate_ufrag(&candidate.candidate) {
            if parse_ufrag(&remote.sdp).as_deref() != Some(ufrag) {
                return Err(Error::IceCandidateError(format!(
                    "Unknown ufrag {}",
                    ufrag
                )));
            }
        }

        state.applied_candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId> {
        let mut out = Vec::new();
        let id = {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            if state.senders.values().any(|t| &t.track_id == track.id()) {
                return Err(Error::MediaTrackError(format!(
                    "Track {} already has a sender",
                    track.id()
                )));
            }

            let id = SenderId(state.next_sender);
            state.next_sender += 1;
            state.senders.insert(
                id,
                OutboundTrack {
                    track_id: track.id().clone(),
                    stream_id: track.stream_id().to_string(),
                    video: track.kind().is_video(),
                },
            );
            state.needs_negotiation(&mut out);
            id
        };
        self.flush(out);
        Ok(id)
    }

    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> Result<()> {
        if self.fail_replace.load(Ordering::SeqCst) {
            return Err(Error::MediaTrackError("replace failed".to_string()));
        }
        let mut state = self.state.lock();
        Self::ensure_open(&state)?;
        let Some(slot) = state.senders.get_mut(&sender) else {
            return Err(Error::MediaTrackError(format!("Unknown sender {}", sender)));
        };
        slot.track_id = track.id().clone();
        slot.video = track.kind().is_video();
        state.replace_count += 1;
        Ok(())
    }

    async fn remove_track(&self, sender: SenderId) -> Result<()> {
        let mut out = Vec::new();
        {
            let mut state = self.state.lock();
            Self::ensure_open(&state)?;
            if state.senders.remove(&sender).is_none() {
                return Err(Error::MediaTrackError(format!("Unknown sender {}", sender)));
            }
            state.needs_negotiation(&mut out);
        }
        self.flush(out);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.signaling = SignalingState::Closed;
        state.ice = IceConnectionState::Closed;
        state.senders.clear();
        if self.fail_close {
            return Err(Error::PeerConnectionError("close failed".to_string()));
        }
        Ok(())
    }
}

/// Factory handing out [`FakeConnection`]s and keeping a handle to each
#[derive(Default)]
pub struct FakeConnectionFactory {
    connections: Mutex<HashMap<String, Arc<FakeConnection>>>,
    created: AtomicUsize,
    fail_close: AtomicBool,
}

impl FakeConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent connection created for `peer_id`
    pub fn connection(&self, peer_id: &str) -> Option<Arc<FakeConnection>> {
        self.connections.lock().get(peer_id).cloned()
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Make `close` fail on connections created from now on
    pub fn fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConnectionFactory for FakeConnectionFactory {
    async fn create(
        &self,
        peer_id: &str,
        events: ConnectionEventSink,
    ) -> Result<Arc<dyn MediaConnection>> {
        let connection = Arc::new(FakeConnection::new(
            events,
            self.fail_close.load(Ordering::SeqCst),
        ));
        self.connections
            .lock()
            .insert(peer_id.to_string(), Arc::clone(&connection));
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(connection)
    }
}

fn parse_ufrag(sdp: &str) -> Option<String> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("a=ice-ufrag:"))
        .map(|ufrag| ufrag.trim().to_string())
}

fn candidate_ufrag(candidate: &str) -> Option<&str> {
    let mut parts = candidate.split_whitespace();
    while let Some(part) = parts.next() {
        if part == "ufrag" {
            return parts.next();
        }
    }
    None
}

/// Media sections of an SDP in order, true for video
fn parse_media(sdp: &str) -> Vec<bool> {
    sdp.lines()
        .filter_map(|line| line.strip_prefix("m="))
        .map(|media| media.starts_with("video"))
        .collect()
}

fn parse_tracks(sdp: &str) -> Vec<RemoteTrack> {
    sdp.lines()
        .filter_map(|line| line.strip_prefix("a=msid:"))
        .filter_map(|rest| {
            let mut parts = rest.split_whitespace();
            let stream_id = parts.next()?;
            let track_id = parts.next()?;
            let kind = match parts.next()? {
                "video" => RemoteTrackKind::Video,
                _ => RemoteTrackKind::Audio,
            };
            Some(RemoteTrack {
                track_id: track_id.to_string(),
                stream_id: stream_id.to_string(),
                kind,
            })
        })
        .collect()
}
