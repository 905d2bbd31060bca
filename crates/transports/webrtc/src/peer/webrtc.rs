//! webrtc-rs backed media connections

use super::connection::{
    ConnectionEventKind, ConnectionEventSink, ConnectionFactory, IceConnectionState,
    MediaConnection, RemoteTrack, RemoteTrackKind, SenderId, SignalingState,
};
use crate::config::MeshConfig;
use crate::media::LocalTrack;
use crate::signaling::{IceCandidate, SdpType, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

/// Builds [`WebRtcConnection`]s from a [`MeshConfig`]
pub struct WebRtcConnectionFactory {
    config: MeshConfig,
}

impl WebRtcConnectionFactory {
    pub fn new(config: MeshConfig) -> Self {
        Self { config }
    }

    fn ice_servers(&self) -> Vec<RTCIceServer> {
        self.config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(self.config.turn_servers.iter().map(|turn| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: vec![turn.url.clone()],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                }
            }))
            .collect()
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    #[instrument(skip(self, events), fields(peer_id = %peer_id))]
    async fn create(
        &self,
        peer_id: &str,
        events: ConnectionEventSink,
    ) -> Result<Arc<dyn MediaConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::WebRtcError(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine).map_err(|e| {
                Error::WebRtcError(format!("Failed to register interceptors: {}", e))
            })?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers(),
            ice_candidate_pool_size: self.config.ice_candidate_pool_size,
            ..Default::default()
        };

        let peer_connection =
            Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
                Error::WebRtcError(format!("Failed to create peer connection: {}", e))
            })?);

        info!(
            connection_id = %events.connection_id(),
            "Created peer connection"
        );

        let connection = WebRtcConnection {
            connection_id: events.connection_id().to_string(),
            peer_connection,
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU64::new(1),
        };
        connection.wire_callbacks(events);

        Ok(Arc::new(connection))
    }
}

/// Media connection backed by an `RTCPeerConnection`
pub struct WebRtcConnection {
    connection_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    /// Senders are retained here so their tracks keep flowing
    senders: Mutex<HashMap<SenderId, Arc<RTCRtpSender>>>,
    next_sender: AtomicU64,
}

impl WebRtcConnection {
    fn wire_callbacks(&self, events: ConnectionEventSink) {
        let sink = events.clone();
        self.peer_connection.on_ice_candidate(Box::new(move |candidate| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => sink.emit(ConnectionEventKind::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                    })),
                    Err(e) => warn!("Failed to serialize local ICE candidate: {}", e),
                }
            })
        }));

        let sink = events.clone();
        self.peer_connection
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let sink = sink.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => RemoteTrackKind::Audio,
                        _ => RemoteTrackKind::Video,
                    };
                    sink.emit(ConnectionEventKind::RemoteTrack(RemoteTrack {
                        track_id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                    }));
                })
            }));

        let sink = events.clone();
        self.peer_connection
            .on_negotiation_needed(Box::new(move || {
                let sink = sink.clone();
                Box::pin(async move {
                    sink.emit(ConnectionEventKind::NegotiationNeeded);
                })
            }));

        let sink = events.clone();
        self.peer_connection
            .on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
                let sink = sink.clone();
                Box::pin(async move {
                    if let Some(state) = map_ice_state(state) {
                        sink.emit(ConnectionEventKind::IceConnectionStateChanged(state));
                    }
                })
            }));

        let sink = events.clone();
        self.peer_connection
            .on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
                let sink = sink.clone();
                Box::pin(async move {
                    if let Some(state) = map_signaling_state(state) {
                        sink.emit(ConnectionEventKind::SignalingStateChanged(state));
                    }
                })
            }));

        let sink = events;
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let peer_id = sink.peer_id().to_string();
                Box::pin(async move {
                    debug!(peer_id = %peer_id, ?state, "Peer connection state changed");
                })
            }));
    }

    fn sender(&self, sender: SenderId) -> Result<Arc<RTCRtpSender>> {
        self.senders
            .lock()
            .get(&sender)
            .cloned()
            .ok_or_else(|| Error::MediaTrackError(format!("Unknown sender {}", sender)))
    }
}

#[async_trait]
impl MediaConnection for WebRtcConnection {
    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.peer_connection.signaling_state()).unwrap_or(SignalingState::Stable)
    }

    fn ice_connection_state(&self) -> IceConnectionState {
        map_ice_state(self.peer_connection.ice_connection_state()).unwrap_or(IceConnectionState::New)
    }

    async fn has_remote_description(&self) -> bool {
        self.peer_connection.remote_description().await.is_some()
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = ice_restart.then_some(RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });

        let offer = self
            .peer_connection
            .create_offer(options)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        let mut description = description;
        if description.sdp_type == SdpType::Rollback && description.sdp.is_empty() {
            // webrtc-rs rejects a rollback without SDP
            if let Some(pending) = self.peer_connection.pending_local_description().await {
                description.sdp = pending.sdp;
            }
        }

        self.peer_connection
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set local description: {}", e)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.peer_connection
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|e| Error::SdpError(format!("Failed to set remote description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: None,
        };

        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| Error::IceCandidateError(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId> {
        let rtp = track.rtp_track() as Arc<dyn TrackLocal + Send + Sync>;
        let sender = self
            .peer_connection
            .add_track(rtp)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to add track: {}", e)))?;

        let id = SenderId(self.next_sender.fetch_add(1, Ordering::Relaxed));
        self.senders.lock().insert(id, sender);
        debug!(track_id = %track.id(), sender = %id, "Added track to peer connection");
        Ok(id)
    }

    async fn replace_track(&self, sender: SenderId, track: &LocalTrack) -> Result<()> {
        let rtp = track.rtp_track() as Arc<dyn TrackLocal + Send + Sync>;
        self.sender(sender)?
            .replace_track(Some(rtp))
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to replace track: {}", e)))
    }

    async fn remove_track(&self, sender: SenderId) -> Result<()> {
        let rtp_sender = self.sender(sender)?;
        self.peer_connection
            .remove_track(&rtp_sender)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to remove track: {}", e)))?;
        self.senders.lock().remove(&sender);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().clear();
        self.peer_connection
            .close()
            .await
            .map_err(|e| Error::WebRtcError(format!("Failed to close peer connection: {}", e)))
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription> {
    match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp)
            .map_err(|e| Error::SdpError(format!("Failed to parse offer: {}", e))),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp)
            .map_err(|e| Error::SdpError(format!("Failed to parse answer: {}", e))),
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            rollback.sdp = description.sdp;
            Ok(rollback)
        }
    }
}

fn map_signaling_state(state: RTCSignalingState) -> Option<SignalingState> {
    match state {
        RTCSignalingState::Stable => Some(SignalingState::Stable),
        RTCSignalingState::HaveLocalOffer => Some(SignalingState::HaveLocalOffer),
        RTCSignalingState::HaveRemoteOffer => Some(SignalingState::HaveRemoteOffer),
        RTCSignalingState::HaveLocalPranswer => Some(SignalingState::HaveLocalPranswer),
        RTCSignalingState::HaveRemotePranswer => Some(SignalingState::HaveRemotePranswer),
        RTCSignalingState::Closed => Some(SignalingState::Closed),
        _ => None,
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    match state {
        RTCIceConnectionState::New => Some(IceConnectionState::New),
        RTCIceConnectionState::Checking => Some(IceConnectionState::Checking),
        RTCIceConnectionState::Connected => Some(IceConnectionState::Connected),
        RTCIceConnectionState::Completed => Some(IceConnectionState::Completed),
        RTCIceConnectionState::Disconnected => Some(IceConnectionState::Disconnected),
        RTCIceConnectionState::Failed => Some(IceConnectionState::Failed),
        RTCIceConnectionState::Closed => Some(IceConnectionState::Closed),
        _ => None,
    }
}
