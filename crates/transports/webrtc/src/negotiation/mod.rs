//! Perfect negotiation
//!
//! Every client runs the same state machine for every remote peer, so any side
//! may start an offer at any time. Colliding offers are resolved from each
//! peer's [`NegotiationFlags`](crate::peer::NegotiationFlags) and the
//! configured [`GlarePolicy`].
//!
//! Signaling events are handled one at a time in arrival order. Connection
//! events (local candidates, negotiation-needed, ICE changes) are handled on a
//! second loop; the two only meet through the per-peer flags, which are always
//! read and updated together without yielding.

use crate::config::GlarePolicy;
use crate::events::MeshEvent;
use crate::peer::entry::{Phase, PhaseGuard};
use crate::peer::{
    ConnectionEvent, ConnectionEventKind, IceConnectionState, OfferReason, PeerEntry,
    PeerRegistry, PeerStatus, SignalingState,
};
use crate::signaling::{
    IceCandidate, SdpType, SessionDescription, SignalEnvelope, SignalPayload, SignalingChannel,
    SignalingEvent,
};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, trace, warn};

/// What to do with an inbound description
enum Plan {
    /// Colliding offer we lose
    IgnoreOffer,
    /// Answer arriving while we are building a new offer
    StaleAnswer,
    ApplyAnswer,
    /// Apply and answer a remote offer, rolling back our own offer first
    /// when we yield
    ApplyOffer { rollback: bool },
}

/// Drives offer/answer exchange and candidate trickling for all peers
pub struct Negotiator {
    registry: Arc<PeerRegistry>,
    channel: Arc<dyn SignalingChannel>,
    policy: GlarePolicy,
}

impl Negotiator {
    pub fn new(
        registry: Arc<PeerRegistry>,
        channel: Arc<dyn SignalingChannel>,
        policy: GlarePolicy,
    ) -> Self {
        Self {
            registry,
            channel,
            policy,
        }
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> GlarePolicy {
        self.policy
    }

    fn is_self(&self, peer_id: &str) -> bool {
        self.channel.self_id().as_deref() == Some(peer_id)
    }

    /// Handle one event from the signaling channel
    pub async fn handle_signaling_event(&self, event: SignalingEvent) -> Result<()> {
        match event {
            SignalingEvent::Connected { self_id } => {
                info!(self_id = %self_id, "Signaling session established");
                Ok(())
            }
            SignalingEvent::PeerJoined { peer_id } => self.on_peer_joined(&peer_id).await,
            SignalingEvent::PeerLeft { peer_id } => {
                self.on_peer_left(&peer_id).await;
                Ok(())
            }
            SignalingEvent::Signal { envelope } => self.handle_envelope(envelope).await,
            SignalingEvent::Error { message } => {
                warn!("Signaling server reported an error: {}", message);
                Ok(())
            }
        }
    }

    /// First contact: create the peer and send it an offer right away
    pub async fn on_peer_joined(&self, peer_id: &str) -> Result<()> {
        if self.is_self(peer_id) {
            return Ok(());
        }

        info!(peer_id = %peer_id, "Peer joined");
        self.registry.mark_joined(peer_id);
        self.registry.get_or_create(peer_id).await?;
        self.negotiate(peer_id, OfferReason::FirstContact).await?;
        Ok(())
    }

    /// Tear down a departed peer. Returns false if it was unknown.
    pub async fn on_peer_left(&self, peer_id: &str) -> bool {
        info!(peer_id = %peer_id, "Peer left");
        self.registry.remove(peer_id).await
    }

    async fn handle_envelope(&self, envelope: SignalEnvelope) -> Result<()> {
        if envelope.sender_id.is_empty() || self.is_self(&envelope.sender_id) {
            trace!("Ignoring signal without a remote sender");
            return Ok(());
        }

        if let (Some(target), Some(me)) = (envelope.target_id.as_deref(), self.channel.self_id()) {
            if target != me {
                trace!(target = %target, "Ignoring signal addressed to another peer");
                return Ok(());
            }
        }

        match envelope.payload {
            SignalPayload::Description(description) => {
                self.handle_description(&envelope.sender_id, description)
                    .await
            }
            SignalPayload::Candidate(candidate) => {
                self.handle_candidate(&envelope.sender_id, candidate).await
            }
        }
    }

    /// Create, apply and send an offer to `peer_id`
    ///
    /// Returns whether an offer was sent. An offer that cannot run yet because
    /// the peer is mid-exchange is deferred until the peer is stable again;
    /// negotiation-needed before the first exchange, or with nothing new to
    /// describe, is dropped.
    #[instrument(skip(self), fields(peer_id = %peer_id))]
    pub async fn negotiate(&self, peer_id: &str, reason: OfferReason) -> Result<bool> {
        let Some(entry) = self.registry.get(peer_id).await else {
            debug!(?reason, "No peer entry, not offering");
            return Ok(false);
        };

        if !self.channel.is_connected() {
            debug!(?reason, "Signaling inactive, not offering");
            return Ok(false);
        }

        let (ice_restart, generation) = {
            let mut flags = entry.flags.lock();
            let generation = entry.sender_generation();

            if reason == OfferReason::NegotiationNeeded
                && (!flags.negotiated || flags.described_generation >= generation)
            {
                trace!("Nothing new to negotiate");
                return Ok(false);
            }

            let stable = entry.connection().signaling_state() == SignalingState::Stable;
            if !stable || !flags.is_idle() {
                if reason != OfferReason::FirstContact {
                    flags.defer_offer(reason);
                }
                debug!(?reason, "Peer busy, deferring offer");
                return Ok(false);
            }

            let ice_restart = reason == OfferReason::IceRestart
                || flags.pending_offer == Some(OfferReason::IceRestart);
            flags.pending_offer = None;
            flags.making_offer = true;
            (ice_restart, generation)
        };
        let _offering = PhaseGuard::armed(&entry, Phase::MakingOffer);

        let connection = entry.connection();
        let result = async {
            let offer = connection.create_offer(ice_restart).await?;
            connection.set_local_description(offer.clone()).await?;
            Ok::<SessionDescription, Error>(offer)
        }
        .await;

        if !self.registry.is_current(&entry).await {
            debug!("Peer removed while offering, dropping offer");
            return Ok(false);
        }

        let offer = result.inspect_err(|e| error!(?reason, "Failed to make offer: {}", e))?;
        entry.mark_described(generation);

        self.channel
            .send(Some(peer_id), SignalPayload::Description(offer))
            .await?;
        info!(?reason, ice_restart, "Sent offer");
        Ok(true)
    }

    /// Apply a remote offer or answer from `from`
    #[instrument(skip(self, description), fields(peer_id = %from, sdp_type = ?description.sdp_type))]
    pub async fn handle_description(
        &self,
        from: &str,
        description: SessionDescription,
    ) -> Result<()> {
        let entry = match description.sdp_type {
            SdpType::Offer => {
                if self.registry.is_departed(from) {
                    debug!("Ignoring offer from departed peer");
                    return Ok(());
                }
                self.registry.get_or_create(from).await?
            }
            SdpType::Answer => match self.registry.get(from).await {
                Some(entry) => entry,
                None => {
                    debug!("Ignoring answer from unknown peer");
                    return Ok(());
                }
            },
            SdpType::Rollback => {
                warn!("Ignoring rollback received over signaling");
                return Ok(());
            }
        };

        let plan = {
            let mut flags = entry.flags.lock();
            let state = entry.connection().signaling_state();

            let ready_for_offer = !flags.making_offer
                && (state == SignalingState::Stable || flags.setting_remote_answer_pending);
            let collision = description.is_offer() && !ready_for_offer;
            let yields = collision
                && self
                    .policy
                    .yields_to(self.channel.self_id().as_deref(), from);
            flags.ignore_offer = collision && !yields;

            if flags.ignore_offer {
                Plan::IgnoreOffer
            } else if description.is_answer() {
                if flags.making_offer {
                    Plan::StaleAnswer
                } else {
                    flags.setting_remote_answer_pending = true;
                    Plan::ApplyAnswer
                }
            } else {
                flags.applying_remote_offer = true;
                Plan::ApplyOffer {
                    rollback: yields && state == SignalingState::HaveLocalOffer,
                }
            }
        };

        match plan {
            Plan::IgnoreOffer => {
                info!("Ignoring colliding offer");
                return Ok(());
            }
            Plan::StaleAnswer => {
                warn!("Dropping answer received while making an offer");
                return Ok(());
            }
            Plan::ApplyAnswer => {
                let _applying = PhaseGuard::armed(&entry, Phase::SettingRemoteAnswer);
                entry
                    .connection()
                    .set_remote_description(description)
                    .await
                    .inspect_err(|e| error!("Failed to apply answer: {}", e))?;
                debug!("Applied remote answer");
                self.drain_pending_candidates(&entry).await;
            }
            Plan::ApplyOffer { rollback } => {
                let _applying = PhaseGuard::armed(&entry, Phase::ApplyingRemoteOffer);
                let answer = self
                    .answer_offer(&entry, description, rollback)
                    .await
                    .inspect_err(|e| error!("Failed to answer offer: {}", e))?;

                if !self.registry.is_current(&entry).await {
                    debug!("Peer removed while answering, dropping answer");
                    return Ok(());
                }
                self.channel
                    .send(Some(from), SignalPayload::Description(answer))
                    .await?;
                info!("Sent answer");
            }
        }

        self.resume_deferred_offer(&entry).await
    }

    async fn answer_offer(
        &self,
        entry: &PeerEntry,
        offer: SessionDescription,
        rollback: bool,
    ) -> Result<SessionDescription> {
        let connection = entry.connection();

        if rollback {
            connection
                .set_local_description(SessionDescription::rollback())
                .await?;
            info!(peer_id = %entry.peer_id(), "Rolled back local offer to accept remote offer");
        }

        connection.set_remote_description(offer).await?;
        self.drain_pending_candidates(entry).await;

        let generation = entry.sender_generation();
        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;

        // An answer only carries the media sections the offer had
        let described = answer.track_ids();
        let left_out = entry
            .outbound_tracks()
            .iter()
            .filter(|track| !described.contains(&track.as_str()))
            .count();
        if left_out == 0 {
            entry.mark_described(generation);
        } else {
            debug!(peer_id = %entry.peer_id(), left_out, "Answer left out local tracks, offering them next");
            entry.mark_partially_described();
        }
        Ok(answer)
    }

    /// Run an offer that was deferred while the peer was busy
    async fn resume_deferred_offer(&self, entry: &PeerEntry) -> Result<()> {
        let pending = {
            let mut flags = entry.flags.lock();
            let stable = entry.connection().signaling_state() == SignalingState::Stable;
            if stable && flags.is_idle() {
                flags.pending_offer.take()
            } else {
                None
            }
        };

        if let Some(reason) = pending {
            debug!(peer_id = %entry.peer_id(), ?reason, "Resuming deferred offer");
            self.negotiate(entry.peer_id(), reason).await?;
        }
        Ok(())
    }

    /// Apply a trickled candidate from `from`, or hold it until it can be
    #[instrument(skip(self, candidate), fields(peer_id = %from))]
    pub async fn handle_candidate(&self, from: &str, candidate: IceCandidate) -> Result<()> {
        let Some(entry) = self.registry.get(from).await else {
            if self.registry.buffer_orphan_candidate(from, candidate) {
                debug!("Buffered candidate for unknown peer");
            } else {
                debug!("Dropped candidate from departed peer");
            }
            return Ok(());
        };

        if !entry.connection().has_remote_description().await {
            entry.queue_candidate(candidate);
            debug!(
                queued = entry.pending_candidate_count(),
                "Queued candidate until remote description is set"
            );
            return Ok(());
        }

        self.apply_candidate(&entry, candidate).await
    }

    async fn apply_candidate(&self, entry: &PeerEntry, candidate: IceCandidate) -> Result<()> {
        match entry.connection().add_ice_candidate(candidate).await {
            Ok(()) => Ok(()),
            Err(e) if entry.ignore_offer() => {
                debug!(peer_id = %entry.peer_id(), "Ignoring candidate for an ignored offer: {}", e);
                Ok(())
            }
            Err(e) => {
                warn!(peer_id = %entry.peer_id(), "Failed to add ICE candidate: {}", e);
                Err(e)
            }
        }
    }

    async fn drain_pending_candidates(&self, entry: &PeerEntry) {
        let queued = entry.take_pending_candidates();
        if queued.is_empty() {
            return;
        }

        debug!(peer_id = %entry.peer_id(), count = queued.len(), "Applying queued candidates");
        for candidate in queued {
            // Failures are logged by apply_candidate; keep going
            let _ = self.apply_candidate(entry, candidate).await;
        }
    }

    /// Handle one event raised by a peer connection
    pub async fn handle_connection_event(&self, event: ConnectionEvent) -> Result<()> {
        let Some(entry) = self.registry.get(&event.peer_id).await else {
            trace!(peer_id = %event.peer_id, "Event for unknown peer");
            return Ok(());
        };
        if entry.connection_id() != event.connection_id {
            debug!(peer_id = %event.peer_id, "Ignoring event from a replaced connection");
            return Ok(());
        }

        let peer_id = event.peer_id;
        match event.kind {
            ConnectionEventKind::LocalCandidate(candidate) => {
                self.channel
                    .send(Some(&peer_id), SignalPayload::Candidate(candidate))
                    .await
            }
            ConnectionEventKind::RemoteTrack(track) => {
                info!(peer_id = %peer_id, track_id = %track.track_id, kind = ?track.kind, "Remote track received");
                self.registry
                    .emit(MeshEvent::RemoteTrackReceived { peer_id, track });
                Ok(())
            }
            ConnectionEventKind::NegotiationNeeded => self
                .negotiate(&peer_id, OfferReason::NegotiationNeeded)
                .await
                .map(|_| ()),
            ConnectionEventKind::IceConnectionStateChanged(state) => {
                self.on_ice_state(&entry, state).await
            }
            ConnectionEventKind::SignalingStateChanged(state) => {
                trace!(peer_id = %peer_id, ?state, "Signaling state changed");
                Ok(())
            }
        }
    }

    async fn on_ice_state(&self, entry: &Arc<PeerEntry>, state: IceConnectionState) -> Result<()> {
        let peer_id = entry.peer_id().to_string();

        let restart = state == IceConnectionState::Failed && {
            let mut flags = entry.flags.lock();
            !std::mem::replace(&mut flags.ice_restart_attempted, true)
        };

        let status = PeerStatus::from_ice(state, !restart);
        if entry.set_status(status) {
            info!(peer_id = %peer_id, ?status, "Peer status changed");
            self.registry.emit(MeshEvent::PeerStatusChanged {
                peer_id: peer_id.clone(),
                status,
            });
        }

        match state {
            IceConnectionState::Failed if restart => {
                warn!(peer_id = %peer_id, "ICE failed, restarting");
                self.negotiate(&peer_id, OfferReason::IceRestart).await?;
                Ok(())
            }
            IceConnectionState::Failed => {
                error!(peer_id = %peer_id, "ICE failed again after restart");
                Err(Error::NatTraversalFailed(format!(
                    "peer {} unreachable after ICE restart",
                    peer_id
                )))
            }
            IceConnectionState::Closed => {
                if !entry.is_removed() {
                    self.registry.remove(&peer_id).await;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Handle signaling events until the channel closes
    pub async fn run_signaling(self: Arc<Self>, mut events: mpsc::Receiver<SignalingEvent>) {
        while let Some(event) = events.recv().await {
            let name = event.event_name();
            if let Err(e) = self.handle_signaling_event(event).await {
                log_failure(&e, name, "Failed to handle signaling event");
            }
        }
        info!("Signaling event stream ended");
    }

    /// Handle connection events until every connection is gone
    pub async fn run_connection_events(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let peer_id = event.peer_id.clone();
            if let Err(e) = self.handle_connection_event(event).await {
                log_failure(&e, &peer_id, "Failed to handle connection event");
            }
        }
        debug!("Connection event stream ended");
    }
}

/// Peer errors were already logged where they happened
fn log_failure(e: &Error, source: &str, message: &str) {
    if e.is_peer_error() {
        debug!(source = %source, "{}: {}", message, e);
    } else if e.is_retryable() {
        warn!(source = %source, "{}: {}", message, e);
    } else {
        error!(source = %source, "{}: {}", message, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaKind, TrackSource, TrackSynchronizer};
    use crate::testing::{FakeConnectionFactory, RecordingSignaling};

    struct Harness {
        negotiator: Negotiator,
        registry: Arc<PeerRegistry>,
        factory: Arc<FakeConnectionFactory>,
        signaling: Arc<RecordingSignaling>,
        _connection_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    }

    fn harness(self_id: &str, policy: GlarePolicy) -> Harness {
        let source = Arc::new(TrackSource::new(16));
        source.add_track(source.create_track(MediaKind::Audio));
        let factory = Arc::new(FakeConnectionFactory::new());
        let synchronizer = Arc::new(TrackSynchronizer::new(source));
        let (registry, rx) = PeerRegistry::new(factory.clone(), synchronizer, 16);
        let registry = Arc::new(registry);
        let signaling = Arc::new(RecordingSignaling::new(self_id));
        Harness {
            negotiator: Negotiator::new(Arc::clone(&registry), signaling.clone(), policy),
            registry,
            factory,
            signaling,
            _connection_events: rx,
        }
    }

    #[tokio::test]
    async fn test_peer_joined_sends_offer() {
        let h = harness("a", GlarePolicy::PhaseOnly);
        h.negotiator
            .handle_signaling_event(SignalingEvent::PeerJoined {
                peer_id: "b".to_string(),
            })
            .await
            .unwrap();

        let sent = h.signaling.descriptions_to("b");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_offer());

        let entry = h.registry.get("b").await.unwrap();
        assert!(!entry.is_making_offer());
        assert!(entry.flags().negotiated);
        assert_eq!(
            entry.connection().signaling_state(),
            SignalingState::HaveLocalOffer
        );
    }

    #[tokio::test]
    async fn test_own_join_is_ignored() {
        let h = harness("a", GlarePolicy::PhaseOnly);
        h.negotiator.on_peer_joined("a").await.unwrap();
        assert_eq!(h.registry.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_inbound_offer_creates_peer_and_answers() {
        let h = harness("b", GlarePolicy::PhaseOnly);
        h.negotiator
            .handle_description(
                "a",
                SessionDescription::offer("v=0\r\na=ice-ufrag:x\r\nm=audio\r\n"),
            )
            .await
            .unwrap();

        let sent = h.signaling.descriptions_to("a");
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_answer());
        assert_eq!(
            h.registry.get("a").await.unwrap().connection().signaling_state(),
            SignalingState::Stable
        );
    }

    #[tokio::test]
    async fn test_track_left_out_of_answer_is_offered_next() {
        let h = harness("b", GlarePolicy::PhaseOnly);
        h.negotiator
            .handle_description("a", SessionDescription::offer("v=0\r\na=ice-ufrag:x\r\n"))
            .await
            .unwrap();

        let entry = h.registry.get("a").await.unwrap();
        let mic = entry.outbound_tracks().remove(0);

        let sent = h.signaling.descriptions_to("a");
        assert_eq!(sent.len(), 2);
        assert!(sent[0].is_answer());
        assert!(sent[0].track_ids().is_empty());
        assert!(sent[1].is_offer());
        assert_eq!(sent[1].track_ids(), vec![mic.as_str()]);

        // Once the offer is out, the track counts as described
        assert_eq!(entry.flags().pending_offer, None);
        assert_eq!(entry.flags().described_generation, entry.sender_generation());
        assert!(!h
            .negotiator
            .negotiate("a", OfferReason::NegotiationNeeded)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_no_offer_while_signaling_inactive() {
        let h = harness("a", GlarePolicy::PhaseOnly);
        h.signaling.set_connected(false);
        h.negotiator.on_peer_joined("b").await.unwrap();

        assert!(h.registry.has_peer("b").await);
        assert!(h.signaling.sent().is_empty());
    }

    #[tokio::test]
    async fn test_negotiation_needed_before_first_exchange_is_dropped() {
        let h = harness("a", GlarePolicy::PhaseOnly);
        h.registry.get_or_create("b").await.unwrap();

        let sent = h
            .negotiator
            .negotiate("b", OfferReason::NegotiationNeeded)
            .await
            .unwrap();
        assert!(!sent);
        assert_eq!(h.factory.connection("b").unwrap().offers_created(), 0);
    }

    #[tokio::test]
    async fn test_answer_for_unknown_peer_is_noop() {
        let h = harness("a", GlarePolicy::PhaseOnly);
        h.negotiator
            .handle_description("ghost", SessionDescription::answer("v=0\r\n"))
            .await
            .unwrap();
        assert_eq!(h.registry.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_departed_peer_offer_is_noop() {
        let h = harness("a", GlarePolicy::PhaseOnly);
        h.registry.get_or_create("b").await.unwrap();
        h.negotiator.on_peer_left("b").await;

        h.negotiator
            .handle_description("b", SessionDescription::offer("v=0\r\n"))
            .await
            .unwrap();
        assert!(!h.registry.has_peer("b").await);
        assert!(h.signaling.sent().is_empty());
    }

    #[tokio::test]
    async fn test_signal_for_other_target_is_ignored() {
        let h = harness("a", GlarePolicy::PhaseOnly);
        let event = SignalingEvent::Signal {
            envelope: SignalEnvelope {
                sender_id: "b".to_string(),
                target_id: Some("c".to_string()),
                room_id: "r1".to_string(),
                payload: SignalPayload::Description(SessionDescription::offer("v=0\r\n")),
            },
        };
        h.negotiator.handle_signaling_event(event).await.unwrap();
        assert_eq!(h.registry.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_second_ice_failure_is_terminal() {
        let h = harness("a", GlarePolicy::PhaseOnly);
        let mut events = h.registry.subscribe();
        h.negotiator.on_peer_joined("b").await.unwrap();
        let offer = h.signaling.descriptions_to("b").remove(0);
        let ufrag_line = offer.sdp.lines().find(|l| l.starts_with("a=ice-ufrag")).unwrap().to_string();
        h.negotiator
            .handle_description("b", SessionDescription::answer(format!("v=0\r\n{}\r\n", ufrag_line)))
            .await
            .unwrap();

        let entry = h.registry.get("b").await.unwrap();
        let connection_id = entry.connection_id().to_string();
        let failed = ConnectionEvent {
            peer_id: "b".to_string(),
            connection_id,
            kind: ConnectionEventKind::IceConnectionStateChanged(IceConnectionState::Failed),
        };

        h.negotiator
            .handle_connection_event(failed.clone())
            .await
            .unwrap();
        assert!(entry.flags().ice_restart_attempted);
        assert_eq!(h.factory.connection("b").unwrap().offers_created(), 2);
        assert_eq!(entry.status(), PeerStatus::Connecting);

        let result = h.negotiator.handle_connection_event(failed).await;
        assert!(matches!(result, Err(Error::NatTraversalFailed(_))));
        assert_eq!(entry.status(), PeerStatus::Failed);
        assert!(h.registry.has_peer("b").await);

        let mut saw_failed = false;
        while let Ok(event) = events.try_recv() {
            if event
                == (MeshEvent::PeerStatusChanged {
                    peer_id: "b".to_string(),
                    status: PeerStatus::Failed,
                })
            {
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn test_stale_connection_events_are_ignored() {
        let h = harness("a", GlarePolicy::PhaseOnly);
        h.registry.get_or_create("b").await.unwrap();

        h.negotiator
            .handle_connection_event(ConnectionEvent {
                peer_id: "b".to_string(),
                connection_id: "old".to_string(),
                kind: ConnectionEventKind::IceConnectionStateChanged(IceConnectionState::Closed),
            })
            .await
            .unwrap();
        assert!(h.registry.has_peer("b").await);
    }

    #[tokio::test]
    async fn test_ice_closed_removes_peer() {
        let h = harness("a", GlarePolicy::PhaseOnly);
        let entry = h.registry.get_or_create("b").await.unwrap();

        h.negotiator
            .handle_connection_event(ConnectionEvent {
                peer_id: "b".to_string(),
                connection_id: entry.connection_id().to_string(),
                kind: ConnectionEventKind::IceConnectionStateChanged(IceConnectionState::Closed),
            })
            .await
            .unwrap();
        assert!(!h.registry.has_peer("b").await);
        assert!(entry.is_removed());
    }
}
