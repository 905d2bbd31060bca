//! Per-peer negotiation state

use super::connection::{MediaConnection, PeerStatus, SenderId};
use crate::media::TrackId;
use crate::signaling::IceCandidate;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Why an offer is being made
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OfferReason {
    /// The connection raised negotiation-needed
    NegotiationNeeded,
    /// First offer to a peer that just joined
    FirstContact,
    /// ICE failed; the offer carries fresh credentials
    IceRestart,
}

/// Perfect-negotiation flags plus bookkeeping for deferred offers
///
/// `making_offer` and `setting_remote_answer_pending` are never both set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NegotiationFlags {
    /// An offer is being created and applied locally
    pub making_offer: bool,
    /// The last remote offer collided and was dropped
    pub ignore_offer: bool,
    /// A remote answer is being applied
    pub setting_remote_answer_pending: bool,
    /// A remote offer is being applied and answered
    pub applying_remote_offer: bool,
    /// At least one description has been exchanged
    pub negotiated: bool,
    /// An offer requested while busy, made once the peer is stable again
    pub pending_offer: Option<OfferReason>,
    /// An ICE restart was already tried on this connection
    pub ice_restart_attempted: bool,
    /// Sender generation covered by the last local description
    pub described_generation: u64,
}

impl NegotiationFlags {
    /// No exchange of our own is in flight
    pub fn is_idle(&self) -> bool {
        !self.making_offer && !self.setting_remote_answer_pending && !self.applying_remote_offer
    }

    /// Record an offer request that could not run yet. ICE restarts win over
    /// plain renegotiation.
    pub fn defer_offer(&mut self, reason: OfferReason) {
        self.pending_offer = Some(match self.pending_offer {
            Some(existing) => existing.max(reason),
            None => reason,
        });
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Phase {
    MakingOffer,
    SettingRemoteAnswer,
    ApplyingRemoteOffer,
}

/// Clears a negotiation phase flag when dropped, on every exit path
pub(crate) struct PhaseGuard<'a> {
    entry: &'a PeerEntry,
    phase: Phase,
}

impl<'a> PhaseGuard<'a> {
    /// Wrap a phase whose flag the caller already set under the flags lock
    pub(crate) fn armed(entry: &'a PeerEntry, phase: Phase) -> Self {
        Self { entry, phase }
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        let mut flags = self.entry.flags.lock();
        match self.phase {
            Phase::MakingOffer => flags.making_offer = false,
            Phase::SettingRemoteAnswer => flags.setting_remote_answer_pending = false,
            Phase::ApplyingRemoteOffer => flags.applying_remote_offer = false,
        }
    }
}

/// One remote peer: its connection, negotiation flags, queued candidates and
/// the senders carrying our local tracks to it
pub struct PeerEntry {
    peer_id: String,
    connection: Arc<dyn MediaConnection>,
    pub(crate) flags: Mutex<NegotiationFlags>,
    pending_candidates: Mutex<VecDeque<IceCandidate>>,
    outbound_senders: Mutex<HashMap<TrackId, SenderId>>,
    /// Bumped whenever a sender is added or removed
    sender_generation: AtomicU64,
    status: Mutex<PeerStatus>,
    removed: AtomicBool,
    created_at: Instant,
}

impl PeerEntry {
    pub(crate) fn new(peer_id: String, connection: Arc<dyn MediaConnection>) -> Self {
        Self {
            peer_id,
            connection,
            flags: Mutex::new(NegotiationFlags::default()),
            pending_candidates: Mutex::new(VecDeque::new()),
            outbound_senders: Mutex::new(HashMap::new()),
            sender_generation: AtomicU64::new(0),
            status: Mutex::new(PeerStatus::Connecting),
            removed: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn connection(&self) -> &Arc<dyn MediaConnection> {
        &self.connection
    }

    pub fn connection_id(&self) -> &str {
        self.connection.connection_id()
    }

    /// Snapshot of the negotiation flags
    pub fn flags(&self) -> NegotiationFlags {
        *self.flags.lock()
    }

    pub fn is_making_offer(&self) -> bool {
        self.flags.lock().making_offer
    }

    pub fn ignore_offer(&self) -> bool {
        self.flags.lock().ignore_offer
    }

    pub fn status(&self) -> PeerStatus {
        *self.status.lock()
    }

    /// Update the status. Returns true if it changed.
    pub(crate) fn set_status(&self, status: PeerStatus) -> bool {
        let mut current = self.status.lock();
        if *current == status {
            return false;
        }
        *current = status;
        true
    }

    /// Whether the entry has been dropped from the registry
    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    pub(crate) fn queue_candidate(&self, candidate: IceCandidate) {
        self.pending_candidates.lock().push_back(candidate);
    }

    /// Take all queued candidates in arrival order
    pub(crate) fn take_pending_candidates(&self) -> Vec<IceCandidate> {
        self.pending_candidates.lock().drain(..).collect()
    }

    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.lock().len()
    }

    pub fn sender_for(&self, track_id: &TrackId) -> Option<SenderId> {
        self.outbound_senders.lock().get(track_id).copied()
    }

    pub(crate) fn record_sender(&self, track_id: TrackId, sender: SenderId) {
        self.outbound_senders.lock().insert(track_id, sender);
    }

    /// Called before a sender is added, so a negotiation-needed raised by the
    /// connection already sees the new generation. Returns that generation.
    pub(crate) fn touch_senders(&self) -> u64 {
        self.sender_generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Undo [`Self::touch_senders`] after the sender could not be added
    ///
    /// Only rolls back while no exchange is in flight and nothing else moved
    /// the generation, since a description may already have captured it.
    pub(crate) fn untouch_senders(&self, touched: u64) {
        let flags = self.flags.lock();
        if !flags.is_idle() || flags.described_generation >= touched {
            return;
        }
        let _ = self.sender_generation.compare_exchange(
            touched,
            touched - 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn take_sender(&self, track_id: &TrackId) -> Option<SenderId> {
        let sender = self.outbound_senders.lock().remove(track_id)?;
        self.sender_generation.fetch_add(1, Ordering::AcqRel);
        Some(sender)
    }

    /// Changes whenever the set of senders needs a new description
    pub fn sender_generation(&self) -> u64 {
        self.sender_generation.load(Ordering::Acquire)
    }

    /// Record that a local description covering `generation` was applied
    pub(crate) fn mark_described(&self, generation: u64) {
        let mut flags = self.flags.lock();
        flags.negotiated = true;
        flags.described_generation = flags.described_generation.max(generation);
    }

    /// Record an applied answer that left some senders out. They can only be
    /// described by an offer of our own, so one is queued for when the peer is
    /// stable again.
    pub(crate) fn mark_partially_described(&self) {
        let mut flags = self.flags.lock();
        flags.negotiated = true;
        flags.described_generation = 0;
        flags.defer_offer(OfferReason::NegotiationNeeded);
    }

    /// Move a sender from one track key to another after a replace
    pub(crate) fn rekey_sender(&self, from: &TrackId, to: TrackId) {
        let mut senders = self.outbound_senders.lock();
        if let Some(sender) = senders.remove(from) {
            senders.insert(to, sender);
        }
    }

    /// Local tracks currently sent to this peer
    pub fn outbound_tracks(&self) -> Vec<TrackId> {
        let mut tracks: Vec<TrackId> = self.outbound_senders.lock().keys().cloned().collect();
        tracks.sort();
        tracks
    }

    pub fn sender_count(&self) -> usize {
        self.outbound_senders.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.pending_candidates.lock().clear();
        self.outbound_senders.lock().clear();
    }
}

impl std::fmt::Debug for PeerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerEntry")
            .field("peer_id", &self.peer_id)
            .field("connection_id", &self.connection_id())
            .field("flags", &self.flags())
            .field("status", &self.status())
            .finish()
    }
}
