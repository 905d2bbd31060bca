use crate::signaling::{
    IceCandidate, SessionDescription, SignalEnvelope, SignalPayload, SignalingChannel,
    SignalingEvent,
};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::warn;

/// Signaling channel that only records what is sent
pub struct RecordingSignaling {
    self_id: String,
    connected: AtomicBool,
    sent: Mutex<Vec<SignalEnvelope>>,
}

impl RecordingSignaling {
    pub fn new(self_id: &str) -> Self {
        Self {
            self_id: self_id.to_string(),
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SignalEnvelope> {
        self.sent.lock().clone()
    }

    pub fn take_sent(&self) -> Vec<SignalEnvelope> {
        std::mem::take(&mut *self.sent.lock())
    }

    /// Descriptions sent to `peer_id`, oldest first
    pub fn descriptions_to(&self, peer_id: &str) -> Vec<SessionDescription> {
        self.sent
            .lock()
            .iter()
            .filter(|e| e.target_id.as_deref() == Some(peer_id))
            .filter_map(|e| match &e.payload {
                SignalPayload::Description(d) => Some(d.clone()),
                SignalPayload::Candidate(_) => None,
            })
            .collect()
    }

    /// Candidates sent to `peer_id`, oldest first
    pub fn candidates_to(&self, peer_id: &str) -> Vec<IceCandidate> {
        self.sent
            .lock()
            .iter()
            .filter(|e| e.target_id.as_deref() == Some(peer_id))
            .filter_map(|e| match &e.payload {
                SignalPayload::Candidate(c) => Some(c.clone()),
                SignalPayload::Description(_) => None,
            })
            .collect()
    }

    /// Wrap `payload` as if `self` had sent it to `target`
    pub fn envelope(&self, target: &str, payload: SignalPayload) -> SignalingEvent {
        SignalingEvent::Signal {
            envelope: SignalEnvelope {
                sender_id: self.self_id.clone(),
                target_id: Some(target.to_string()),
                room_id: String::new(),
                payload,
            },
        }
    }
}

#[async_trait]
impl SignalingChannel for RecordingSignaling {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn self_id(&self) -> Option<String> {
        Some(self.self_id.clone())
    }

    async fn send(&self, target_id: Option<&str>, payload: SignalPayload) -> Result<()> {
        self.sent.lock().push(SignalEnvelope {
            sender_id: self.self_id.clone(),
            target_id: target_id.map(str::to_string),
            room_id: String::new(),
            payload,
        });
        Ok(())
    }
}

/// In-memory relay between several negotiators in one room
///
/// Mirrors the relay server: a joining member gets `connected`, existing
/// members get `peer-joined`, and signals go to their target or to everyone
/// else in the room.
pub struct LoopbackSignaling {
    room_id: String,
    members: Mutex<Vec<(String, mpsc::Sender<SignalingEvent>)>>,
}

impl LoopbackSignaling {
    pub fn new(room_id: &str) -> Arc<Self> {
        Arc::new(Self {
            room_id: room_id.to_string(),
            members: Mutex::new(Vec::new()),
        })
    }

    /// Join `peer_id`, returning its channel and event receiver
    pub fn join(self: &Arc<Self>, peer_id: &str) -> (Arc<LoopbackChannel>, mpsc::Receiver<SignalingEvent>) {
        let (tx, rx) = mpsc::channel(1024);
        let mut members = self.members.lock();

        deliver(
            &tx,
            SignalingEvent::Connected {
                self_id: peer_id.to_string(),
            },
        );
        for (_, other) in members.iter() {
            deliver(
                other,
                SignalingEvent::PeerJoined {
                    peer_id: peer_id.to_string(),
                },
            );
        }
        members.push((peer_id.to_string(), tx));

        let channel = Arc::new(LoopbackChannel {
            hub: Arc::downgrade(self),
            self_id: peer_id.to_string(),
            connected: AtomicBool::new(true),
        });
        (channel, rx)
    }

    /// Remove `peer_id` and tell everyone else
    pub fn leave(&self, peer_id: &str) {
        let mut members = self.members.lock();
        members.retain(|(id, _)| id != peer_id);
        for (_, other) in members.iter() {
            deliver(
                other,
                SignalingEvent::PeerLeft {
                    peer_id: peer_id.to_string(),
                },
            );
        }
    }

    fn route(&self, envelope: SignalEnvelope) {
        let members = self.members.lock();
        for (id, tx) in members.iter() {
            let addressed = match &envelope.target_id {
                Some(target) => target == id,
                None => id != &envelope.sender_id,
            };
            if addressed {
                deliver(
                    tx,
                    SignalingEvent::Signal {
                        envelope: envelope.clone(),
                    },
                );
            }
        }
    }
}

fn deliver(tx: &mpsc::Sender<SignalingEvent>, event: SignalingEvent) {
    if let Err(e) = tx.try_send(event) {
        warn!("Loopback delivery failed: {}", e);
    }
}

/// One member's handle on a [`LoopbackSignaling`] room
pub struct LoopbackChannel {
    hub: Weak<LoopbackSignaling>,
    self_id: String,
    connected: AtomicBool,
}

impl LoopbackChannel {
    /// Leave the room
    pub fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            if let Some(hub) = self.hub.upgrade() {
                hub.leave(&self.self_id);
            }
        }
    }
}

#[async_trait]
impl SignalingChannel for LoopbackChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn self_id(&self) -> Option<String> {
        Some(self.self_id.clone())
    }

    async fn send(&self, target_id: Option<&str>, payload: SignalPayload) -> Result<()> {
        let Some(hub) = self.hub.upgrade() else {
            return Err(crate::Error::ChannelClosed("loopback room dropped".to_string()));
        };
        hub.route(SignalEnvelope {
            sender_id: self.self_id.clone(),
            target_id: target_id.map(str::to_string),
            room_id: hub.room_id.clone(),
            payload,
        });
        Ok(())
    }
}
