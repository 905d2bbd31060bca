//! WebSocket client for the signaling relay
//!
//! Joins a room on connect, relays outbound envelopes and forwards every server
//! frame to the negotiator as a [`SignalingEvent`].

use super::protocol::{ClientMessage, SignalEnvelope, SignalPayload, SignalingEvent};
use super::SignalingChannel;
use crate::{Error, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Signaling channel backed by a WebSocket connection to the relay server
pub struct WebSocketSignalingChannel {
    room_id: String,
    outbound: mpsc::Sender<String>,
    self_id: Arc<RwLock<Option<String>>>,
    connected: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WebSocketSignalingChannel {
    /// Connect to `url` and join `room_id`
    ///
    /// Returns the channel plus the receiver of server events. The channel
    /// reports connected once the relay confirms the join.
    pub async fn connect(
        url: &str,
        room_id: &str,
        capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<SignalingEvent>)> {
        let (ws_stream, _) = connect_async(url).await.map_err(|e| {
            Error::WebSocketError(format!("Failed to connect to {}: {}", url, e))
        })?;
        info!(url = %url, room_id = %room_id, "Connected to signaling server");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::channel::<String>(capacity.max(1));
        let (event_tx, event_rx) = mpsc::channel::<SignalingEvent>(capacity.max(1));

        let self_id = Arc::new(RwLock::new(None));
        let connected = Arc::new(AtomicBool::new(false));

        // Task to forward queued frames to the socket
        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = ws_tx.send(Message::Text(text)).await {
                    error!("Failed to send signaling frame: {}", e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let reader_self_id = Arc::clone(&self_id);
        let reader_connected = Arc::clone(&connected);
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let event = match SignalingEvent::from_json(&text) {
                            Ok(event) => event,
                            Err(e) => {
                                warn!("Dropping malformed signaling frame: {}", e);
                                continue;
                            }
                        };

                        if let SignalingEvent::Connected { self_id } = &event {
                            info!(self_id = %self_id, "Joined signaling room");
                            *reader_self_id.write() = Some(self_id.clone());
                            reader_connected.store(true, Ordering::Release);
                        }

                        if event_tx.send(event).await.is_err() {
                            debug!("Signaling event receiver dropped");
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        info!("Signaling server closed the connection");
                        break;
                    }
                    Err(e) => {
                        error!("Signaling WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            reader_connected.store(false, Ordering::Release);
        });

        let channel = Self {
            room_id: room_id.to_string(),
            outbound,
            self_id,
            connected,
            tasks: vec![writer, reader],
        };

        channel
            .push(ClientMessage::Join {
                room_id: room_id.to_string(),
            })
            .await?;

        Ok((channel, event_rx))
    }

    /// Room this channel joined
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Leave the room and stop the socket tasks
    pub async fn close(&self) -> Result<()> {
        if self.connected.swap(false, Ordering::AcqRel) {
            // Best effort; the socket may already be gone
            let _ = self.push(ClientMessage::Leave).await;
        }
        Ok(())
    }

    async fn push(&self, message: ClientMessage) -> Result<()> {
        let json = message.to_json()?;
        self.outbound
            .send(json)
            .await
            .map_err(|_| Error::ChannelClosed("signaling writer stopped".to_string()))
    }
}

#[async_trait]
impl SignalingChannel for WebSocketSignalingChannel {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn self_id(&self) -> Option<String> {
        self.self_id.read().clone()
    }

    async fn send(&self, target_id: Option<&str>, payload: SignalPayload) -> Result<()> {
        let sender_id = self.self_id().ok_or_else(|| {
            Error::SignalingError("Cannot signal before joining a room".to_string())
        })?;

        self.push(ClientMessage::Signal {
            envelope: SignalEnvelope {
                sender_id,
                target_id: target_id.map(str::to_string),
                room_id: self.room_id.clone(),
                payload,
            },
        })
        .await
    }
}

impl Drop for WebSocketSignalingChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
