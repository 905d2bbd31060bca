//! Per-connection WebSocket handler
//!
//! Each socket is one room member. Frames are [`ClientMessage`]s in and
//! [`SignalingEvent`]s out; signal envelopes are stamped with the sender's id
//! and room before being relayed.

use crate::rooms::{MemberSender, RoomRegistry};
use crate::{Result, ServerError};
use futures_util::{SinkExt, StreamExt};
use meshcall_webrtc::signaling::{ClientMessage, SignalEnvelope, SignalingEvent};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// State of one connection
struct Member {
    id: String,
    room_id: Option<String>,
    tx: MemberSender,
}

/// Handle a single WebSocket connection until it closes
pub async fn handle_connection(
    stream: TcpStream,
    rooms: Arc<RoomRegistry>,
    outbound_capacity: usize,
) -> Result<()> {
    let addr = stream.peer_addr()?;
    let ws_stream = accept_async(stream).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let (tx, mut rx) = mpsc::channel::<String>(outbound_capacity.max(1));

    // Task to forward queued frames to the socket
    let forward_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = ws_tx.send(Message::Text(frame)).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut member = Member {
        id: uuid::Uuid::new_v4().to_string(),
        room_id: None,
        tx,
    };
    info!(member_id = %member.id, "New WebSocket connection from: {}", addr);

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Err(e) = handle_message(&text, &rooms, &mut member).await {
                    warn!(member_id = %member.id, "Rejected frame: {}", e);
                    send_event(
                        &member.tx,
                        &SignalingEvent::Error {
                            message: e.to_string(),
                        },
                    )
                    .await;
                }
            }
            Ok(Message::Close(_)) => {
                info!(member_id = %member.id, "WebSocket connection closed by client: {}", addr);
                break;
            }
            Err(e) => {
                error!(member_id = %member.id, "WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    leave_room(&rooms, &mut member).await;
    forward_task.abort();
    Ok(())
}

async fn handle_message(text: &str, rooms: &RoomRegistry, member: &mut Member) -> Result<()> {
    let message = ClientMessage::from_json(text)
        .map_err(|e| ServerError::Protocol(e.to_string()))?;

    match message {
        ClientMessage::Join { room_id } => join_room(rooms, member, room_id).await,
        ClientMessage::Signal { envelope } => relay_signal(rooms, member, envelope).await,
        ClientMessage::Leave => {
            leave_room(rooms, member).await;
            Ok(())
        }
    }
}

async fn join_room(rooms: &RoomRegistry, member: &mut Member, room_id: String) -> Result<()> {
    if room_id.trim().is_empty() {
        return Err(ServerError::Protocol("room id must not be empty".to_string()));
    }
    if let Some(current) = &member.room_id {
        return Err(ServerError::AlreadyJoined(current.clone()));
    }

    let others = rooms.join(&room_id, &member.id, member.tx.clone()).await?;
    member.room_id = Some(room_id);

    // Connected goes out before anyone can start offering to us
    send_event(
        &member.tx,
        &SignalingEvent::Connected {
            self_id: member.id.clone(),
        },
    )
    .await;
    broadcast(
        &others,
        &SignalingEvent::PeerJoined {
            peer_id: member.id.clone(),
        },
    )
    .await;
    Ok(())
}

async fn relay_signal(
    rooms: &RoomRegistry,
    member: &Member,
    mut envelope: SignalEnvelope,
) -> Result<()> {
    let Some(room_id) = member.room_id.as_deref() else {
        return Err(ServerError::NotJoined);
    };

    envelope.sender_id = member.id.clone();
    envelope.room_id = room_id.to_string();

    match envelope.target_id.clone() {
        Some(target) => match rooms.member(room_id, &target).await {
            Some(tx) => send_event(&tx, &SignalingEvent::Signal { envelope }).await,
            None => debug!(
                member_id = %member.id,
                target = %target,
                "Dropping signal for a member not in the room"
            ),
        },
        None => {
            let others = rooms.others(room_id, &member.id).await;
            broadcast(&others, &SignalingEvent::Signal { envelope }).await;
        }
    }
    Ok(())
}

async fn leave_room(rooms: &RoomRegistry, member: &mut Member) {
    let Some(room_id) = member.room_id.take() else {
        return;
    };

    let remaining = rooms.leave(&room_id, &member.id).await;
    broadcast(
        &remaining,
        &SignalingEvent::PeerLeft {
            peer_id: member.id.clone(),
        },
    )
    .await;
}

async fn send_event(tx: &MemberSender, event: &SignalingEvent) {
    match event.to_json() {
        Ok(json) => {
            if tx.send(json).await.is_err() {
                debug!(event = event.event_name(), "Member queue closed");
            }
        }
        Err(e) => error!("Failed to serialize {}: {}", event.event_name(), e),
    }
}

async fn broadcast(targets: &[MemberSender], event: &SignalingEvent) {
    for tx in targets {
        send_event(tx, event).await;
    }
}
