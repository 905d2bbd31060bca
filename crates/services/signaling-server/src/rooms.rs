//! In-memory room membership

use crate::{Result, ServerError};
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};

/// Outbound frame queue of one connected member
pub type MemberSender = mpsc::Sender<String>;

/// Rooms keyed by id, each mapping member id to its outbound queue
///
/// Nothing is persisted; a room exists while it has members.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, HashMap<String, MemberSender>>>,
    max_room_size: usize,
}

impl RoomRegistry {
    pub fn new(max_room_size: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            max_room_size,
        }
    }

    /// Add `member_id` to `room_id`, creating the room on first join
    ///
    /// Returns the queues of the members already present.
    pub async fn join(
        &self,
        room_id: &str,
        member_id: &str,
        sender: MemberSender,
    ) -> Result<Vec<MemberSender>> {
        let mut rooms = self.rooms.write().await;
        if rooms
            .get(room_id)
            .is_some_and(|room| room.len() >= self.max_room_size)
        {
            return Err(ServerError::RoomFull(room_id.to_string()));
        }
        let room = rooms.entry(room_id.to_string()).or_default();

        let others = room.values().cloned().collect();
        room.insert(member_id.to_string(), sender);
        info!(room_id = %room_id, member_id = %member_id, members = room.len(), "Member joined");
        Ok(others)
    }

    /// Remove `member_id` from `room_id`, dropping the room once empty
    ///
    /// Returns the queues of the members that remain.
    pub async fn leave(&self, room_id: &str, member_id: &str) -> Vec<MemberSender> {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get_mut(room_id) else {
            return Vec::new();
        };

        if room.remove(member_id).is_some() {
            info!(room_id = %room_id, member_id = %member_id, members = room.len(), "Member left");
        }

        if room.is_empty() {
            rooms.remove(room_id);
            debug!(room_id = %room_id, "Room closed");
            return Vec::new();
        }
        room.values().cloned().collect()
    }

    /// Queue of `member_id` if it is in `room_id`
    pub async fn member(&self, room_id: &str, member_id: &str) -> Option<MemberSender> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .and_then(|room| room.get(member_id))
            .cloned()
    }

    /// Queues of every member of `room_id` except `exclude`
    pub async fn others(&self, room_id: &str, exclude: &str) -> Vec<MemberSender> {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(|room| {
                room.iter()
                    .filter(|(id, _)| id.as_str() != exclude)
                    .map(|(_, sender)| sender.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Member ids of `room_id`, sorted
    pub async fn members(&self, room_id: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .rooms
            .read()
            .await
            .get(room_id)
            .map(|room| room.keys().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}
