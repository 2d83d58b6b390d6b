//! Room membership and event fan-out.
//!
//! A room is nothing but its current membership; an empty room does not
//! exist. The router owns the outbound sender of every live connection and
//! is the only component that writes to sockets. Events are serialized once
//! and the same bytes delivered to every recipient, in broadcast order per
//! room (each connection's mpsc channel is FIFO).

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::events::{ConnId, RoomId, ServerEvent, UserId};
use crate::presence::PresenceRegistry;

/// The only broadcast surface the mutation coordinator sees.
#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn broadcast_to_room(&self, room: &RoomId, event: &ServerEvent, exclude: Option<ConnId>);
    /// Deliver to every connection of an identity via its personal room.
    async fn broadcast_to_user(&self, user: &UserId, event: &ServerEvent);
}

pub struct RoomRouter {
    /// conn → outbound channel to its socket task.
    connections: DashMap<ConnId, mpsc::Sender<Vec<u8>>>,
    rooms: DashMap<RoomId, HashSet<ConnId>>,
    /// Reverse index so disconnect cleanup does not scan every room.
    memberships: DashMap<ConnId, HashSet<RoomId>>,
}

impl RoomRouter {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            memberships: DashMap::new(),
        }
    }

    pub fn register_connection(&self, conn: ConnId, tx: mpsc::Sender<Vec<u8>>) {
        self.connections.insert(conn, tx);
    }

    /// Disconnect cleanup: leave every room, then forget the sender.
    pub fn unregister_connection(&self, conn: ConnId) {
        self.leave_all(conn);
        self.connections.remove(&conn);
    }

    pub fn join(&self, conn: ConnId, room: RoomId) {
        self.rooms.entry(room.clone()).or_default().insert(conn);
        self.memberships.entry(conn).or_default().insert(room);
    }

    pub fn leave(&self, conn: ConnId, room: &RoomId) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(&conn);
            if members.is_empty() {
                drop(members);
                self.rooms.remove_if(room, |_, m| m.is_empty());
            }
        }
        if let Some(mut rooms) = self.memberships.get_mut(&conn) {
            rooms.remove(room);
        }
    }

    pub fn leave_all(&self, conn: ConnId) {
        let rooms = match self.memberships.remove(&conn) {
            Some((_, rooms)) => rooms,
            None => return,
        };
        for room in rooms {
            if let Some(mut members) = self.rooms.get_mut(&room) {
                members.remove(&conn);
                if members.is_empty() {
                    drop(members);
                    self.rooms.remove_if(&room, |_, m| m.is_empty());
                }
            }
        }
    }

    /// Remove every connection of an identity from a room; used when a user
    /// is removed from a group.
    pub fn force_leave(&self, presence: &PresenceRegistry, user: &UserId, room: &RoomId) {
        for conn in presence.resolve(user) {
            self.leave(conn, room);
        }
    }

    /// Empty a room entirely; used when a group is deleted.
    pub fn clear_room(&self, room: &RoomId) {
        if let Some((_, members)) = self.rooms.remove(room) {
            for conn in members {
                if let Some(mut rooms) = self.memberships.get_mut(&conn) {
                    rooms.remove(room);
                }
            }
        }
    }

    pub fn is_member(&self, conn: ConnId, room: &RoomId) -> bool {
        self.rooms
            .get(room)
            .map(|members| members.contains(&conn))
            .unwrap_or(false)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub async fn broadcast(&self, room: &RoomId, event: &ServerEvent, exclude: Option<ConnId>) {
        let members: Vec<ConnId> = match self.rooms.get(room) {
            Some(members) => members.iter().copied().collect(),
            None => return,
        };
        let frame = event.encode();
        for conn in members {
            if Some(conn) == exclude {
                continue;
            }
            self.deliver(conn, frame.clone()).await;
        }
    }

    /// Deliver to every live connection regardless of room membership; used
    /// for the online-identities list.
    pub async fn broadcast_all(&self, event: &ServerEvent) {
        let frame = event.encode();
        let conns: Vec<ConnId> = self.connections.iter().map(|e| *e.key()).collect();
        for conn in conns {
            self.deliver(conn, frame.clone()).await;
        }
    }

    pub async fn send_to_conn(&self, conn: ConnId, event: &ServerEvent) {
        self.deliver(conn, event.encode()).await;
    }

    async fn deliver(&self, conn: ConnId, frame: Vec<u8>) {
        // A send failure means the socket task is tearing down; disconnect
        // cleanup removes the entry.
        let tx = match self.connections.get(&conn) {
            Some(entry) => entry.value().clone(),
            None => return,
        };
        let _ = tx.send(frame).await;
    }
}

impl Default for RoomRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broadcaster for RoomRouter {
    async fn broadcast_to_room(&self, room: &RoomId, event: &ServerEvent, exclude: Option<ConnId>) {
        self.broadcast(room, event, exclude).await;
    }

    async fn broadcast_to_user(&self, user: &UserId, event: &ServerEvent) {
        self.broadcast(&RoomId::user(user), event, None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn attach(router: &RoomRouter) -> (ConnId, mpsc::Receiver<Vec<u8>>) {
        let conn = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(16);
        router.register_connection(conn, tx);
        (conn, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<serde_json::Value> {
        let mut events = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            events.push(rmp_serde::from_slice(&frame).unwrap());
        }
        events
    }

    #[tokio::test]
    async fn broadcast_reaches_members_only() {
        let router = RoomRouter::new();
        let room = RoomId::chat("c1");
        let (a, mut rx_a) = attach(&router);
        let (b, mut rx_b) = attach(&router);
        let (_c, mut rx_c) = attach(&router);

        router.join(a, room.clone());
        router.join(b, room.clone());

        let event = ServerEvent::Typing { room_id: room.to_string() };
        router.broadcast(&room, &event, None).await;

        assert_eq!(drain(&mut rx_a).len(), 1);
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert!(drain(&mut rx_c).is_empty());
    }

    #[tokio::test]
    async fn broadcast_can_exclude_the_initiator() {
        let router = RoomRouter::new();
        let room = RoomId::chat("c1");
        let (a, mut rx_a) = attach(&router);
        let (b, mut rx_b) = attach(&router);
        router.join(a, room.clone());
        router.join(b, room.clone());

        let event = ServerEvent::Typing { room_id: room.to_string() };
        router.broadcast(&room, &event, Some(a)).await;

        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[tokio::test]
    async fn leave_all_removes_every_membership() {
        let router = RoomRouter::new();
        let (a, mut rx_a) = attach(&router);
        let r1 = RoomId::chat("c1");
        let r2 = RoomId::chat("c2");
        router.join(a, r1.clone());
        router.join(a, r2.clone());

        router.leave_all(a);

        router.broadcast(&r1, &ServerEvent::Typing { room_id: r1.to_string() }, None).await;
        router.broadcast(&r2, &ServerEvent::Typing { room_id: r2.to_string() }, None).await;
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(router.room_count(), 0);
    }

    #[tokio::test]
    async fn force_leave_covers_every_session_of_a_user() {
        let router = RoomRouter::new();
        let presence = PresenceRegistry::new();
        let user = "alice".to_string();
        let room = RoomId::chat("c1");

        let (c1, mut rx1) = attach(&router);
        let (c2, mut rx2) = attach(&router);
        presence.register(&user, c1);
        presence.register(&user, c2);
        router.join(c1, room.clone());
        router.join(c2, room.clone());

        router.force_leave(&presence, &user, &room);

        router.broadcast(&room, &ServerEvent::Typing { room_id: room.to_string() }, None).await;
        assert!(drain(&mut rx1).is_empty());
        assert!(drain(&mut rx2).is_empty());
    }

    #[tokio::test]
    async fn broadcast_to_user_goes_through_the_personal_room() {
        let router = RoomRouter::new();
        let user = "alice".to_string();
        let (conn, mut rx) = attach(&router);
        router.join(conn, RoomId::user(&user));

        let event = ServerEvent::CallEnded { from: "bob".into() };
        Broadcaster::broadcast_to_user(&router, &user, &event).await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event"], "call-ended");
    }
}
