//! Call signaling relay.
//!
//! Stateless forwarder for call-setup traffic between two presence-resolved
//! identities. Each payload is augmented with the sender's identity and
//! forwarded to the target's most-recently-registered connection; an offline
//! target drops the message silently. Fire-and-forget: the sender gets no
//! delivery confirmation for any of the four kinds.

use std::sync::Arc;

use tracing::debug;

use crate::events::{ServerEvent, UserId};
use crate::presence::PresenceRegistry;
use crate::rooms::RoomRouter;

pub struct CallRelay {
    presence: Arc<PresenceRegistry>,
    rooms: Arc<RoomRouter>,
}

impl CallRelay {
    pub fn new(presence: Arc<PresenceRegistry>, rooms: Arc<RoomRouter>) -> Self {
        Self { presence, rooms }
    }

    pub async fn call_initiate(
        &self,
        sender: &UserId,
        target: &UserId,
        signal: serde_json::Value,
        caller_name: String,
        call_type: String,
    ) {
        self.forward(sender, target, ServerEvent::CallIncoming {
            signal,
            from: sender.clone(),
            name: caller_name,
            call_type,
        })
        .await;
    }

    pub async fn call_accept(&self, sender: &UserId, target: &UserId, signal: serde_json::Value) {
        self.forward(sender, target, ServerEvent::CallAccepted {
            signal,
            from: sender.clone(),
        })
        .await;
    }

    pub async fn signal(&self, sender: &UserId, target: &UserId, signal: serde_json::Value) {
        self.forward(sender, target, ServerEvent::Signal {
            signal,
            from: sender.clone(),
        })
        .await;
    }

    pub async fn call_end(&self, sender: &UserId, target: &UserId) {
        self.forward(sender, target, ServerEvent::CallEnded { from: sender.clone() })
            .await;
    }

    /// Signaling goes to exactly one connection per identity. Additional
    /// concurrent sessions of the target do not see the call.
    async fn forward(&self, sender: &UserId, target: &UserId, event: ServerEvent) {
        let Some(conn) = self.presence.latest(target) else {
            debug!("Dropping signaling frame {} → {}: target offline", sender, target);
            return;
        };
        self.rooms.send_to_conn(conn, &event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn setup() -> (CallRelay, Arc<PresenceRegistry>, Arc<RoomRouter>) {
        let presence = Arc::new(PresenceRegistry::new());
        let rooms = Arc::new(RoomRouter::new());
        let relay = CallRelay::new(presence.clone(), rooms.clone());
        (relay, presence, rooms)
    }

    #[tokio::test]
    async fn initiate_reaches_the_latest_connection_only() {
        let (relay, presence, rooms) = setup();
        let target = "bob".to_string();

        let (old_conn, new_conn) = (Uuid::new_v4(), Uuid::new_v4());
        let (old_tx, mut old_rx) = mpsc::channel(4);
        let (new_tx, mut new_rx) = mpsc::channel(4);
        rooms.register_connection(old_conn, old_tx);
        rooms.register_connection(new_conn, new_tx);
        presence.register(&target, old_conn);
        presence.register(&target, new_conn);

        relay
            .call_initiate(
                &"alice".to_string(),
                &target,
                serde_json::json!({"sdp": "offer"}),
                "Alice".to_string(),
                "video".to_string(),
            )
            .await;

        assert!(old_rx.try_recv().is_err());
        let frame = new_rx.try_recv().expect("latest connection should get the call");
        let value: serde_json::Value = rmp_serde::from_slice(&frame).unwrap();
        assert_eq!(value["event"], "call-incoming");
        assert_eq!(value["data"]["from"], "alice");
        assert_eq!(value["data"]["name"], "Alice");
        assert_eq!(value["data"]["call_type"], "video");
    }

    #[tokio::test]
    async fn offline_target_is_a_silent_no_op() {
        let (relay, _presence, rooms) = setup();

        let sender_conn = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(4);
        rooms.register_connection(sender_conn, tx);

        relay.call_initiate(
            &"alice".to_string(),
            &"nobody".to_string(),
            serde_json::json!({}),
            "Alice".to_string(),
            "audio".to_string(),
        )
        .await;
        relay.call_end(&"alice".to_string(), &"nobody".to_string()).await;

        // No error frame, no echo: the sender hears nothing at all.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn accept_and_ice_frames_carry_the_sender() {
        let (relay, presence, rooms) = setup();
        let caller = "alice".to_string();

        let conn = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(4);
        rooms.register_connection(conn, tx);
        presence.register(&caller, conn);

        relay.call_accept(&"bob".to_string(), &caller, serde_json::json!({"sdp": "answer"})).await;
        relay.signal(&"bob".to_string(), &caller, serde_json::json!({"candidate": "c0"})).await;
        relay.call_end(&"bob".to_string(), &caller).await;

        let events: Vec<serde_json::Value> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|f| rmp_serde::from_slice(&f).unwrap())
            .collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0]["event"], "call-accepted");
        assert_eq!(events[1]["event"], "signal");
        assert_eq!(events[2]["event"], "call-ended");
        assert!(events.iter().all(|e| e["data"]["from"] == "bob"));
    }
}
