//! Presence registry: user identity ↔ live connections.
//!
//! One identity may hold several simultaneous connections (multiple open
//! sessions). A connection belongs to at most one identity at a time; the
//! registry enforces that by moving a connection that re-registers under a
//! different identity.

use dashmap::DashMap;

use crate::events::{ConnId, UserId};

pub struct PresenceRegistry {
    /// user → connections in registration order; the last entry is the
    /// most recently registered one.
    sessions: DashMap<UserId, Vec<ConnId>>,
    /// Reverse index for unregister-by-connection.
    identities: DashMap<ConnId, UserId>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            identities: DashMap::new(),
        }
    }

    /// Associate `conn` with `user`. Idempotent; an existing association
    /// under another identity is dropped first.
    pub fn register(&self, user: &UserId, conn: ConnId) {
        if let Some(previous) = self.identities.insert(conn, user.clone()) {
            if &previous != user {
                self.remove_session(&previous, conn);
            }
        }

        let mut conns = self.sessions.entry(user.clone()).or_default();
        if !conns.contains(&conn) {
            conns.push(conn);
        }
    }

    /// Drop `conn` from whatever identity it was attached to. Returns the
    /// identity that went offline because of this call, if any.
    pub fn unregister(&self, conn: ConnId) -> Option<UserId> {
        let (_, user) = self.identities.remove(&conn)?;
        let emptied = self.remove_session(&user, conn);
        emptied.then_some(user)
    }

    /// All connections currently registered for `user`; empty when offline.
    pub fn resolve(&self, user: &UserId) -> Vec<ConnId> {
        self.sessions
            .get(user)
            .map(|conns| conns.clone())
            .unwrap_or_default()
    }

    /// The most-recently-registered connection for `user`. This is the one
    /// deterministic pick used for call signaling; additional concurrent
    /// sessions do not receive signaling traffic.
    pub fn latest(&self, user: &UserId) -> Option<ConnId> {
        self.sessions.get(user).and_then(|conns| conns.last().copied())
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        self.sessions.contains_key(user)
    }

    /// Sorted list of online identities, as broadcast after every presence
    /// change.
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        users.sort();
        users
    }

    /// Remove one connection from a user's session list, pruning the entry
    /// when it becomes empty. Returns true when the identity went offline.
    fn remove_session(&self, user: &UserId, conn: ConnId) -> bool {
        let mut emptied = false;
        if let Some(mut conns) = self.sessions.get_mut(user) {
            conns.retain(|c| *c != conn);
            emptied = conns.is_empty();
        }
        if emptied {
            self.sessions.remove_if(user, |_, conns| conns.is_empty());
        }
        emptied
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn resolve_tracks_registered_connections() {
        let registry = PresenceRegistry::new();
        let user = "alice".to_string();
        let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());

        registry.register(&user, c1);
        registry.register(&user, c2);
        registry.register(&user, c2); // idempotent

        assert_eq!(registry.resolve(&user), vec![c1, c2]);
        assert!(registry.is_online(&user));
        assert_eq!(registry.latest(&user), Some(c2));
    }

    #[test]
    fn offline_once_all_connections_gone() {
        let registry = PresenceRegistry::new();
        let user = "alice".to_string();
        let (c1, c2) = (Uuid::new_v4(), Uuid::new_v4());

        registry.register(&user, c1);
        registry.register(&user, c2);

        assert_eq!(registry.unregister(c1), None);
        assert!(registry.is_online(&user));

        assert_eq!(registry.unregister(c2), Some(user.clone()));
        assert!(!registry.is_online(&user));
        assert!(registry.resolve(&user).is_empty());
        assert!(registry.online_users().is_empty());
    }

    #[test]
    fn connection_belongs_to_one_identity() {
        let registry = PresenceRegistry::new();
        let conn = Uuid::new_v4();

        registry.register(&"alice".to_string(), conn);
        registry.register(&"bob".to_string(), conn);

        assert!(!registry.is_online(&"alice".to_string()));
        assert_eq!(registry.resolve(&"bob".to_string()), vec![conn]);
    }

    #[test]
    fn unregister_unknown_connection_is_a_noop() {
        let registry = PresenceRegistry::new();
        assert_eq!(registry.unregister(Uuid::new_v4()), None);
    }
}
