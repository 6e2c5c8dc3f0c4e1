//! The username → session registry.
//!
//! Two indexes live under one lock:
//! - `pending`: sessions still collecting sockets, keyed by username and
//!   bounded by capacity. A session leaves this map the moment its relay
//!   starts and is never re-entered.
//! - `routes`: client id → session, weakly held, so the datagram path and
//!   sharer rejoins can reach a session for as long as anything (the
//!   pending map or its pumps) keeps it alive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::Rejection;
use crate::handshake::Handshake;
use crate::session::{Session, client_id_for};

#[derive(Debug, Default)]
struct Inner {
    pending: HashMap<String, Arc<Session>>,
    routes: HashMap<u32, Weak<Session>>,
}

impl Inner {
    /// Live, non-discarded session routed under `client_id`.
    fn live_route(&mut self, client_id: u32) -> Option<Arc<Session>> {
        let session = self.routes.get(&client_id).and_then(Weak::upgrade);
        match session {
            Some(session) if !session.is_discarded() => Some(session),
            _ => {
                self.routes.remove(&client_id);
                None
            }
        }
    }
}

#[derive(Debug)]
pub struct Registry {
    capacity: usize,
    grace_period: Duration,
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new(capacity: usize, grace_period: Duration) -> Self {
        Self {
            capacity,
            grace_period,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get-or-create the session a sharer handshake belongs to.
    ///
    /// Resolution order: the pending session for the username, then a
    /// relaying session for the username (a rejoin), then a new session
    /// if capacity allows. The whole lookup is one critical section, so
    /// concurrent first handshakes for a username share one session.
    pub fn admit_sharer(&self, handshake: &Handshake) -> Result<Arc<Session>, Rejection> {
        let mut inner = self.lock();
        let username = handshake.username.as_str();

        if inner.pending.get(username).is_some_and(|s| s.is_discarded()) {
            inner.pending.remove(username);
        }
        if let Some(session) = inner.pending.get(username) {
            return if session.check_secret(&handshake.password) {
                Ok(session.clone())
            } else {
                Err(Rejection::InvalidPassword)
            };
        }

        let client_id = client_id_for(username);
        if let Some(live) = inner.live_route(client_id) {
            if live.username() != username {
                debug!(username, other = live.username(), client_id, "client id collision");
                return Err(Rejection::UsernameUnavailable);
            }
            if live.is_relaying() {
                return if live.check_secret(&handshake.password) {
                    Ok(live)
                } else {
                    Err(Rejection::InvalidPassword)
                };
            }
        }

        if inner.pending.len() >= self.capacity {
            return Err(Rejection::ServerFull);
        }

        let session = Arc::new(Session::new(
            username,
            &handshake.password,
            handshake.width,
            handshake.height,
            self.grace_period,
        ));
        inner.pending.insert(username.to_string(), session.clone());
        inner.routes.insert(client_id, Arc::downgrade(&session));
        info!(username, client_id, "session created");
        Ok(session)
    }

    /// The pending session for `username`, if any.
    pub fn get(&self, username: &str) -> Option<Arc<Session>> {
        self.lock().pending.get(username).cloned()
    }

    /// Drop `session` from the pending map. Only removes the exact
    /// instance, never a newer session under the same name.
    pub fn remove(&self, session: &Arc<Session>) -> bool {
        let mut inner = self.lock();
        match inner.pending.get(session.username()) {
            Some(current) if Arc::ptr_eq(current, session) => {
                inner.pending.remove(session.username());
                true
            }
            _ => false,
        }
    }

    /// Session reachable under a UDP client id.
    pub fn route(&self, client_id: u32) -> Option<Arc<Session>> {
        self.lock().live_route(client_id)
    }

    /// Number of sessions waiting for a viewer.
    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sharer(username: &str, password: &str) -> Handshake {
        Handshake::parse(&format!("{username},{password},sharer,1280,720,screen")).unwrap()
    }

    fn registry(capacity: usize) -> Registry {
        Registry::new(capacity, Duration::ZERO)
    }

    #[test]
    fn concurrent_first_handshakes_share_one_session() {
        let registry = Arc::new(registry(8));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.admit_sharer(&sharer("alice", "x")).unwrap())
            })
            .collect();

        let sessions: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn capacity_is_enforced_for_new_usernames() {
        let registry = registry(2);
        registry.admit_sharer(&sharer("a", "x")).unwrap();
        registry.admit_sharer(&sharer("b", "x")).unwrap();
        assert_eq!(
            registry.admit_sharer(&sharer("c", "x")).unwrap_err(),
            Rejection::ServerFull
        );
        // Existing usernames are still admitted at capacity.
        assert!(registry.admit_sharer(&sharer("a", "x")).is_ok());
    }

    #[test]
    fn wrong_password_cannot_join_pending_session() {
        let registry = registry(2);
        registry.admit_sharer(&sharer("alice", "x")).unwrap();
        assert_eq!(
            registry.admit_sharer(&sharer("alice", "nope")).unwrap_err(),
            Rejection::InvalidPassword
        );
    }

    #[test]
    fn remove_only_drops_the_same_instance() {
        let registry = registry(2);
        let first = registry.admit_sharer(&sharer("alice", "x")).unwrap();
        assert!(registry.remove(&first));
        assert!(registry.get("alice").is_none());

        let second = registry.admit_sharer(&sharer("alice", "x")).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!registry.remove(&first));
        assert!(registry.get("alice").is_some());
    }

    #[test]
    fn routes_follow_session_lifetime() {
        let registry = registry(2);
        let session = registry.admit_sharer(&sharer("alice", "x")).unwrap();
        let id = client_id_for("alice");
        assert!(registry.route(id).is_some());

        // Out of the pending map but still alive: still routable.
        registry.remove(&session);
        assert!(registry.route(id).is_some());

        drop(session);
        assert!(registry.route(id).is_none());
    }

    #[test]
    fn discarded_sessions_are_not_routed() {
        let registry = registry(2);
        let session = registry.admit_sharer(&sharer("alice", "x")).unwrap();
        session.abort();
        assert!(registry.route(session.client_id()).is_none());
    }
}
