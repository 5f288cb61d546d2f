use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

use oltalk_proto::types::OnlineUser;

/// Identifies one accepted connection for its whole lifetime.
pub type ConnId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoginError {
    #[error("session not found")]
    SessionNotFound,
    /// Single-session invariant: a second login for the same user is
    /// rejected, never stealing the prior session.
    #[error("user already online")]
    AlreadyOnline,
}

struct Session {
    sender: mpsc::Sender<Bytes>,
    logged_in: bool,
    user_id: String,
    nickname: String,
}

/// Tracks `conn_id -> session` and, for logged-in users, `user_id -> conn_id`.
///
/// Critical sections are trivial map operations and are never held across
/// await points; fanout clones the recipient's queue sender out of the lock.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<ConnId, Session>,
    user_conns: HashMap<String, ConnId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_connection(&self, conn_id: ConnId, sender: mpsc::Sender<Bytes>) {
        let mut inner = self.inner.lock();
        inner.sessions.insert(
            conn_id,
            Session {
                sender,
                logged_in: false,
                user_id: String::new(),
                nickname: String::new(),
            },
        );
    }

    /// Drop the connection's session. Returns true when the session was
    /// logged in, i.e. the online roster changed.
    pub fn remove_connection(&self, conn_id: ConnId) -> bool {
        let mut inner = self.inner.lock();
        match inner.sessions.remove(&conn_id) {
            Some(session) if session.logged_in => {
                inner.user_conns.remove(&session.user_id);
                true
            }
            _ => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    pub fn login(&self, conn_id: ConnId, user_id: &str, nickname: &str) -> Result<(), LoginError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match inner.user_conns.get(user_id) {
            Some(&existing) if existing != conn_id => return Err(LoginError::AlreadyOnline),
            _ => {}
        }
        let session = inner
            .sessions
            .get_mut(&conn_id)
            .ok_or(LoginError::SessionNotFound)?;
        session.logged_in = true;
        session.user_id = user_id.to_string();
        session.nickname = nickname.to_string();
        inner.user_conns.insert(user_id.to_string(), conn_id);
        Ok(())
    }

    pub fn logout(&self, conn_id: ConnId) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(session) = inner.sessions.get_mut(&conn_id) {
            if session.logged_in {
                let user_id = std::mem::take(&mut session.user_id);
                session.logged_in = false;
                session.nickname.clear();
                inner.user_conns.remove(&user_id);
            }
        }
    }

    pub fn is_logged_in(&self, conn_id: ConnId) -> bool {
        self.inner
            .lock()
            .sessions
            .get(&conn_id)
            .map(|s| s.logged_in)
            .unwrap_or(false)
    }

    /// The logged-in identity of a connection, as `(user_id, nickname)`.
    pub fn current_user(&self, conn_id: ConnId) -> Option<(String, String)> {
        let inner = self.inner.lock();
        inner
            .sessions
            .get(&conn_id)
            .filter(|s| s.logged_in)
            .map(|s| (s.user_id.clone(), s.nickname.clone()))
    }

    /// Snapshot of the online roster.
    pub fn online_users(&self) -> Vec<OnlineUser> {
        let inner = self.inner.lock();
        let mut users: Vec<OnlineUser> = inner
            .user_conns
            .values()
            .filter_map(|conn_id| inner.sessions.get(conn_id))
            .map(|s| OnlineUser {
                user_id: s.user_id.clone(),
                nickname: s.nickname.clone(),
            })
            .collect();
        users.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        users
    }

    /// Write-queue sender for a logged-in user, if online.
    pub fn sender_for_user(&self, user_id: &str) -> Option<mpsc::Sender<Bytes>> {
        let inner = self.inner.lock();
        let conn_id = inner.user_conns.get(user_id)?;
        inner.sessions.get(conn_id).map(|s| s.sender.clone())
    }

    /// Write-queue senders of every logged-in connection, optionally
    /// skipping one (the connection that triggered a roster broadcast).
    pub fn logged_in_senders(&self, except: Option<ConnId>) -> Vec<mpsc::Sender<Bytes>> {
        let inner = self.inner.lock();
        inner
            .sessions
            .iter()
            .filter(|(conn_id, session)| session.logged_in && Some(**conn_id) != except)
            .map(|(_, session)| session.sender.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> mpsc::Sender<Bytes> {
        let (tx, _rx) = mpsc::channel(4);
        tx
    }

    #[test]
    fn login_rejects_second_session_for_same_user() {
        let registry = SessionRegistry::new();
        registry.add_connection(1, sender());
        registry.add_connection(2, sender());

        registry.login(1, "alice", "Alice").unwrap();
        assert_eq!(
            registry.login(2, "alice", "Alice"),
            Err(LoginError::AlreadyOnline)
        );
        assert!(registry.is_logged_in(1));
        assert!(!registry.is_logged_in(2));
    }

    #[test]
    fn remove_connection_cleans_both_maps() {
        let registry = SessionRegistry::new();
        registry.add_connection(1, sender());
        registry.login(1, "alice", "Alice").unwrap();

        assert!(registry.remove_connection(1));
        assert!(registry.sender_for_user("alice").is_none());
        assert!(registry.online_users().is_empty());

        // The user can log in again from a new connection.
        registry.add_connection(2, sender());
        registry.login(2, "alice", "Alice").unwrap();
        assert_eq!(registry.online_users().len(), 1);
    }

    #[test]
    fn logout_keeps_connection_but_frees_user() {
        let registry = SessionRegistry::new();
        registry.add_connection(1, sender());
        registry.login(1, "alice", "Alice").unwrap();
        registry.logout(1);

        assert_eq!(registry.connection_count(), 1);
        assert!(!registry.is_logged_in(1));
        assert!(registry.sender_for_user("alice").is_none());

        registry.add_connection(2, sender());
        registry.login(2, "alice", "Alice").unwrap();
    }

    #[test]
    fn user_map_agrees_with_sessions() {
        // user_to_fd and fd_to_session must agree for every logged-in session.
        let registry = SessionRegistry::new();
        for conn_id in 1..=3u64 {
            registry.add_connection(conn_id, sender());
        }
        registry.login(1, "alice", "Alice").unwrap();
        registry.login(3, "bob", "Bob").unwrap();

        let users = registry.online_users();
        assert_eq!(users.len(), 2);
        assert_eq!(users[0].user_id, "alice");
        assert_eq!(users[1].user_id, "bob");
        assert_eq!(registry.logged_in_senders(None).len(), 2);
        assert_eq!(registry.logged_in_senders(Some(1)).len(), 1);
        assert_eq!(registry.current_user(2), None);
    }
}
