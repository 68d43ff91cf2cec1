use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use super::session::{generate_id, Session};

/// In-memory sessions keyed by id.
///
/// Owned by the event loop; the loop is single-threaded, so no locking.
#[derive(Debug)]
pub struct SessionStore {
    sessions: HashMap<String, Session>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        SessionStore {
            sessions: HashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Live session for `id`, its expiry refreshed
    pub fn get(&mut self, id: &str, now: Instant) -> Option<&mut Session> {
        let ttl = self.ttl;
        let session = self.sessions.get_mut(id).filter(|s| !s.is_expired(now))?;
        session.touch(now, ttl);
        Some(session)
    }

    /// Live session for `id`, or a new one. The flag is true when the
    /// session was created by this call.
    pub fn get_or_create(&mut self, id: Option<&str>, now: Instant) -> (&mut Session, bool) {
        let live = id.filter(|id| self.sessions.get(*id).map_or(false, |s| !s.is_expired(now)));
        let (key, created) = match live {
            Some(id) => (id.to_string(), false),
            None => (self.fresh_id(), true),
        };

        let ttl = self.ttl;
        let session = self
            .sessions
            .entry(key.clone())
            .or_insert_with(|| Session::new(key, now, ttl));
        session.touch(now, ttl);
        (session, created)
    }

    /// Drop every session that has lapsed, returning how many went
    pub fn sweep_expired(&mut self, now: Instant) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_expired(now));
        let removed = before - self.sessions.len();
        if removed > 0 {
            debug!(removed, remaining = self.sessions.len(), "expired sessions swept");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn fresh_id(&self) -> String {
        loop {
            let id = generate_id();
            if !self.sessions.contains_key(&id) {
                return id;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_reuses_live_session() {
        let mut store = SessionStore::new(Duration::from_secs(60));
        let now = Instant::now();

        let (session, created) = store.get_or_create(None, now);
        assert!(created);
        session.set_cookie("user", "alice");
        let id = session.id.clone();

        let (session, created) = store.get_or_create(Some(&id), now + Duration::from_secs(30));
        assert!(!created);
        assert_eq!(session.cookie("user"), Some("alice"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_unknown_id_gets_fresh_session() {
        let mut store = SessionStore::new(Duration::from_secs(60));
        let (session, created) = store.get_or_create(Some("forged"), Instant::now());
        assert!(created);
        assert_ne!(session.id, "forged");
    }

    #[test]
    fn test_expired_session_not_returned() {
        let mut store = SessionStore::new(Duration::from_secs(10));
        let now = Instant::now();
        let id = store.get_or_create(None, now).0.id.clone();

        assert!(store.get(&id, now + Duration::from_secs(5)).is_some());
        // Expiry slid to now + 15
        assert!(store.get(&id, now + Duration::from_secs(14)).is_some());
        assert!(store.get(&id, now + Duration::from_secs(100)).is_none());
    }

    #[test]
    fn test_sweep_expired() {
        let mut store = SessionStore::new(Duration::from_secs(10));
        let now = Instant::now();
        store.get_or_create(None, now);
        let keep = store.get_or_create(None, now + Duration::from_secs(8)).0.id.clone();

        assert_eq!(store.sweep_expired(now + Duration::from_secs(12)), 1);
        assert_eq!(store.len(), 1);
        assert!(store.get(&keep, now + Duration::from_secs(12)).is_some());
        assert_eq!(store.sweep_expired(now + Duration::from_secs(60)), 1);
        assert!(store.is_empty());
    }
}
