use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Coarse phase of a connection, as far as idle tracking cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Waiting for (more of) a request
    Reading,
    /// A CGI child is producing the response; bounded by its own deadline
    AwaitingCgi,
    /// Sending the response
    Writing,
}

#[derive(Debug)]
pub struct ConnectionTimeout {
    pub state: ConnectionState,
    pub last_activity: Instant,
}

impl ConnectionTimeout {
    pub fn new(now: Instant) -> Self {
        ConnectionTimeout {
            state: ConnectionState::Reading,
            last_activity: now,
        }
    }

    pub fn update_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    pub fn set_state(&mut self, state: ConnectionState, now: Instant) {
        self.state = state;
        self.update_activity(now);
    }
}

/// Idle tracking for every open connection, keyed by poll token.
///
/// Connections waiting on CGI are exempt: the CGI deadline governs them.
#[derive(Debug)]
pub struct TimeoutManager {
    idle_timeout: Duration,
    connections: HashMap<u64, ConnectionTimeout>,
}

impl TimeoutManager {
    pub fn new(idle_timeout: Duration) -> Self {
        TimeoutManager {
            idle_timeout,
            connections: HashMap::new(),
        }
    }

    pub fn add_connection(&mut self, token: u64, now: Instant) {
        self.connections.insert(token, ConnectionTimeout::new(now));
    }

    pub fn remove_connection(&mut self, token: u64) {
        self.connections.remove(&token);
    }

    pub fn update_activity(&mut self, token: u64, now: Instant) {
        if let Some(conn) = self.connections.get_mut(&token) {
            conn.update_activity(now);
        }
    }

    pub fn set_connection_state(&mut self, token: u64, state: ConnectionState, now: Instant) {
        if let Some(conn) = self.connections.get_mut(&token) {
            conn.set_state(state, now);
        }
    }

    /// Tokens idle for longer than the timeout
    pub fn check_timeouts(&self, now: Instant) -> Vec<u64> {
        self.connections
            .iter()
            .filter(|(_, conn)| conn.state != ConnectionState::AwaitingCgi)
            .filter(|(_, conn)| now.saturating_duration_since(conn.last_activity) > self.idle_timeout)
            .map(|(&token, _)| token)
            .collect()
    }

    /// Time until the earliest connection could time out, capped at
    /// `ceiling` and never below 10ms
    pub fn next_timeout_check(&self, now: Instant, ceiling: Duration) -> Duration {
        let earliest = self
            .connections
            .values()
            .filter(|conn| conn.state != ConnectionState::AwaitingCgi)
            .map(|conn| {
                let elapsed = now.saturating_duration_since(conn.last_activity);
                self.idle_timeout.saturating_sub(elapsed)
            })
            .min()
            .unwrap_or(ceiling);

        earliest.clamp(Duration::from_millis(10), ceiling.max(Duration::from_millis(10)))
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: Duration = Duration::from_secs(10);

    #[test]
    fn test_timeout_manager_basic() {
        let mut manager = TimeoutManager::new(IDLE);
        manager.add_connection(1, Instant::now());
        assert_eq!(manager.connection_count(), 1);
        manager.remove_connection(1);
        assert_eq!(manager.connection_count(), 0);
    }

    #[test]
    fn test_timeout_detection() {
        let start = Instant::now();
        let mut manager = TimeoutManager::new(IDLE);
        manager.add_connection(1, start);

        assert!(manager.check_timeouts(start + Duration::from_secs(5)).is_empty());
        assert!(manager.check_timeouts(start + IDLE).is_empty());
        assert_eq!(manager.check_timeouts(start + Duration::from_secs(11)), vec![1]);
    }

    #[test]
    fn test_activity_update() {
        let start = Instant::now();
        let mut manager = TimeoutManager::new(IDLE);
        manager.add_connection(1, start);

        manager.update_activity(1, start + Duration::from_secs(8));
        assert!(manager.check_timeouts(start + Duration::from_secs(15)).is_empty());
        assert_eq!(manager.check_timeouts(start + Duration::from_secs(19)), vec![1]);
    }

    #[test]
    fn test_cgi_state_exempt() {
        let start = Instant::now();
        let mut manager = TimeoutManager::new(IDLE);
        manager.add_connection(1, start);
        manager.add_connection(2, start);
        manager.set_connection_state(2, ConnectionState::AwaitingCgi, start);

        let late = start + Duration::from_secs(60);
        assert_eq!(manager.check_timeouts(late), vec![1]);

        manager.set_connection_state(2, ConnectionState::Writing, late);
        assert!(manager.check_timeouts(late + Duration::from_secs(1)).iter().all(|&t| t == 1));
    }

    #[test]
    fn test_next_timeout_check() {
        let start = Instant::now();
        let ceiling = Duration::from_secs(1);
        let mut manager = TimeoutManager::new(Duration::from_millis(300));
        assert_eq!(manager.next_timeout_check(start, ceiling), ceiling);

        manager.add_connection(1, start);
        assert_eq!(manager.next_timeout_check(start, ceiling), Duration::from_millis(300));
        assert_eq!(
            manager.next_timeout_check(start + Duration::from_secs(2), ceiling),
            Duration::from_millis(10)
        );
    }
}
