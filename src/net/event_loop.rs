use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::server::Settings;
use crate::net::conn::{Connection, Context, Outcome};
use crate::net::control::StdinControl;
use crate::net::epoll::{Event, Events, Interest, Poller};
use crate::net::listener::ListenSocket;
use crate::net::stats::ServerStats;
use crate::net::timeout::{ConnectionState, TimeoutManager};
use crate::routing::{RoutingTable, VirtualHosts};
use crate::session::SessionStore;

const MAX_EVENTS: usize = 1024;
/// Longest wait, so maintenance runs even when nothing happens
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Wait while a CGI child has no pidfd and must be polled
const CGI_POLL_INTERVAL: Duration = Duration::from_millis(20);
/// Events handled before maintenance is forced under load
const MAINTENANCE_EVERY: usize = 256;

const STDIN_TOKEN: u64 = u64::MAX;
/// Set on the token of a client's CGI exit descriptor
const CGI_FLAG: u64 = 1 << 62;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Listener(usize),
    Client(u64),
    CgiExit(u64),
    Stdin,
}

#[derive(Debug)]
struct Client {
    conn: Connection,
    interest: Interest,
    cgi_watched: bool,
}

/// Single-threaded readiness loop over every listening socket, client
/// connection and running CGI child.
///
/// Tokens below the listener count name listening sockets; client tokens
/// follow and are never reused.
pub struct EventLoop {
    poller: Poller,
    listeners: Vec<(ListenSocket, Arc<VirtualHosts>)>,
    clients: HashMap<u64, Client>,
    next_token: u64,
    timeouts: TimeoutManager,
    settings: Settings,
    sessions: Option<SessionStore>,
    stats: ServerStats,
    shutdown: Arc<AtomicBool>,
    stdin: Option<StdinControl>,
    started: Instant,
    last_maintenance: Instant,
    events_since_maintenance: usize,
}

impl EventLoop {
    /// Bind every listening address of `table`. Failing to bind any of
    /// them fails the whole loop.
    pub fn new(table: RoutingTable, settings: Settings) -> io::Result<Self> {
        let poller = Poller::new()?;

        let mut listeners = Vec::new();
        for mut hosts in table.into_hosts() {
            let addr = hosts.addr();
            let socket = ListenSocket::bind(addr)
                .map_err(|e| io::Error::new(e.kind(), format!("cannot listen on {}: {}", addr, e)))?;
            hosts.set_addr(socket.local_addr());
            poller.register(socket.as_raw_fd(), Interest::Readable, listeners.len() as u64)?;

            let names: Vec<&str> = hosts.servers().iter().map(|s| s.display_name()).collect();
            info!(addr = %socket.local_addr(), servers = ?names, "listening");
            listeners.push((socket, Arc::new(hosts)));
        }

        let now = Instant::now();
        Ok(EventLoop {
            poller,
            next_token: listeners.len() as u64,
            listeners,
            clients: HashMap::new(),
            timeouts: TimeoutManager::new(settings.client_timeout),
            sessions: settings.sessions.then(|| SessionStore::new(settings.session_timeout)),
            settings,
            stats: ServerStats::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
            stdin: None,
            started: now,
            last_maintenance: now,
            events_since_maintenance: 0,
        })
    }

    /// Flag that stops the loop when set; also set by a stdin command
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Accept `quit`/`exit`/EOF on standard input. A stdin epoll refuses
    /// (a regular file or `/dev/null`) leaves the control disabled.
    pub fn enable_stdin_control(&mut self) {
        let control = StdinControl::new(libc::STDIN_FILENO);
        match self.poller.register(control.fd(), Interest::Readable, STDIN_TOKEN) {
            Ok(()) => {
                info!("type quit or exit to stop the server");
                self.stdin = Some(control);
            }
            Err(e) => warn!(error = %e, "stdin cannot be polled, stdin control disabled"),
        }
    }

    /// Addresses actually bound, in configuration order
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|(socket, _)| socket.local_addr()).collect()
    }

    pub fn stats(&self) -> ServerStats {
        self.stats
    }

    /// Run until the shutdown flag is raised. Only a failing epoll wait
    /// ends the loop with an error.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(MAX_EVENTS);
        info!(listeners = self.listeners.len(), "event loop running");

        while !self.shutdown.load(Ordering::SeqCst) {
            let timeout = self.next_wait(Instant::now());
            let nfds = self.poller.wait(&mut events, Some(timeout))?;

            for event in events.iter() {
                self.dispatch(event);
            }

            let now = Instant::now();
            self.poll_cgi(now);

            self.events_since_maintenance += nfds;
            if nfds == 0
                || self.events_since_maintenance >= MAINTENANCE_EVERY
                || now.saturating_duration_since(self.last_maintenance) >= POLL_INTERVAL
            {
                self.maintenance(now);
            }
        }

        info!(stats = %self.stats.report(self.started), "shutting down");
        let tokens: Vec<u64> = self.clients.keys().copied().collect();
        for token in tokens {
            self.close_connection(token);
        }
        Ok(())
    }

    fn source(&self, token: u64) -> Source {
        if token == STDIN_TOKEN {
            Source::Stdin
        } else if token & CGI_FLAG != 0 {
            Source::CgiExit(token & !CGI_FLAG)
        } else if token < self.listeners.len() as u64 {
            Source::Listener(token as usize)
        } else {
            Source::Client(token)
        }
    }

    fn dispatch(&mut self, event: Event) {
        match self.source(event.token()) {
            Source::Listener(index) => self.accept(index),
            Source::Client(token) => self.client_event(token, event),
            Source::CgiExit(token) => self.finish_cgi(token, Instant::now()),
            Source::Stdin => self.read_stdin(),
        }
    }

    /// One accept per ready listener per iteration
    fn accept(&mut self, index: usize) {
        let (socket, hosts) = &self.listeners[index];
        let (stream, peer) = match socket.accept() {
            Ok(Some(accepted)) => accepted,
            Ok(None) => return,
            Err(e) => {
                warn!(addr = %socket.local_addr(), error = %e, "accept failed");
                self.stats.errors += 1;
                return;
            }
        };

        let local = stream.local_addr().unwrap_or_else(|_| socket.local_addr());
        let token = self.next_token;
        self.next_token += 1;

        let conn = Connection::new(stream, peer, local, Arc::clone(hosts), self.settings.parse_limits());
        if let Err(e) = self.poller.register(conn.as_raw_fd(), Interest::Readable, token) {
            warn!(%peer, error = %e, "cannot register connection");
            self.stats.errors += 1;
            return;
        }

        let now = Instant::now();
        self.timeouts.add_connection(token, now);
        self.stats.connections_accepted += 1;
        debug!(%peer, %local, token, "accepted connection");
        self.clients.insert(
            token,
            Client {
                conn,
                interest: Interest::Readable,
                cgi_watched: false,
            },
        );
    }

    fn client_event(&mut self, token: u64, event: Event) {
        let now = Instant::now();
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        let mut ctx = Context {
            settings: &self.settings,
            sessions: self.sessions.as_mut(),
            stats: &mut self.stats,
        };

        let state = client.conn.state();
        let result = if event.is_error() {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "socket error reported"))
        } else if state == ConnectionState::Reading && (event.is_readable() || event.is_hangup()) {
            client.conn.on_readable(&mut ctx, now)
        } else if state == ConnectionState::Writing && event.is_writable() {
            client.conn.on_writable(&mut ctx, now)
        } else if event.is_hangup() {
            Ok(Outcome::Close)
        } else {
            Ok(Outcome::Open)
        };

        match result {
            Ok(Outcome::Open) => self.after_event(token, now),
            Ok(Outcome::Close) => self.close_connection(token),
            Err(e) => {
                debug!(token, error = %e, "connection failed");
                self.stats.errors += 1;
                self.close_connection(token);
            }
        }
    }

    /// Bring the epoll registration in line with the connection's state.
    /// A failed update costs only this connection.
    fn after_event(&mut self, token: u64, now: Instant) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        let state = client.conn.state();
        self.timeouts.set_connection_state(token, state, now);

        let wanted = match state {
            ConnectionState::Reading => Interest::Readable,
            ConnectionState::Writing => Interest::Writable,
            ConnectionState::AwaitingCgi => Interest::Idle,
        };
        let mut failure = None;
        if wanted != client.interest {
            match self.poller.modify(client.conn.as_raw_fd(), wanted, token) {
                Ok(()) => {
                    debug!(token, interest = ?wanted, "interest changed");
                    client.interest = wanted;
                }
                Err(e) => failure = Some(e),
            }
        }

        if state == ConnectionState::AwaitingCgi {
            if !client.cgi_watched {
                if let Some(fd) = client.conn.cgi_wait_fd() {
                    match self.poller.register(fd, Interest::Readable, token | CGI_FLAG) {
                        Ok(()) => client.cgi_watched = true,
                        Err(e) => debug!(token, error = %e, "CGI exit not pollable, falling back to polling"),
                    }
                }
            }
        } else {
            // The pidfd closed with its runner, which dropped the registration
            client.cgi_watched = false;
        }

        if let Some(e) = failure {
            warn!(token, error = %e, "cannot update connection interest");
            self.stats.errors += 1;
            self.close_connection(token);
        }
    }

    fn finish_cgi(&mut self, token: u64, now: Instant) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        let mut ctx = Context {
            settings: &self.settings,
            sessions: self.sessions.as_mut(),
            stats: &mut self.stats,
        };
        client.conn.poll_cgi(&mut ctx, now);
        self.after_event(token, now);
    }

    /// Children without a pidfd are polled every pass; watched ones only
    /// once their deadline is reached
    fn poll_cgi(&mut self, now: Instant) {
        let due: Vec<u64> = self
            .clients
            .iter()
            .filter(|(_, c)| c.conn.state() == ConnectionState::AwaitingCgi)
            .filter(|(_, c)| !c.cgi_watched || c.conn.cgi_deadline().map_or(false, |d| d <= now))
            .map(|(&token, _)| token)
            .collect();
        for token in due {
            self.finish_cgi(token, now);
        }
    }

    fn next_wait(&self, now: Instant) -> Duration {
        let mut wait = self.timeouts.next_timeout_check(now, POLL_INTERVAL);
        for client in self.clients.values() {
            if client.conn.state() != ConnectionState::AwaitingCgi {
                continue;
            }
            if !client.cgi_watched {
                wait = wait.min(CGI_POLL_INTERVAL);
            }
            if let Some(deadline) = client.conn.cgi_deadline() {
                wait = wait.min(deadline.saturating_duration_since(now));
            }
        }
        wait
    }

    fn maintenance(&mut self, now: Instant) {
        for token in self.timeouts.check_timeouts(now) {
            if let Some(client) = self.clients.get_mut(&token) {
                debug!(peer = %client.conn.peer(), token, "idle timeout");
                client.conn.time_out(&mut self.stats);
            }
            self.close_connection(token);
        }
        if let Some(store) = self.sessions.as_mut() {
            store.sweep_expired(now);
        }
        self.last_maintenance = now;
        self.events_since_maintenance = 0;
    }

    fn read_stdin(&mut self) {
        let Some(control) = self.stdin.as_mut() else {
            return;
        };
        match control.read() {
            Ok(false) => return,
            Ok(true) => {
                info!("shutdown requested on stdin");
                self.shutdown.store(true, Ordering::SeqCst);
            }
            Err(e) => warn!(error = %e, "reading stdin failed, stdin control disabled"),
        }
        let _ = self.poller.deregister(control.fd());
        self.stdin = None;
    }

    fn close_connection(&mut self, token: u64) {
        self.timeouts.remove_connection(token);
        if let Some(client) = self.clients.remove(&token) {
            if let Err(e) = self.poller.deregister(client.conn.as_raw_fd()) {
                debug!(token, error = %e, "deregister failed");
            }
            debug!(peer = %client.conn.peer(), token, "closed connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;

    fn start(config: &str) -> (SocketAddr, Arc<AtomicBool>, thread::JoinHandle<ServerStats>) {
        let config = ConfigParser::parse_str(config).unwrap();
        let mut event_loop = EventLoop::new(RoutingTable::build(&config), config.settings.clone()).unwrap();
        let addr = event_loop.local_addrs()[0];
        let shutdown = event_loop.shutdown_handle();
        let handle = thread::spawn(move || {
            event_loop.run().unwrap();
            event_loop.stats()
        });
        (addr, shutdown, handle)
    }

    #[test]
    fn test_source_classification() {
        let config = ConfigParser::parse_str("server { listen 127.0.0.1:0; } server { listen 127.0.0.2:0; }").unwrap();
        let event_loop = EventLoop::new(RoutingTable::build(&config), Settings::default()).unwrap();
        assert_eq!(event_loop.source(0), Source::Listener(0));
        assert_eq!(event_loop.source(1), Source::Listener(1));
        assert_eq!(event_loop.source(2), Source::Client(2));
        assert_eq!(event_loop.source(5 | CGI_FLAG), Source::CgiExit(5));
        assert_eq!(event_loop.source(STDIN_TOKEN), Source::Stdin);
    }

    #[test]
    fn test_bind_conflict_is_fatal() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = ConfigParser::parse_str(&format!("server {{ listen {}; }}", taken.local_addr().unwrap())).unwrap();
        assert!(EventLoop::new(RoutingTable::build(&config), Settings::default()).is_err());
    }

    #[test]
    fn test_serves_and_stops() {
        let (addr, shutdown, handle) = start("server { listen 127.0.0.1:0; root /nonexistent; }");

        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 404"));

        shutdown.store(true, Ordering::SeqCst);
        let stats = handle.join().unwrap();
        assert_eq!(stats.connections_accepted, 1);
        assert_eq!(stats.requests_served, 1);
        assert!(stats.bytes_sent as usize >= response.len());
    }
}
