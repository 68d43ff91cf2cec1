use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::cgi::{CgiError, CgiLimits, CgiRunner, ServerInfo};
use crate::config::server::Settings;
use crate::errors::error_response;
use crate::http::parse::{ParseLimits, Progress, RequestParser};
use crate::http::request::Request;
use crate::http::response::Response;
use crate::http::status;
use crate::net::stats::ServerStats;
use crate::net::timeout::ConnectionState;
use crate::routing::{handle, HandlerResult, VirtualHosts};
use crate::session::{Cookie, CookieJar, SessionStore, SESSION_COOKIE};

const READ_CHUNK: usize = 16 * 1024;

/// Loop-owned state a connection may touch while handling an event
pub struct Context<'a> {
    pub settings: &'a Settings,
    pub sessions: Option<&'a mut SessionStore>,
    pub stats: &'a mut ServerStats,
}

/// What the event loop should do with the connection afterwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Open,
    Close,
}

/// A request that has left the parser, kept until its response is queued
#[derive(Debug)]
struct Exchange {
    method: &'static str,
    uri: String,
    host: Option<String>,
    path: String,
    keep_alive: bool,
    session_id: Option<String>,
    set_cookie: Option<String>,
    started: Instant,
}

impl Exchange {
    fn new(request: &Request, started: Instant) -> Self {
        Exchange {
            method: request.method.map(|m| m.as_str()).unwrap_or("-"),
            uri: if request.uri.is_empty() { "-".to_string() } else { request.uri.clone() },
            host: request.host(),
            path: request.path.clone(),
            keep_alive: !request.closes_connection(),
            session_id: None,
            set_cookie: None,
            started,
        }
    }
}

#[derive(Debug)]
struct PendingCgi {
    runner: CgiRunner,
    exchange: Exchange,
}

/// One accepted client.
///
/// Holds at most one request in flight: bytes that arrive while a response
/// is pending stay in the parser buffer and are parsed once the response
/// has been written.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    hosts: Arc<VirtualHosts>,
    parser: RequestParser,
    state: ConnectionState,
    request_started: Option<Instant>,
    write_buffer: Vec<u8>,
    write_pos: usize,
    keep_alive: bool,
    cgi: Option<PendingCgi>,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, local: SocketAddr, hosts: Arc<VirtualHosts>, limits: ParseLimits) -> Self {
        Connection {
            stream,
            peer,
            local,
            hosts,
            parser: RequestParser::new(limits),
            state: ConnectionState::Reading,
            request_started: None,
            write_buffer: Vec::new(),
            write_pos: 0,
            keep_alive: true,
            cgi: None,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Descriptor signalling that the running CGI child exited
    pub fn cgi_wait_fd(&self) -> Option<RawFd> {
        self.cgi.as_ref().and_then(|c| c.runner.wait_fd())
    }

    pub fn cgi_deadline(&self) -> Option<Instant> {
        self.cgi.as_ref().map(|c| c.runner.deadline())
    }

    /// Read once from the socket and feed the parser.
    pub fn on_readable(&mut self, ctx: &mut Context<'_>, now: Instant) -> io::Result<Outcome> {
        if self.state != ConnectionState::Reading {
            return Ok(Outcome::Open);
        }

        let mut buffer = [0u8; READ_CHUNK];
        let n = match self.stream.read(&mut buffer) {
            Ok(0) => {
                debug!(peer = %self.peer, "peer closed connection");
                return Ok(Outcome::Close);
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                return Ok(Outcome::Open);
            }
            Err(e) => return Err(e),
        };

        ctx.stats.bytes_received += n as u64;
        self.request_started.get_or_insert(now);
        self.ingest(&buffer[..n], ctx, now);
        Ok(Outcome::Open)
    }

    /// Send as much of the queued response as the socket takes. Once it is
    /// all out the connection either closes or goes back to reading.
    pub fn on_writable(&mut self, ctx: &mut Context<'_>, now: Instant) -> io::Result<Outcome> {
        if self.state != ConnectionState::Writing {
            return Ok(Outcome::Open);
        }

        while self.write_pos < self.write_buffer.len() {
            match self.stream.write(&self.write_buffer[self.write_pos..]) {
                Ok(0) => return Err(io::Error::new(ErrorKind::WriteZero, "peer stopped accepting data")),
                Ok(n) => {
                    self.write_pos += n;
                    ctx.stats.bytes_sent += n as u64;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(Outcome::Open),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        if !self.keep_alive {
            return Ok(Outcome::Close);
        }

        self.write_buffer.clear();
        self.write_pos = 0;
        self.state = ConnectionState::Reading;
        debug!(peer = %self.peer, "keep-alive, awaiting next request");

        if self.parser.has_buffered() {
            self.request_started = Some(now);
            self.ingest(&[], ctx, now);
        }
        Ok(Outcome::Open)
    }

    /// Check on a running CGI child; queue its response once it is done
    /// or has run out of time.
    pub fn poll_cgi(&mut self, ctx: &mut Context<'_>, now: Instant) {
        let Some(pending) = self.cgi.as_mut() else {
            return;
        };
        let result = match pending.runner.poll(now) {
            Ok(None) => return,
            Ok(Some(output)) => Ok(output),
            Err(e) => Err(e),
        };
        let Some(PendingCgi { runner, exchange }) = self.cgi.take() else {
            return;
        };
        drop(runner);

        let response = match result {
            Ok(output) => {
                if let (Some(store), Some(id)) = (ctx.sessions.as_deref_mut(), exchange.session_id.as_deref()) {
                    if let Some(session) = store.get(id, now) {
                        for cookie in output.set_cookies().filter_map(Cookie::parse_set_cookie) {
                            session.set_cookie(&cookie.name, &cookie.value);
                        }
                    }
                }
                output.into_response()
            }
            Err(e) => {
                match e {
                    CgiError::Timeout(_) => ctx.stats.timeouts += 1,
                    _ => ctx.stats.errors += 1,
                }
                warn!(peer = %self.peer, uri = %exchange.uri, error = %e, "CGI failed");
                let hosts = Arc::clone(&self.hosts);
                let route = hosts.resolve(exchange.host.as_deref(), &exchange.path);
                error_response(e.status(), route.policy)
            }
        };
        self.respond(response, exchange, ctx.stats, now);
    }

    /// Best-effort `408` before an idle connection is dropped. Nothing is
    /// sent once a response is under way.
    pub fn time_out(&mut self, stats: &mut ServerStats) {
        stats.timeouts += 1;
        if self.state != ConnectionState::Reading {
            return;
        }

        let request = self.parser.request();
        let route = self.hosts.resolve(request.host().as_deref(), &request.path);
        let mut response = error_response(status::REQUEST_TIMEOUT, route.policy);
        response.set_keep_alive(false);
        match self.stream.write(response.payload()) {
            Ok(n) => stats.bytes_sent += n as u64,
            Err(e) => debug!(peer = %self.peer, error = %e, "could not send timeout response"),
        }
    }

    fn ingest(&mut self, data: &[u8], ctx: &mut Context<'_>, now: Instant) {
        let mut progress = self.parser.feed(data);
        while progress == Progress::HeadersReady {
            let request = self.parser.request();
            let limit = self
                .hosts
                .resolve(request.host().as_deref(), &request.path)
                .policy
                .body_limit;
            self.parser.limit_body(limit);
            progress = self.parser.feed(&[]);
        }

        if progress == Progress::Complete {
            self.dispatch(ctx, now);
        }
    }

    fn dispatch(&mut self, ctx: &mut Context<'_>, now: Instant) {
        let request = self.parser.take_request();
        let mut exchange = Exchange::new(&request, self.request_started.take().unwrap_or(now));
        let hosts = Arc::clone(&self.hosts);
        let route = hosts.resolve(exchange.host.as_deref(), &request.path);

        let mut forwarded_cookies = None;
        if let Some(store) = ctx.sessions.as_deref_mut() {
            if request.status().is_none() {
                let jar = request
                    .header("cookie")
                    .map(CookieJar::parse_cookie_header)
                    .unwrap_or_default();
                let ttl = store.ttl();
                let (session, created) = store.get_or_create(jar.get_value(SESSION_COOKIE), now);
                if created {
                    debug!(peer = %self.peer, "new session");
                    exchange.set_cookie = Some(Cookie::session(&session.id, ttl).to_header_value());
                }
                forwarded_cookies = session.missing_from(&jar);
                exchange.session_id = Some(session.id.clone());
            }
        }

        let server = ServerInfo {
            server_name: exchange.host.as_deref().unwrap_or(route.server.display_name()),
            server_port: self.local.port(),
            remote_addr: self.peer.ip(),
        };

        match handle(&request, &route, &server) {
            HandlerResult::Response(response) => self.respond(response, exchange, ctx.stats, now),
            HandlerResult::Cgi(mut invocation) => {
                if let Some(cookies) = forwarded_cookies {
                    invocation.env.append_cookies(&cookies);
                }
                let limits = CgiLimits {
                    timeout: ctx.settings.cgi_timeout,
                    max_output: ctx.settings.cgi_max_output,
                };
                match CgiRunner::spawn(&invocation, &request.body, limits, now) {
                    Ok(runner) => {
                        debug!(peer = %self.peer, pid = runner.pid(), "awaiting CGI");
                        self.cgi = Some(PendingCgi { runner, exchange });
                        self.state = ConnectionState::AwaitingCgi;
                    }
                    Err(e) => {
                        warn!(peer = %self.peer, uri = %exchange.uri, error = %e, "CGI could not start");
                        ctx.stats.errors += 1;
                        let response = error_response(e.status(), route.policy);
                        self.respond(response, exchange, ctx.stats, now);
                    }
                }
            }
        }
    }

    fn respond(&mut self, mut response: Response, exchange: Exchange, stats: &mut ServerStats, now: Instant) {
        if let Some(cookie) = &exchange.set_cookie {
            response.set_header("Set-Cookie", cookie);
        }
        response.set_keep_alive(exchange.keep_alive);

        info!(
            method = exchange.method,
            uri = %exchange.uri,
            status = response.status(),
            elapsed_ms = now.saturating_duration_since(exchange.started).as_millis() as u64,
            peer = %self.peer,
            local = %self.local,
            "request"
        );
        stats.requests_served += 1;

        self.keep_alive = exchange.keep_alive;
        self.write_buffer = response.payload().to_vec();
        self.write_pos = 0;
        self.state = ConnectionState::Writing;
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
