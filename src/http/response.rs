use std::cell::OnceCell;
use std::fmt;

use chrono::Utc;

use crate::http::status::reason_phrase;

pub const SERVER_NAME: &str = concat!("webserv/", env!("CARGO_PKG_VERSION"));

/// An outgoing response.
///
/// The wire form is produced lazily by [`Response::payload`] and cached, so
/// later calls hand back the same bytes without reserializing. Mutating the
/// response after that drops the cache.
#[derive(Debug, Clone)]
pub struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    cookies: Vec<String>,
    body: Vec<u8>,
    keep_alive: bool,
    payload: OnceCell<Vec<u8>>,
}

impl Response {
    pub fn new(status: u16) -> Self {
        Response {
            status,
            headers: Vec::new(),
            cookies: Vec::new(),
            body: Vec::new(),
            keep_alive: true,
            payload: OnceCell::new(),
        }
    }

    pub fn with_body(status: u16, body: impl Into<Vec<u8>>, content_type: &str) -> Self {
        let mut response = Response::new(status);
        response.set_body(body, content_type);
        response
    }

    /// Redirect to `location` with an empty body
    pub fn redirect(status: u16, location: &str) -> Self {
        let mut response = Response::new(status);
        response.set_header("Location", location);
        response
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
        self.payload.take();
    }

    /// Replace a header. `Set-Cookie` is routed to the cookie list so that
    /// several can coexist.
    pub fn set_header(&mut self, name: &str, value: &str) {
        if name.eq_ignore_ascii_case("set-cookie") {
            self.cookies.push(value.to_string());
        } else if let Some(slot) = self.headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            slot.1 = value.to_string();
        } else {
            self.headers.push((name.to_string(), value.to_string()));
        }
        self.payload.take();
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn cookies(&self) -> &[String] {
        &self.cookies
    }

    pub fn set_body(&mut self, body: impl Into<Vec<u8>>, content_type: &str) {
        self.body = body.into();
        self.set_header("Content-Type", content_type);
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
        self.payload.take();
    }

    /// Serialized status line, headers and body.
    pub fn payload(&self) -> &[u8] {
        self.payload.get_or_init(|| self.serialize())
    }

    fn serialize(&self) -> Vec<u8> {
        let mut head = format!(
            "HTTP/1.1 {} {}\r\n",
            self.status,
            reason_phrase(self.status)
        );

        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        head.push_str(&format!("Connection: {}\r\n", connection));
        let content_type = self.header("Content-Type").unwrap_or("text/html");
        head.push_str(&format!("Content-Type: {}\r\n", content_type));
        head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        if self.header("Date").is_none() {
            head.push_str(&format!("Date: {}\r\n", http_date()));
        }
        if self.header("Server").is_none() {
            head.push_str(&format!("Server: {}\r\n", SERVER_NAME));
        }

        for (name, value) in &self.headers {
            let managed = ["connection", "content-type", "content-length"];
            if managed.iter().any(|m| name.eq_ignore_ascii_case(m)) {
                continue;
            }
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        for cookie in &self.cookies {
            head.push_str(&format!("Set-Cookie: {}\r\n", cookie));
        }
        head.push_str("\r\n");

        let mut payload = head.into_bytes();
        payload.extend_from_slice(&self.body);
        payload
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/1.1 {} {}", self.status, reason_phrase(self.status))
    }
}

/// Current time in IMF-fixdate form
pub fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
