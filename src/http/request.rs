use std::collections::BTreeMap;
use std::fmt;

use crate::upload::form_data::FormData;
use crate::upload::multipart::MultipartField;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    GET,
    POST,
    DELETE,
    HEAD,
    PUT,
    PATCH,
    OPTIONS,
    CONNECT,
    TRACE,
}

impl Method {
    /// Recognise a method token. Matching is case sensitive.
    pub fn from_token(s: &str) -> Option<Method> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "PUT" => Some(Method::PUT),
            "PATCH" => Some(Method::PATCH),
            "OPTIONS" => Some(Method::OPTIONS),
            "CONNECT" => Some(Method::CONNECT),
            "TRACE" => Some(Method::TRACE),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::PUT => "PUT",
            Method::PATCH => "PATCH",
            Method::OPTIONS => "OPTIONS",
            Method::CONNECT => "CONNECT",
            Method::TRACE => "TRACE",
        }
    }

    /// Only these three are served; anything else known is a 501.
    pub fn is_implemented(&self) -> bool {
        matches!(self, Method::GET | Method::POST | Method::DELETE)
    }

    pub fn expects_body(&self) -> bool {
        matches!(self, Method::POST)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the request body is delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyFraming {
    #[default]
    None,
    ContentLength(usize),
    Chunked,
}

/// Header map with case-insensitive names. Values keep their case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: BTreeMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Headers::default()
    }

    /// Repeated names are folded into one comma separated value.
    pub fn append(&mut self, name: &str, value: &str) {
        let key = name.to_ascii_lowercase();
        match self.entries.get_mut(&key) {
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => {
                self.entries.insert(key, value.to_string());
            }
        }
    }

    pub fn insert(&mut self, name: &str, value: String) {
        self.entries.insert(name.to_ascii_lowercase(), value);
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries.remove(&name.to_ascii_lowercase())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// A request as assembled by [`RequestParser`](super::parse::RequestParser).
///
/// Fields fill in as parsing progresses. A request that the parser rejects
/// keeps whatever was read so far and carries the status code to answer with.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub method: Option<Method>,
    /// Request target exactly as received
    pub uri: String,
    /// Percent-decoded path component of the target
    pub path: String,
    pub query: Option<String>,
    pub version: String,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub framing: BodyFraming,
    pub boundary: Option<String>,
    pub form: FormData,
    pub parts: Vec<MultipartField>,
    pub(crate) headers_ready: bool,
    pub(crate) body_ready: bool,
    pub(crate) status: Option<u16>,
}

impl Request {
    pub fn new() -> Self {
        Request::default()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Host header without any port suffix, lowercased
    pub fn host(&self) -> Option<String> {
        let raw = self.headers.get("host")?.trim();
        let host = match raw.strip_prefix('[') {
            // IPv6 literal
            Some(rest) => rest.split(']').next().unwrap_or(rest),
            None => raw.split(':').next().unwrap_or(raw),
        };
        Some(host.to_ascii_lowercase())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    pub fn content_length(&self) -> Option<usize> {
        match self.framing {
            BodyFraming::ContentLength(n) => Some(n),
            _ => None,
        }
    }

    pub fn is_multipart(&self) -> bool {
        self.boundary.is_some()
    }

    pub fn is_urlencoded(&self) -> bool {
        self.content_type()
            .map(|ct| {
                ct.split(';')
                    .next()
                    .unwrap_or("")
                    .trim()
                    .eq_ignore_ascii_case("application/x-www-form-urlencoded")
            })
            .unwrap_or(false)
    }

    pub fn headers_ready(&self) -> bool {
        self.headers_ready
    }

    pub fn body_ready(&self) -> bool {
        self.body_ready
    }

    /// Status recorded by the parser when the request was rejected
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Either fully parsed or rejected
    pub fn is_terminal(&self) -> bool {
        self.body_ready || self.status.is_some()
    }

    /// The connection must close after this request is answered.
    pub fn closes_connection(&self) -> bool {
        if self.status.is_some() {
            return true;
        }
        self.headers
            .get("connection")
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
            .unwrap_or(false)
    }
}
