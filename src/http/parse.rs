use crate::http::chunked::{ChunkedDecoder, ChunkedError};
use crate::http::request::{BodyFraming, Method, Request};
use crate::http::status;
use crate::upload::form_data::{percent_decode, FormData};
use crate::upload::multipart::MultipartParser;

/// Longest method token waited for before the request line is declared bad
const MAX_METHOD_WAIT: usize = 16;
/// Longest version token waited for
const MAX_VERSION_WAIT: usize = 16;

/// Size ceilings applied while parsing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseLimits {
    pub max_uri_length: usize,
    pub max_header_size: usize,
    pub max_body_size: usize,
}

impl Default for ParseLimits {
    fn default() -> Self {
        ParseLimits {
            max_uri_length: 2048,
            max_header_size: 8192,
            max_body_size: 100 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Uri,
    Version,
    Headers,
    Body,
    Ready,
    Rejected(u16),
}

/// What a call to [`RequestParser::feed`] achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More bytes are needed
    NeedMore,
    /// Headers just completed and a body follows. Reported once per request
    /// so the caller can tighten the body limit before reading on.
    HeadersReady,
    /// The request is ready or rejected
    Complete,
}

/// Resumable HTTP/1.1 request parser.
///
/// Bytes are appended to an internal buffer and consumed through a cursor.
/// Each state picks up exactly where the previous call stopped, so the
/// outcome does not depend on how the input was split across reads.
#[derive(Debug)]
pub struct RequestParser {
    state: ParseState,
    buffer: Vec<u8>,
    cursor: usize,
    // Where the next CRLF search resumes
    scan: usize,
    limits: ParseLimits,
    body_limit: usize,
    header_bytes: usize,
    chunked: Option<ChunkedDecoder>,
    request: Request,
}

impl RequestParser {
    pub fn new(limits: ParseLimits) -> Self {
        RequestParser {
            state: ParseState::RequestLine,
            buffer: Vec::new(),
            cursor: 0,
            scan: 0,
            limits,
            body_limit: limits.max_body_size,
            header_bytes: 0,
            chunked: None,
            request: Request::new(),
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, ParseState::Ready | ParseState::Rejected(_))
    }

    /// Unconsumed bytes are waiting in the buffer
    pub fn has_buffered(&self) -> bool {
        self.cursor < self.buffer.len()
    }

    /// Append `data` and advance as far as the buffered bytes allow.
    pub fn feed(&mut self, data: &[u8]) -> Progress {
        if let ParseState::Rejected(_) = self.state {
            return Progress::Complete;
        }
        self.compact();
        self.buffer.extend_from_slice(data);
        self.advance()
    }

    /// Apply the body limit of the policy that will serve this request.
    pub fn limit_body(&mut self, limit: usize) {
        self.body_limit = limit.min(self.limits.max_body_size);
        if let Some(decoder) = self.chunked.as_mut() {
            decoder.set_limit(self.body_limit);
        }
        let too_large = match self.request.framing {
            BodyFraming::ContentLength(n) => n > self.body_limit,
            _ => self.request.body.len() > self.body_limit,
        };
        if too_large && !self.is_terminal() {
            self.reject(status::PAYLOAD_TOO_LARGE);
        }
    }

    /// Hand out the finished request and start over on the bytes that
    /// followed it.
    pub fn take_request(&mut self) -> Request {
        let request = std::mem::take(&mut self.request);
        self.buffer.drain(..self.cursor);
        self.cursor = 0;
        self.scan = 0;
        self.state = ParseState::RequestLine;
        self.body_limit = self.limits.max_body_size;
        self.header_bytes = 0;
        self.chunked = None;
        request
    }

    fn compact(&mut self) {
        if self.cursor > 0 && self.cursor * 2 >= self.buffer.len() {
            self.buffer.drain(..self.cursor);
            self.scan -= self.cursor;
            self.cursor = 0;
        }
    }

    fn pending(&self) -> &[u8] {
        &self.buffer[self.cursor..]
    }

    fn consume(&mut self, n: usize) {
        self.cursor += n;
        self.scan = self.scan.max(self.cursor);
    }

    /// Length of the next CRLF-terminated line, without its terminator.
    fn next_line(&mut self) -> Option<usize> {
        let from = self.scan.max(self.cursor);
        match self.buffer[from..].windows(2).position(|w| w == b"\r\n") {
            Some(p) => Some(from + p - self.cursor),
            None => {
                // A trailing CR may still pair with the next LF
                self.scan = self.buffer.len().saturating_sub(1).max(self.cursor);
                None
            }
        }
    }

    fn reject(&mut self, code: u16) {
        self.state = ParseState::Rejected(code);
        self.request.status = Some(code);
        self.buffer.clear();
        self.cursor = 0;
        self.scan = 0;
    }

    fn advance(&mut self) -> Progress {
        loop {
            let before = (self.state, self.cursor);
            match self.state {
                ParseState::RequestLine => self.parse_method(),
                ParseState::Uri => self.parse_uri(),
                ParseState::Version => self.parse_version(),
                ParseState::Headers => {
                    if self.parse_header_line() {
                        return Progress::HeadersReady;
                    }
                }
                ParseState::Body => self.parse_body(),
                ParseState::Ready | ParseState::Rejected(_) => return Progress::Complete,
            }
            if (self.state, self.cursor) == before {
                return Progress::NeedMore;
            }
        }
    }

    fn parse_method(&mut self) {
        // Stray CRLFs between pipelined requests are skipped
        while self.pending().starts_with(b"\r\n") {
            self.consume(2);
        }

        let pending = self.pending();
        let Some(space) = pending.iter().position(|&b| b == b' ') else {
            if pending.len() > MAX_METHOD_WAIT || pending.contains(&b'\n') {
                self.reject(status::BAD_REQUEST);
            }
            return;
        };

        let token = &pending[..space];
        if token.is_empty() || !token.iter().all(|b| b.is_ascii_alphabetic()) {
            self.reject(status::BAD_REQUEST);
            return;
        }
        // Token is ASCII letters, so this cannot fail
        let token = String::from_utf8_lossy(token).into_owned();
        match Method::from_token(&token) {
            Some(method) if method.is_implemented() => {
                self.request.method = Some(method);
                self.consume(space + 1);
                self.state = ParseState::Uri;
            }
            Some(method) => {
                self.request.method = Some(method);
                self.reject(status::NOT_IMPLEMENTED);
            }
            None => self.reject(status::BAD_REQUEST),
        }
    }

    fn parse_uri(&mut self) {
        let max = self.limits.max_uri_length;
        let pending = self.pending();
        let Some(space) = pending.iter().position(|&b| b == b' ') else {
            if pending.contains(&b'\n') || pending.contains(&b'\r') {
                self.reject(status::BAD_REQUEST);
            } else if pending.len() > max {
                self.reject(status::URI_TOO_LONG);
            }
            return;
        };

        if space > max {
            self.reject(status::URI_TOO_LONG);
            return;
        }
        let token = &pending[..space];
        if token.is_empty() || token[0] != b'/' || token.iter().any(|b| b.is_ascii_control()) {
            self.reject(status::BAD_REQUEST);
            return;
        }
        let Ok(uri) = std::str::from_utf8(token).map(str::to_string) else {
            self.reject(status::BAD_REQUEST);
            return;
        };

        let (raw_path, query) = match uri.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (uri.as_str(), None),
        };
        let Some(path) = percent_decode(raw_path, false).filter(|p| !p.contains('\0')) else {
            self.reject(status::BAD_REQUEST);
            return;
        };

        self.request.path = path;
        self.request.query = query;
        self.request.uri = uri;
        self.consume(space + 1);
        self.state = ParseState::Version;
    }

    fn parse_version(&mut self) {
        let Some(len) = self.next_line() else {
            if self.pending().len() > MAX_VERSION_WAIT {
                self.reject(status::BAD_REQUEST);
            }
            return;
        };

        let token = &self.pending()[..len];
        if token.eq_ignore_ascii_case(b"HTTP/1.1") {
            self.request.version = "HTTP/1.1".to_string();
            self.consume(len + 2);
            self.state = ParseState::Headers;
        } else if is_version_token(token) {
            self.reject(status::VERSION_NOT_SUPPORTED);
        } else {
            self.reject(status::BAD_REQUEST);
        }
    }

    /// Consume one header line. Returns true when the header block ended
    /// and a body follows.
    fn parse_header_line(&mut self) -> bool {
        let max = self.limits.max_header_size;
        let Some(len) = self.next_line() else {
            if self.header_bytes + self.pending().len() > max {
                self.reject(status::HEADER_FIELDS_TOO_LARGE);
            }
            return false;
        };

        self.header_bytes += len + 2;
        if self.header_bytes > max {
            self.reject(status::HEADER_FIELDS_TOO_LARGE);
            return false;
        }

        if len == 0 {
            self.consume(2);
            return self.finish_headers();
        }

        let line = &self.pending()[..len];
        // Obsolete line folding is not accepted
        if line[0] == b' ' || line[0] == b'\t' {
            self.reject(status::BAD_REQUEST);
            return false;
        }
        let parsed = std::str::from_utf8(line).ok().and_then(|l| {
            let (name, value) = l.split_once(':')?;
            let valid_name = !name.is_empty()
                && name.bytes().all(|b| b.is_ascii_graphic() && b != b':');
            valid_name.then(|| (name.to_string(), value.trim().to_string()))
        });
        match parsed {
            Some((name, value)) => {
                self.request.headers.append(&name, &value);
                self.consume(len + 2);
            }
            None => self.reject(status::BAD_REQUEST),
        }
        false
    }

    fn finish_headers(&mut self) -> bool {
        self.request.headers_ready = true;

        if !self.request.headers.contains("host") {
            self.reject(status::BAD_REQUEST);
            return false;
        }

        let framing = match self.body_framing() {
            Ok(framing) => framing,
            Err(code) => {
                self.reject(code);
                return false;
            }
        };
        self.request.framing = framing;
        if framing == BodyFraming::Chunked {
            // Chunked framing wins; a Content-Length sent alongside it is stale
            self.request.headers.remove("content-length");
        }

        if let Some(ct) = self.request.content_type() {
            let is_multipart = ct
                .split(';')
                .next()
                .is_some_and(|t| t.trim().eq_ignore_ascii_case("multipart/form-data"));
            if is_multipart {
                match MultipartParser::boundary_from_content_type(ct) {
                    Some(boundary) => self.request.boundary = Some(boundary),
                    None => {
                        self.reject(status::BAD_REQUEST);
                        return false;
                    }
                }
            }
        }

        match framing {
            BodyFraming::None | BodyFraming::ContentLength(0) => {
                self.complete_body();
                false
            }
            BodyFraming::ContentLength(_) => {
                self.state = ParseState::Body;
                true
            }
            BodyFraming::Chunked => {
                self.chunked = Some(ChunkedDecoder::new(self.body_limit));
                self.state = ParseState::Body;
                true
            }
        }
    }

    fn body_framing(&self) -> Result<BodyFraming, u16> {
        let headers = &self.request.headers;
        let transfer_encoding = headers.get("transfer-encoding");
        let content_length = headers.get("content-length");

        if let Some(te) = transfer_encoding {
            let last = te.rsplit(',').next().unwrap_or("").trim();
            if !last.eq_ignore_ascii_case("chunked") {
                return Err(status::NOT_IMPLEMENTED);
            }
            return Ok(BodyFraming::Chunked);
        }

        if let Some(cl) = content_length {
            let cl = cl.trim();
            if cl.is_empty() || !cl.bytes().all(|b| b.is_ascii_digit()) {
                return Err(status::BAD_REQUEST);
            }
            let n: usize = cl.parse().map_err(|_| status::PAYLOAD_TOO_LARGE)?;
            if n > self.body_limit {
                return Err(status::PAYLOAD_TOO_LARGE);
            }
            return Ok(BodyFraming::ContentLength(n));
        }

        let needs_body = self.request.method.is_some_and(|m| m.expects_body());
        if needs_body {
            Err(status::BAD_REQUEST)
        } else {
            Ok(BodyFraming::None)
        }
    }

    fn parse_body(&mut self) {
        match self.request.framing {
            BodyFraming::ContentLength(n) => {
                let want = n - self.request.body.len();
                let take = want.min(self.pending().len());
                let start = self.cursor;
                self.request.body.extend_from_slice(&self.buffer[start..start + take]);
                self.consume(take);
                if self.request.body.len() == n {
                    self.complete_body();
                }
            }
            BodyFraming::Chunked => {
                let Some(decoder) = self.chunked.as_mut() else {
                    self.reject(status::INTERNAL_SERVER_ERROR);
                    return;
                };
                let result = decoder.decode(&self.buffer[self.cursor..], &mut self.request.body);
                let complete = decoder.is_complete();
                match result {
                    Ok(used) => {
                        self.consume(used);
                        if complete {
                            self.complete_body();
                        }
                    }
                    Err(ChunkedError::TooLarge) => self.reject(status::PAYLOAD_TOO_LARGE),
                    Err(ChunkedError::Malformed(_)) => self.reject(status::BAD_REQUEST),
                }
            }
            BodyFraming::None => self.complete_body(),
        }
    }

    fn complete_body(&mut self) {
        if let Some(boundary) = self.request.boundary.clone() {
            match MultipartParser::new(&boundary).parse(&self.request.body) {
                Ok(parts) => {
                    for part in &parts {
                        if let crate::upload::multipart::FieldType::Text(value) = &part.field_type {
                            self.request.form.add_field(part.name.clone(), value.clone());
                        }
                    }
                    self.request.parts = parts;
                }
                Err(_) => {
                    self.reject(status::BAD_REQUEST);
                    return;
                }
            }
        } else if self.request.is_urlencoded() {
            match FormData::parse(&self.request.body) {
                Ok(form) => self.request.form = form,
                Err(_) => {
                    self.reject(status::BAD_REQUEST);
                    return;
                }
            }
        }

        self.request.body_ready = true;
        self.state = ParseState::Ready;
    }
}

fn is_version_token(token: &[u8]) -> bool {
    token.len() == 8
        && token[..5].eq_ignore_ascii_case(b"HTTP/")
        && token[5].is_ascii_digit()
        && token[6] == b'.'
        && token[7].is_ascii_digit()
}
