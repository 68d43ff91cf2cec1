use crate::cgi::error::CgiError;
use crate::http::response::Response;
use crate::http::status;

/// Headers and body a CGI script printed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiResponse {
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CgiResponse {
    /// Split script output at the first blank line into header lines and
    /// body. Lines may end in CRLF or a bare LF.
    pub fn parse(output: &[u8]) -> Result<CgiResponse, CgiError> {
        let (head, body) = split_head(output).ok_or(CgiError::Malformed("no blank line after headers"))?;
        let head = std::str::from_utf8(head).map_err(|_| CgiError::Malformed("headers are not UTF-8"))?;

        let mut response = CgiResponse {
            status: None,
            headers: Vec::new(),
            body: body.to_vec(),
        };

        for line in head.split('\n') {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            let (name, value) = line.split_once(':').ok_or(CgiError::Malformed("header line without colon"))?;
            let name = name.trim();
            let value = value.trim();
            if name.is_empty() {
                return Err(CgiError::Malformed("empty header name"));
            }

            if name.eq_ignore_ascii_case("status") {
                let code = value
                    .split_whitespace()
                    .next()
                    .and_then(|c| c.parse::<u16>().ok())
                    .filter(|c| (100..600).contains(c))
                    .ok_or(CgiError::Malformed("invalid Status header"))?;
                response.status = Some(code);
            } else {
                response.headers.push((name.to_string(), value.to_string()));
            }
        }

        Ok(response)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// `Set-Cookie` values the script emitted
    pub fn set_cookies(&self) -> impl Iterator<Item = &str> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case("set-cookie"))
            .map(|(_, v)| v.as_str())
    }

    /// Build the client response. Without a `Status` line the code is 200,
    /// or 302 when the script only set `Location`.
    pub fn into_response(self) -> Response {
        let code = match self.status {
            Some(code) => code,
            None if self.header("Location").is_some() => status::FOUND,
            None => status::OK,
        };
        let content_type = self.header("Content-Type").unwrap_or("text/html").to_string();

        let mut response = Response::new(code);
        for (name, value) in &self.headers {
            // Framing headers are recomputed from the body actually sent
            if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("connection") {
                continue;
            }
            response.set_header(name, value);
        }
        response.set_body(self.body, &content_type);
        response
    }
}

/// The header block ends at the first empty line, which may be the very
/// first line of the output.
fn split_head(output: &[u8]) -> Option<(&[u8], &[u8])> {
    let mut start = 0;
    loop {
        let end = start + output[start..].iter().position(|&b| b == b'\n')?;
        let line = &output[start..end];
        if line.is_empty() || line == b"\r" {
            return Some((&output[..start], &output[end + 1..]));
        }
        start = end + 1;
    }
}
