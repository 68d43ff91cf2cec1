//! Error responses: configured error pages with a generated fallback

use std::fs;

use tracing::warn;

use crate::config::server::Policy;
use crate::http::response::Response;
use crate::http::status::{self, reason_phrase};
use crate::mime::mime_for;

/// Generated status page used when no custom page is configured
pub fn default_error_page(code: u16) -> String {
    let phrase = reason_phrase(code);
    format!(
        "<!DOCTYPE html>\n\
<html>\n\
<head><title>{code} - {phrase}</title></head>\n\
<body>\n\
<center><h1>{code} - {phrase}</h1></center>\n\
<hr><center>{server}</center>\n\
</body>\n\
</html>\n",
        code = code,
        phrase = phrase,
        server = crate::http::response::SERVER_NAME,
    )
}

/// Build the response for an error status under `policy`.
///
/// A configured page for the code is served with its own content type. If
/// it cannot be read the generated page is used instead.
pub fn error_response(code: u16, policy: &Policy) -> Response {
    let mut response = custom_page(code, policy)
        .unwrap_or_else(|| Response::with_body(code, default_error_page(code), "text/html"));
    if code == status::METHOD_NOT_ALLOWED {
        response.set_header("Allow", &policy.methods.header_value());
    }
    response
}

fn custom_page(code: u16, policy: &Policy) -> Option<Response> {
    let path = policy.error_page(code)?;
    match fs::read(path) {
        Ok(content) => Some(Response::with_body(code, content, mime_for(path))),
        Err(e) => {
            warn!(code, path = %path.display(), error = %e, "custom error page unavailable");
            None
        }
    }
}

/// Escape text for inclusion in HTML
pub fn html_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            c => escaped.push(c),
        }
    }
    escaped
}
