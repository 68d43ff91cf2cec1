use std::collections::HashMap;
use std::io;

/// Type of multipart field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    /// Text field with string value
    Text(String),
    /// File field, content kept as received
    File {
        filename: String,
        content_type: Option<String>,
        data: Vec<u8>,
    },
}

/// A single part of a `multipart/form-data` body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartField {
    pub name: String,
    pub field_type: FieldType,
}

impl MultipartField {
    pub fn is_file(&self) -> bool {
        matches!(self.field_type, FieldType::File { .. })
    }
}

/// Parser for multipart/form-data content.
///
/// Delimiters are validated strictly: the body must open with the dash
/// boundary, every part must be closed by `CRLF--boundary`, and the final
/// delimiter must carry the trailing `--`.
pub struct MultipartParser {
    delimiter: Vec<u8>,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> Self {
        MultipartParser {
            delimiter: format!("--{}", boundary).into_bytes(),
        }
    }

    /// Extract the boundary parameter from a multipart Content-Type value.
    pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
        content_type.split(';').skip(1).find_map(|param| {
            let (key, value) = param.trim().split_once('=')?;
            if !key.trim().eq_ignore_ascii_case("boundary") {
                return None;
            }
            let value = unquote(value.trim());
            (!value.is_empty() && value.len() <= 70).then(|| value.to_string())
        })
    }

    pub fn parse(&self, data: &[u8]) -> io::Result<Vec<MultipartField>> {
        let delim = self.delimiter.as_slice();

        let first = find(data, delim, 0).ok_or_else(|| invalid("missing opening boundary"))?;
        if first != 0 && !data[..first].ends_with(b"\r\n") {
            return Err(invalid("opening boundary not at line start"));
        }

        let mut fields = Vec::new();
        let mut pos = first + delim.len();

        loop {
            let rest = &data[pos..];
            if rest.starts_with(b"--") {
                // Close delimiter; only an optional CRLF epilogue may follow
                let tail = &rest[2..];
                if !(tail.is_empty() || tail.starts_with(b"\r\n")) {
                    return Err(invalid("garbage after closing boundary"));
                }
                return Ok(fields);
            }
            if !rest.starts_with(b"\r\n") {
                return Err(invalid("boundary not followed by CRLF"));
            }
            pos += 2;

            let mut closing = b"\r\n".to_vec();
            closing.extend_from_slice(delim);
            let end = find(data, &closing, pos).ok_or_else(|| invalid("part without closing boundary"))?;

            fields.push(parse_part(&data[pos..end])?);
            pos = end + closing.len();
        }
    }
}

fn parse_part(part: &[u8]) -> io::Result<MultipartField> {
    let header_end = find(part, b"\r\n\r\n", 0).ok_or_else(|| invalid("part without header block"))?;
    let headers = parse_headers(&part[..header_end])?;
    let body = &part[header_end + 4..];

    let disposition = headers
        .get("content-disposition")
        .ok_or_else(|| invalid("missing Content-Disposition"))?;
    let (name, filename) = parse_content_disposition(disposition)?;

    let field_type = match filename {
        Some(filename) => FieldType::File {
            filename,
            content_type: headers.get("content-type").cloned(),
            data: body.to_vec(),
        },
        None => FieldType::Text(
            String::from_utf8(body.to_vec()).map_err(|_| invalid("text field is not UTF-8"))?,
        ),
    };

    Ok(MultipartField { name, field_type })
}

fn parse_headers(data: &[u8]) -> io::Result<HashMap<String, String>> {
    let text = std::str::from_utf8(data).map_err(|_| invalid("part headers are not UTF-8"))?;

    let mut headers = HashMap::new();
    for line in text.split("\r\n").filter(|l| !l.is_empty()) {
        let (name, value) = line.split_once(':').ok_or_else(|| invalid("part header without colon"))?;
        headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    Ok(headers)
}

/// Returns `(name, filename)` from a Content-Disposition value
fn parse_content_disposition(header: &str) -> io::Result<(String, Option<String>)> {
    let mut parts = header.split(';');
    let kind = parts.next().unwrap_or("").trim();
    if !kind.eq_ignore_ascii_case("form-data") {
        return Err(invalid("part is not form-data"));
    }

    let mut name = None;
    let mut filename = None;
    for param in parts {
        if let Some((key, value)) = param.trim().split_once('=') {
            match key.trim().to_ascii_lowercase().as_str() {
                "name" => name = Some(unquote(value.trim()).to_string()),
                "filename" => filename = Some(unquote(value.trim()).to_string()),
                _ => {}
            }
        }
    }

    let name = name.ok_or_else(|| invalid("missing name in Content-Disposition"))?;
    Ok((name, filename))
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

fn find(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    if start > haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[start..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + start)
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("invalid multipart body: {}", msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"--XyZ\r\n\
Content-Disposition: form-data; name=\"title\"\r\n\
\r\n\
hello\r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"a.txt\"\r\n\
Content-Type: text/plain\r\n\
\r\n\
line1\r\nline2\r\n\
--XyZ--\r\n";

    #[test]
    fn test_parse_text_and_file() {
        let fields = MultipartParser::new("XyZ").parse(BODY).unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].name, "title");
        assert_eq!(fields[0].field_type, FieldType::Text("hello".to_string()));
        assert!(fields[1].is_file());
        match &fields[1].field_type {
            FieldType::File { filename, content_type, data } => {
                assert_eq!(filename, "a.txt");
                assert_eq!(content_type.as_deref(), Some("text/plain"));
                assert_eq!(data.as_slice(), b"line1\r\nline2");
            }
            other => panic!("unexpected field {:?}", other),
        }
    }

    #[test]
    fn test_wrong_boundary_rejected() {
        assert!(MultipartParser::new("Other").parse(BODY).is_err());
    }

    #[test]
    fn test_missing_close_delimiter_rejected() {
        let body = b"--XyZ\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nvalue\r\n";
        assert!(MultipartParser::new("XyZ").parse(body).is_err());
    }

    #[test]
    fn test_garbage_after_delimiter_rejected() {
        let body = b"--XyZjunk\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nv\r\n--XyZ--";
        assert!(MultipartParser::new("XyZ").parse(body).is_err());
    }

    #[test]
    fn test_empty_multipart() {
        let fields = MultipartParser::new("XyZ").parse(b"--XyZ--\r\n").unwrap();
        assert!(fields.is_empty());
    }

    #[test]
    fn test_boundary_from_content_type() {
        assert_eq!(
            MultipartParser::boundary_from_content_type("multipart/form-data; boundary=abc123"),
            Some("abc123".to_string())
        );
        assert_eq!(
            MultipartParser::boundary_from_content_type("multipart/form-data; Boundary=\"q t\""),
            Some("q t".to_string())
        );
        assert_eq!(MultipartParser::boundary_from_content_type("multipart/form-data"), None);
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"test\""), "test");
        assert_eq!(unquote("test"), "test");
        assert_eq!(unquote("\"file name.txt\""), "file name.txt");
    }
}
