use std::collections::HashMap;
use std::io;

/// Parsed `application/x-www-form-urlencoded` body
#[derive(Debug, Clone, Default)]
pub struct FormData {
    fields: HashMap<String, Vec<String>>,
}

impl FormData {
    pub fn new() -> Self {
        FormData::default()
    }

    /// Split on `&` then `=`, decoding `+` and `%XX` in both halves.
    pub fn parse(data: &[u8]) -> io::Result<Self> {
        let data_str = std::str::from_utf8(data)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "Invalid UTF-8 in form data"))?;

        let mut form_data = FormData::new();
        for pair in data_str.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            form_data.add_field(form_decode(key)?, form_decode(value)?);
        }
        Ok(form_data)
    }

    pub fn add_field(&mut self, name: String, value: String) {
        self.fields.entry(name).or_default().push(value);
    }

    /// First value for a field
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name)?.first().map(String::as_str)
    }

    pub fn get_all(&self, name: &str) -> Option<&[String]> {
        self.fields.get(name).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

fn form_decode(input: &str) -> io::Result<String> {
    percent_decode(input, true).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "Invalid URL encoding in form data")
    })
}

/// Decode `%XX` escapes (and `+` when `plus_as_space` is set).
///
/// Returns `None` on a truncated or non-hex escape, or when the decoded
/// bytes are not UTF-8.
pub fn percent_decode(input: &str, plus_as_space: bool) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = hex_value(*bytes.get(i + 1)?)?;
                let lo = hex_value(*bytes.get(i + 2)?)?;
                out.push(hi << 4 | lo);
                i += 3;
            }
            b'+' if plus_as_space => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8(out).ok()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
