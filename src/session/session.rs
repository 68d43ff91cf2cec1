use std::collections::hash_map::RandomState;
use std::collections::BTreeMap;
use std::fs::File;
use std::hash::{BuildHasher, Hasher};
use std::io::Read;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::cookie::CookieJar;

pub const SESSION_ID_LENGTH: usize = 32;

/// One client session: the cookies its CGI scripts have set, and when it
/// lapses.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    cookies: BTreeMap<String, String>,
    expires_at: Instant,
}

impl Session {
    pub fn new(id: String, now: Instant, ttl: Duration) -> Self {
        Session {
            id,
            cookies: BTreeMap::new(),
            expires_at: now + ttl,
        }
    }

    /// Push the expiry out to `now + ttl`
    pub fn touch(&mut self, now: Instant, ttl: Duration) {
        self.expires_at = now + ttl;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    pub fn set_cookie(&mut self, name: &str, value: &str) {
        self.cookies.insert(name.to_string(), value.to_string());
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn cookies(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cookies.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Remembered cookies the client did not send itself, as `a=1; b=2`
    pub fn missing_from(&self, jar: &CookieJar) -> Option<String> {
        let missing: Vec<String> = self
            .cookies
            .iter()
            .filter(|(name, _)| !jar.contains(name))
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        if missing.is_empty() {
            None
        } else {
            Some(missing.join("; "))
        }
    }
}

/// Random alphanumeric session id.
///
/// Reads the kernel's random source, falling back to std's per-process
/// hasher keys when `/dev/urandom` is unavailable.
pub fn generate_id() -> String {
    const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

    let mut bytes = [0u8; SESSION_ID_LENGTH];
    let filled = File::open("/dev/urandom")
        .and_then(|mut f| f.read_exact(&mut bytes))
        .is_ok();
    if !filled {
        fallback_bytes(&mut bytes);
    }

    bytes
        .iter()
        .map(|b| ALPHABET[*b as usize % ALPHABET.len()] as char)
        .collect()
}

fn fallback_bytes(bytes: &mut [u8]) {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    for chunk in bytes.chunks_mut(8) {
        let mut hasher = RandomState::new().build_hasher();
        hasher.write_u128(nanos);
        let word = hasher.finish().to_le_bytes();
        chunk.copy_from_slice(&word[..chunk.len()]);
    }
}
