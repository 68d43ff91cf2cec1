use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Name of the cookie carrying the session id
pub const SESSION_COOKIE: &str = "WEBSERV_SID";

/// A cookie to be sent in `Set-Cookie`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: Option<String>,
    pub max_age: Option<Duration>,
    pub http_only: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Cookie {
            name: name.into(),
            value: value.into(),
            path: None,
            max_age: None,
            http_only: false,
        }
    }

    /// Cookie naming a session, valid for `timeout` across the whole site
    pub fn session(id: &str, timeout: Duration) -> Self {
        Cookie::new(SESSION_COOKIE, id)
            .max_age(timeout)
            .path("/")
            .http_only(true)
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    /// Name and value from a `Set-Cookie` value; attributes are ignored.
    pub fn parse_set_cookie(header_value: &str) -> Option<Cookie> {
        let pair = header_value.split(';').next()?;
        let (name, value) = pair.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some(Cookie::new(name, value.trim()))
    }

    /// Value for a `Set-Cookie` header
    pub fn to_header_value(&self) -> String {
        let mut parts = vec![format!("{}={}", self.name, self.value)];
        if let Some(max_age) = self.max_age {
            parts.push(format!("Max-Age={}", max_age.as_secs()));
        }
        if let Some(ref path) = self.path {
            parts.push(format!("Path={}", path));
        }
        if self.http_only {
            parts.push("HttpOnly".to_string());
        }
        parts.join("; ")
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_header_value())
    }
}

/// Cookies a client sent in its `Cookie` header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    cookies: BTreeMap<String, String>,
}

impl CookieJar {
    pub fn new() -> Self {
        CookieJar::default()
    }

    /// Parse `name1=value1; name2=value2`
    pub fn parse_cookie_header(header_value: &str) -> Self {
        let mut jar = CookieJar::new();
        for pair in header_value.split(';') {
            if let Some((name, value)) = pair.split_once('=') {
                let name = name.trim();
                if !name.is_empty() {
                    jar.cookies.insert(name.to_string(), value.trim().to_string());
                }
            }
        }
        jar
    }

    pub fn get_value(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.cookies.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_cookie_header_value() {
        let cookie = Cookie::session("abc123", Duration::from_secs(3600));
        assert_eq!(
            cookie.to_header_value(),
            "WEBSERV_SID=abc123; Max-Age=3600; Path=/; HttpOnly"
        );
    }

    #[test]
    fn test_plain_cookie() {
        let cookie = Cookie::new("theme", "dark");
        assert_eq!(cookie.to_string(), "theme=dark");
    }

    #[test]
    fn test_parse_set_cookie() {
        let cookie = Cookie::parse_set_cookie("user=alice; Path=/; HttpOnly").unwrap();
        assert_eq!(cookie.name, "user");
        assert_eq!(cookie.value, "alice");
        assert!(Cookie::parse_set_cookie("novalue").is_none());
        assert!(Cookie::parse_set_cookie("=x").is_none());
    }

    #[test]
    fn test_cookie_jar_parsing() {
        let jar = CookieJar::parse_cookie_header("WEBSERV_SID=abc123; user_pref=dark_mode; junk");

        assert_eq!(jar.get_value(SESSION_COOKIE), Some("abc123"));
        assert_eq!(jar.get_value("user_pref"), Some("dark_mode"));
        assert_eq!(jar.get_value("nonexistent"), None);
        assert!(jar.contains("user_pref"));
        assert_eq!(jar.len(), 2);
    }
}
