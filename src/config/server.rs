use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::http::parse::ParseLimits;
use crate::http::request::Method;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BODY_LIMIT: usize = 1_000_000;

/// Methods a policy lets through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowedMethods {
    pub get: bool,
    pub post: bool,
    pub delete: bool,
}

impl AllowedMethods {
    pub fn none() -> Self {
        AllowedMethods { get: false, post: false, delete: false }
    }

    pub fn allows(&self, method: Method) -> bool {
        match method {
            Method::GET => self.get,
            Method::POST => self.post,
            Method::DELETE => self.delete,
            _ => false,
        }
    }

    pub fn allow(&mut self, method: Method) {
        match method {
            Method::GET => self.get = true,
            Method::POST => self.post = true,
            Method::DELETE => self.delete = true,
            _ => {}
        }
    }

    /// Value for an `Allow` header
    pub fn header_value(&self) -> String {
        let mut names = Vec::new();
        if self.get {
            names.push("GET");
        }
        if self.post {
            names.push("POST");
        }
        if self.delete {
            names.push("DELETE");
        }
        names.join(", ")
    }
}

impl Default for AllowedMethods {
    fn default() -> Self {
        AllowedMethods { get: true, post: true, delete: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub code: u16,
    pub target: String,
}

/// Effective settings for a server or location scope.
///
/// Locations hold a complete copy taken from their server at load time, so
/// lookups never walk back up to a parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub root: PathBuf,
    pub index: Vec<String>,
    pub autoindex: bool,
    pub methods: AllowedMethods,
    pub body_limit: usize,
    pub upload_path: Option<PathBuf>,
    pub redirect: Option<Redirect>,
    pub error_pages: BTreeMap<u16, PathBuf>,
    /// Extension including its dot, mapped to the interpreter
    pub cgi: BTreeMap<String, PathBuf>,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            root: PathBuf::from("www"),
            index: Vec::new(),
            autoindex: false,
            methods: AllowedMethods::default(),
            body_limit: DEFAULT_BODY_LIMIT,
            upload_path: None,
            redirect: None,
            error_pages: BTreeMap::new(),
            cgi: BTreeMap::new(),
        }
    }
}

impl Policy {
    pub fn allows(&self, method: Method) -> bool {
        self.methods.allows(method)
    }

    /// Interpreter registered for the extension of `path`, if any
    pub fn cgi_interpreter(&self, path: &Path) -> Option<&Path> {
        let ext = path.extension()?.to_str()?;
        self.cgi.get(&format!(".{}", ext)).map(PathBuf::as_path)
    }

    pub fn error_page(&self, code: u16) -> Option<&Path> {
        self.error_pages.get(&code).map(PathBuf::as_path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    /// Normalised prefix: leading slash, no trailing slash (except `/`)
    pub prefix: String,
    pub policy: Policy,
}

impl Location {
    /// Whether `path` lies under this location, on a segment boundary.
    pub fn matches(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return path.starts_with('/');
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

/// One `server { }` block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerBlock {
    pub listen: SocketAddr,
    /// Lowercased server names
    pub names: Vec<String>,
    pub policy: Policy,
    pub locations: Vec<Location>,
}

impl Default for ServerBlock {
    fn default() -> Self {
        ServerBlock {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            names: Vec::new(),
            policy: Policy::default(),
            locations: Vec::new(),
        }
    }
}

impl ServerBlock {
    /// Label used in logs
    pub fn display_name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or("_")
    }
}

/// Process-wide settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub client_timeout: Duration,
    pub cgi_timeout: Duration,
    pub cgi_max_output: usize,
    pub max_uri_length: usize,
    pub max_header_size: usize,
    pub max_body_size: usize,
    pub sessions: bool,
    pub session_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            client_timeout: Duration::from_secs(30),
            cgi_timeout: Duration::from_secs(5),
            cgi_max_output: 8 * 1024 * 1024,
            max_uri_length: 2048,
            max_header_size: 8192,
            max_body_size: 100 * 1024 * 1024,
            sessions: false,
            session_timeout: Duration::from_secs(3600),
        }
    }
}

impl Settings {
    pub fn parse_limits(&self) -> ParseLimits {
        ParseLimits {
            max_uri_length: self.max_uri_length,
            max_header_size: self.max_header_size,
            max_body_size: self.max_body_size,
        }
    }
}

/// Loaded and validated configuration
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Config {
    pub settings: Settings,
    pub servers: Vec<ServerBlock>,
}
