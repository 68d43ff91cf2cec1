use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;

use crate::http::request::Request;
use crate::http::response::SERVER_NAME;

/// Where a request arrived: the names a script sees as `SERVER_*` and
/// `REMOTE_ADDR`.
#[derive(Debug, Clone, Copy)]
pub struct ServerInfo<'a> {
    pub server_name: &'a str,
    pub server_port: u16,
    pub remote_addr: IpAddr,
}

/// Environment handed to a CGI child. Nothing is inherited from the server
/// process except `PATH`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgiEnvironment {
    variables: BTreeMap<String, String>,
}

impl CgiEnvironment {
    pub fn new() -> Self {
        CgiEnvironment::default()
    }

    pub fn from_request(request: &Request, script_path: &Path, server: &ServerInfo<'_>) -> Self {
        let mut env = CgiEnvironment::new();
        let method = request.method.map(|m| m.as_str()).unwrap_or("GET");

        env.set("GATEWAY_INTERFACE", "CGI/1.1");
        env.set("SERVER_PROTOCOL", "HTTP/1.1");
        env.set("SERVER_SOFTWARE", SERVER_NAME);
        env.set("SERVER_NAME", server.server_name);
        env.set("SERVER_PORT", &server.server_port.to_string());
        env.set("REMOTE_ADDR", &server.remote_addr.to_string());
        env.set("REDIRECT_STATUS", "200");

        env.set("REQUEST_METHOD", method);
        env.set("REQUEST_URI", &request.uri);
        env.set("QUERY_STRING", request.query.as_deref().unwrap_or(""));
        env.set("SCRIPT_NAME", &request.path);
        env.set("PATH_INFO", &request.path);
        env.set("SCRIPT_FILENAME", &script_path.to_string_lossy());

        env.set("CONTENT_LENGTH", &request.body.len().to_string());
        if let Some(content_type) = request.content_type() {
            env.set("CONTENT_TYPE", content_type);
        }

        for (name, value) in request.headers.iter() {
            let key = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
            env.set(&key, value);
        }

        if let Ok(path) = std::env::var("PATH") {
            env.set("PATH", &path);
        }
        env
    }

    /// Add cookies to `HTTP_COOKIE` after whatever the client sent
    pub fn append_cookies(&mut self, cookies: &str) {
        let merged = match self.get("HTTP_COOKIE") {
            Some(existing) if !existing.is_empty() => format!("{}; {}", existing, cookies),
            _ => cookies.to_string(),
        };
        self.set("HTTP_COOKIE", &merged);
    }

    pub fn set(&mut self, name: &str, value: &str) {
        self.variables.insert(name.to_string(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(|s| s.as_str())
    }

    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }
}
