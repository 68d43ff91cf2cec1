use std::fmt::Write as _;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tracing::info;

use crate::config::server::{Config, Policy};
use crate::net::{EventLoop, ServerStats};
use crate::routing::RoutingTable;

/// HTTP server built from a loaded configuration
pub struct Server {
    event_loop: EventLoop,
}

impl Server {
    /// Build the routing table and bind every listening address.
    pub fn from_config(config: &Config) -> io::Result<Self> {
        let table = RoutingTable::build(config);
        let event_loop = EventLoop::new(table, config.settings.clone())?;
        Ok(Server { event_loop })
    }

    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.event_loop.shutdown_handle()
    }

    pub fn enable_stdin_control(&mut self) {
        self.event_loop.enable_stdin_control();
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.event_loop.local_addrs()
    }

    /// Serve until shut down, returning the final counters
    pub fn run(&mut self) -> io::Result<ServerStats> {
        self.event_loop.run()?;
        info!("server stopped");
        Ok(self.event_loop.stats())
    }
}

/// Human-readable outline of a configuration
pub fn describe(config: &Config) -> String {
    let mut out = String::new();
    let settings = &config.settings;
    let _ = writeln!(
        out,
        "client_timeout {}s, cgi_timeout {}s, sessions {}",
        settings.client_timeout.as_secs(),
        settings.cgi_timeout.as_secs(),
        if settings.sessions { "on" } else { "off" }
    );

    for hosts in RoutingTable::build(config).hosts() {
        let _ = writeln!(out, "listen {}", hosts.addr());
        for server in hosts.servers() {
            let _ = writeln!(out, "  server {}", server.display_name());
            let _ = writeln!(out, "    / {}", describe_policy(&server.policy));
            for location in &server.locations {
                let _ = writeln!(out, "    {} {}", location.prefix, describe_policy(&location.policy));
            }
        }
    }
    out
}

fn describe_policy(policy: &Policy) -> String {
    if let Some(redirect) = &policy.redirect {
        return format!("-> {} {}", redirect.code, redirect.target);
    }
    let mut parts = vec![
        format!("root {}", policy.root.display()),
        format!("methods {}", policy.methods.header_value()),
    ];
    if policy.autoindex {
        parts.push("autoindex".to_string());
    }
    if !policy.index.is_empty() {
        parts.push(format!("index {}", policy.index.join(" ")));
    }
    if let Some(upload) = &policy.upload_path {
        parts.push(format!("upload {}", upload.display()));
    }
    if !policy.cgi.is_empty() {
        let exts: Vec<&str> = policy.cgi.keys().map(String::as_str).collect();
        parts.push(format!("cgi {}", exts.join(" ")));
    }
    parts.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::config::DEFAULT_CONFIG;

    #[test]
    fn test_describe_default_config() {
        let config = ConfigParser::parse_str(DEFAULT_CONFIG).unwrap();
        let text = describe(&config);
        assert!(text.contains("listen 0.0.0.0:8080"));
        assert!(text.contains("/ping root"));
        assert!(text.contains("/google -> 301"));
    }

    #[test]
    fn test_server_binds_ephemeral_port() {
        let config = ConfigParser::parse_str("server { listen 127.0.0.1:0; }").unwrap();
        let server = Server::from_config(&config).unwrap();
        let addrs = server.local_addrs();
        assert_eq!(addrs.len(), 1);
        assert_ne!(addrs[0].port(), 0);
    }
}
