use std::collections::HashMap;
use std::net::SocketAddr;

use crate::config::server::{Config, ServerBlock};
use crate::routing::route::Route;

/// Server blocks sharing one listening address.
///
/// The first block declared for the address is the primary and answers any
/// Host it does not recognise. Names are indexed lowercased.
#[derive(Debug, Clone)]
pub struct VirtualHosts {
    addr: SocketAddr,
    servers: Vec<ServerBlock>,
    by_name: HashMap<String, usize>,
}

impl VirtualHosts {
    pub fn new(primary: ServerBlock) -> Self {
        let mut hosts = VirtualHosts {
            addr: primary.listen,
            servers: Vec::new(),
            by_name: HashMap::new(),
        };
        hosts.add(primary);
        hosts
    }

    fn add(&mut self, server: ServerBlock) {
        let index = self.servers.len();
        for name in &server.names {
            self.by_name.entry(name.to_ascii_lowercase()).or_insert(index);
        }
        self.servers.push(server);
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Address actually bound, once a wildcard port has been resolved
    pub fn set_addr(&mut self, addr: SocketAddr) {
        self.addr = addr;
    }

    pub fn primary(&self) -> &ServerBlock {
        &self.servers[0]
    }

    pub fn servers(&self) -> &[ServerBlock] {
        &self.servers
    }

    /// Server block for a Host value (already stripped of its port)
    pub fn server_for(&self, host: Option<&str>) -> &ServerBlock {
        host.and_then(|h| self.by_name.get(&h.to_ascii_lowercase()))
            .map(|&i| &self.servers[i])
            .unwrap_or_else(|| self.primary())
    }

    /// Pick the server by Host, then the location whose prefix covers the
    /// most path segments. With no covering location the server's own
    /// policy applies.
    pub fn resolve(&self, host: Option<&str>, path: &str) -> Route<'_> {
        let server = self.server_for(host);
        server
            .locations
            .iter()
            .filter(|l| l.matches(path))
            .max_by_key(|l| if l.prefix == "/" { 0 } else { l.prefix.len() })
            .map(|location| Route::at_location(server, location))
            .unwrap_or_else(|| Route::server_only(server))
    }
}

/// Every listening address with its virtual hosts, in declaration order
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    hosts: Vec<VirtualHosts>,
}

impl RoutingTable {
    pub fn build(config: &Config) -> Self {
        let mut table = RoutingTable::default();
        for server in &config.servers {
            match table.hosts.iter_mut().find(|h| h.addr == server.listen) {
                Some(hosts) => hosts.add(server.clone()),
                None => table.hosts.push(VirtualHosts::new(server.clone())),
            }
        }
        table
    }

    pub fn hosts(&self) -> &[VirtualHosts] {
        &self.hosts
    }

    pub fn into_hosts(self) -> Vec<VirtualHosts> {
        self.hosts
    }
}
