use crate::config::server::{Location, Policy, ServerBlock};

/// Outcome of resolving a request against the virtual host table.
///
/// Borrowed from the loaded configuration, so resolving the same host and
/// path twice yields the same references.
#[derive(Debug, Clone, Copy)]
pub struct Route<'a> {
    pub server: &'a ServerBlock,
    pub location: Option<&'a Location>,
    pub policy: &'a Policy,
}

impl<'a> Route<'a> {
    pub fn server_only(server: &'a ServerBlock) -> Self {
        Route {
            server,
            location: None,
            policy: &server.policy,
        }
    }

    pub fn at_location(server: &'a ServerBlock, location: &'a Location) -> Self {
        Route {
            server,
            location: Some(location),
            policy: &location.policy,
        }
    }

    /// Prefix of the matched location, `/` when the server policy applies
    pub fn prefix(&self) -> &str {
        self.location.map(|l| l.prefix.as_str()).unwrap_or("/")
    }

    /// `path` with the location prefix and leading slashes removed
    pub fn relative_path<'p>(&self, path: &'p str) -> &'p str {
        let rest = path.strip_prefix(self.prefix()).unwrap_or(path);
        rest.trim_start_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_with(prefix: &str) -> ServerBlock {
        let mut server = ServerBlock::default();
        server.locations.push(Location {
            prefix: prefix.to_string(),
            policy: Policy::default(),
        });
        server
    }

    #[test]
    fn test_relative_path_under_location() {
        let server = server_with("/uploads");
        let route = Route::at_location(&server, &server.locations[0]);
        assert_eq!(route.prefix(), "/uploads");
        assert_eq!(route.relative_path("/uploads/file_a"), "file_a");
        assert_eq!(route.relative_path("/uploads/"), "");
        assert_eq!(route.relative_path("/uploads"), "");
    }

    #[test]
    fn test_relative_path_server_only() {
        let server = ServerBlock::default();
        let route = Route::server_only(&server);
        assert_eq!(route.prefix(), "/");
        assert_eq!(route.relative_path("/a/b.txt"), "a/b.txt");
        assert!(std::ptr::eq(route.policy, &server.policy));
    }
}
