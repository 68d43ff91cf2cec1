use std::collections::HashSet;
use std::net::SocketAddr;

use crate::config::error::ConfigError;
use crate::config::server::{Config, Policy};

/// Check a parsed configuration for conflicts.
///
/// Hard errors fail the load. Softer problems (missing directories or
/// interpreters) come back as warnings so the server can still start.
pub fn validate(config: &Config) -> Result<Vec<String>, ConfigError> {
    if config.servers.is_empty() {
        return Err(ConfigError::NoServers);
    }

    // Names already claimed per listening address; "" stands for an unnamed block
    let mut claimed: HashSet<(SocketAddr, String)> = HashSet::new();
    for server in &config.servers {
        let keys: Vec<String> = if server.names.is_empty() {
            vec![String::new()]
        } else {
            server.names.clone()
        };
        for name in keys {
            if !claimed.insert((server.listen, name.clone())) {
                return Err(ConfigError::DuplicateServer {
                    addr: server.listen,
                    name: if name.is_empty() { "_".to_string() } else { name },
                });
            }
        }
    }

    let mut warnings = Vec::new();
    for server in &config.servers {
        let label = format!("server {} ({})", server.display_name(), server.listen);
        check_policy(&label, &server.policy, &mut warnings);
        for location in &server.locations {
            check_policy(&format!("{} location {}", label, location.prefix), &location.policy, &mut warnings);
        }
    }

    Ok(warnings)
}

fn check_policy(scope: &str, policy: &Policy, warnings: &mut Vec<String>) {
    if policy.redirect.is_some() {
        return;
    }
    if !policy.root.is_dir() {
        warnings.push(format!("{}: root {} is not a directory", scope, policy.root.display()));
    }
    if let Some(upload) = &policy.upload_path {
        if !upload.is_dir() {
            warnings.push(format!("{}: upload path {} is not a directory", scope, upload.display()));
        }
    }
    for (ext, interpreter) in &policy.cgi {
        if !interpreter.is_file() {
            warnings.push(format!(
                "{}: interpreter {} for {} not found",
                scope,
                interpreter.display(),
                ext
            ));
        }
    }
    for (code, page) in &policy.error_pages {
        if !page.is_file() {
            warnings.push(format!("{}: error page {} for {} not found", scope, page.display(), code));
        }
    }
}
