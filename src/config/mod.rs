pub mod error;
pub mod parser;
pub mod server;
pub mod validation;

use std::path::Path;

pub use error::ConfigError;
pub use parser::{ConfigParser, DEFAULT_CONFIG};
pub use server::{AllowedMethods, Config, Location, Policy, Redirect, ServerBlock, Settings};

/// Load from `path`, or the built-in default when none is given, and
/// validate. Warnings are returned alongside the configuration.
pub fn load(path: Option<&Path>) -> Result<(Config, Vec<String>), ConfigError> {
    let config = match path {
        Some(path) => ConfigParser::parse_file(path)?,
        None => ConfigParser::parse_str(DEFAULT_CONFIG)?,
    };
    let warnings = validation::validate(&config)?;
    Ok((config, warnings))
}
