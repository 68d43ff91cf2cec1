use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Failure to load a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("line {line}: unknown directive `{name}`")]
    UnknownDirective { line: usize, name: String },

    #[error("line {line}: invalid value for `{directive}`: {message}")]
    InvalidValue {
        line: usize,
        directive: String,
        message: String,
    },

    #[error("no server block defined")]
    NoServers,

    #[error("conflicting server blocks on {addr} for name `{name}`")]
    DuplicateServer { addr: SocketAddr, name: String },
}

impl ConfigError {
    pub(crate) fn syntax(line: usize, message: impl Into<String>) -> Self {
        ConfigError::Syntax {
            line,
            message: message.into(),
        }
    }

    pub(crate) fn invalid(line: usize, directive: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            line,
            directive: directive.to_string(),
            message: message.into(),
        }
    }
}
