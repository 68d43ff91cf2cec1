use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

use crate::http::status;

/// Failures while running a CGI script
#[derive(Debug, Error)]
pub enum CgiError {
    #[error("failed to start {interpreter}: {source}")]
    Spawn {
        interpreter: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("CGI I/O failure: {0}")]
    Io(#[from] io::Error),

    #[error("CGI script ran longer than {0:?}")]
    Timeout(Duration),

    #[error("CGI script exited with {0}")]
    Exit(ExitStatus),

    #[error("CGI output exceeds {0} bytes")]
    OutputTooLarge(usize),

    #[error("malformed CGI output: {0}")]
    Malformed(&'static str),
}

impl CgiError {
    /// Status code the client sees for this failure
    pub fn status(&self) -> u16 {
        match self {
            CgiError::Timeout(_) => status::GATEWAY_TIMEOUT,
            _ => status::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(CgiError::Timeout(Duration::from_secs(1)).status(), 504);
        assert_eq!(CgiError::Malformed("x").status(), 500);
        let spawn = CgiError::Spawn {
            interpreter: PathBuf::from("/nope"),
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        };
        assert_eq!(spawn.status(), 500);
        assert!(spawn.to_string().contains("/nope"));
    }
}
