use std::fmt;
use std::time::{Duration, Instant};

/// Counters kept by the event loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerStats {
    /// Total connections accepted
    pub connections_accepted: u64,
    /// Responses queued for sending
    pub requests_served: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    /// Idle connections dropped plus CGI children killed at their deadline
    pub timeouts: u64,
    /// Transport failures and CGI failures
    pub errors: u64,
}

impl ServerStats {
    pub fn report(&self, started: Instant) -> StatsReport<'_> {
        StatsReport {
            stats: self,
            uptime: started.elapsed(),
        }
    }
}

/// Display adapter for the shutdown log line
pub struct StatsReport<'a> {
    stats: &'a ServerStats,
    uptime: Duration,
}

impl fmt::Display for StatsReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.stats;
        write!(
            f,
            "uptime {}s, {} connections, {} requests, {} in, {} out, {} timeouts, {} errors",
            self.uptime.as_secs(),
            s.connections_accepted,
            s.requests_served,
            format_bytes(s.bytes_received),
            format_bytes(s.bytes_sent),
            s.timeouts,
            s.errors
        )
    }
}

/// Format bytes in human-readable format
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

    let mut size = bytes as f64;
    let mut unit_index = 0;
    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_stats() {
        let stats = ServerStats::default();
        assert_eq!(stats.connections_accepted, 0);
        assert_eq!(stats.requests_served, 0);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_report_line() {
        let stats = ServerStats {
            connections_accepted: 3,
            requests_served: 5,
            bytes_received: 100,
            bytes_sent: 2000,
            timeouts: 1,
            errors: 0,
        };
        let line = stats.report(Instant::now()).to_string();
        assert!(line.starts_with("uptime 0s, 3 connections, 5 requests, 100 B in, 1.95 KB out"));
        assert!(line.ends_with("1 timeouts, 0 errors"));
    }
}
