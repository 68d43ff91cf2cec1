use std::io;
use std::os::unix::io::RawFd;

use tracing::{debug, warn};

/// Longest partial line kept while waiting for its newline
const MAX_LINE: usize = 1024;

/// Line-based operator commands read from standard input.
///
/// `quit` or `exit` on a line of its own, or end of input, ask the server
/// to stop.
#[derive(Debug)]
pub struct StdinControl {
    fd: RawFd,
    pending: Vec<u8>,
}

impl StdinControl {
    pub fn new(fd: RawFd) -> Self {
        StdinControl {
            fd,
            pending: Vec::new(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Read what is available. `Ok(true)` once shutdown was requested.
    pub fn read(&mut self) -> io::Result<bool> {
        let mut buffer = [0u8; 512];
        let n = unsafe { libc::read(self.fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(false),
                _ => Err(err),
            };
        }
        if n == 0 {
            debug!("end of input on stdin");
            return Ok(true);
        }
        Ok(self.feed(&buffer[..n as usize]))
    }

    /// Scan complete lines in `data` for a stop command
    pub fn feed(&mut self, data: &[u8]) -> bool {
        self.pending.extend_from_slice(data);
        let mut stop = false;
        while let Some(end) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=end).collect();
            let command = String::from_utf8_lossy(&line);
            match command.trim() {
                "quit" | "exit" => stop = true,
                "" => {}
                other => warn!(command = other, "unknown command on stdin, expected quit or exit"),
            }
        }
        if self.pending.len() > MAX_LINE {
            self.pending.clear();
        }
        stop
    }
}
