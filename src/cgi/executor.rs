use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cgi::environment::CgiEnvironment;
use crate::cgi::error::CgiError;
use crate::cgi::response::CgiResponse;

/// A script to run and everything it is handed
#[derive(Debug, Clone)]
pub struct CgiInvocation {
    pub interpreter: PathBuf,
    pub script: PathBuf,
    pub env: CgiEnvironment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CgiLimits {
    pub timeout: Duration,
    pub max_output: usize,
}

/// A running CGI child.
///
/// The request body is spilled to an anonymous temporary file that becomes
/// the child's stdin, and stdout goes to another one, so the child never
/// blocks on a pipe the event loop is not draining. The child leads its own
/// process group; on timeout the whole group is killed. The child is always
/// reaped, at the latest when the runner is dropped.
#[derive(Debug)]
pub struct CgiRunner {
    child: Child,
    stdout: File,
    pidfd: Option<OwnedFd>,
    deadline: Instant,
    limits: CgiLimits,
    reaped: bool,
}

impl CgiRunner {
    pub fn spawn(invocation: &CgiInvocation, body: &[u8], limits: CgiLimits, now: Instant) -> Result<Self, CgiError> {
        let mut stdin = tempfile::tempfile()?;
        stdin.write_all(body)?;
        stdin.seek(SeekFrom::Start(0))?;
        let stdout = tempfile::tempfile()?;
        let child_stdout = stdout.try_clone()?;

        let script = absolute(&invocation.script);
        let interpreter = if invocation.interpreter.components().count() > 1 {
            absolute(&invocation.interpreter)
        } else {
            // Bare name, looked up through PATH
            invocation.interpreter.clone()
        };

        let mut command = Command::new(&interpreter);
        command
            .arg(&script)
            .env_clear()
            .envs(invocation.env.variables())
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(child_stdout))
            .stderr(Stdio::null())
            .process_group(0);
        if let Some(dir) = script.parent() {
            command.current_dir(dir);
        }

        let child = command.spawn().map_err(|source| CgiError::Spawn {
            interpreter: interpreter.clone(),
            source,
        })?;
        let pidfd = open_pidfd(child.id());
        debug!(pid = child.id(), script = %script.display(), interpreter = %interpreter.display(), "CGI started");

        Ok(CgiRunner {
            child,
            stdout,
            pidfd,
            deadline: now + limits.timeout,
            limits,
            reaped: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Descriptor that turns readable when the child exits, if the kernel
    /// supports pidfds
    pub fn wait_fd(&self) -> Option<RawFd> {
        self.pidfd.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Check on the child without blocking.
    ///
    /// `Ok(None)` while it is still running within its deadline. Past the
    /// deadline the process group is killed and `Timeout` returned.
    pub fn poll(&mut self, now: Instant) -> Result<Option<CgiResponse>, CgiError> {
        if self.reaped {
            return Err(CgiError::Malformed("CGI output already collected"));
        }

        match self.child.try_wait()? {
            Some(status) => {
                self.reaped = true;
                self.kill_group();
                self.collect(status).map(Some)
            }
            None if now >= self.deadline => {
                warn!(pid = self.child.id(), timeout = ?self.limits.timeout, "CGI timed out, killing");
                self.kill();
                Err(CgiError::Timeout(self.limits.timeout))
            }
            None => {
                if self.stdout.metadata()?.len() > self.limits.max_output as u64 {
                    self.kill();
                    return Err(CgiError::OutputTooLarge(self.limits.max_output));
                }
                Ok(None)
            }
        }
    }

    fn collect(&mut self, status: ExitStatus) -> Result<CgiResponse, CgiError> {
        debug!(pid = self.child.id(), %status, "CGI exited");
        if !status.success() {
            return Err(CgiError::Exit(status));
        }

        let len = self.stdout.metadata()?.len();
        if len > self.limits.max_output as u64 {
            return Err(CgiError::OutputTooLarge(self.limits.max_output));
        }

        let mut output = Vec::with_capacity(len as usize);
        self.stdout.seek(SeekFrom::Start(0))?;
        self.stdout.read_to_end(&mut output)?;
        CgiResponse::parse(&output)
    }

    /// SIGKILL to the child's process group, so grandchildren go too.
    /// Background jobs a finished script left behind end here as well.
    fn kill_group(&self) {
        let pid = self.child.id() as libc::pid_t;
        unsafe {
            libc::kill(-pid, libc::SIGKILL);
        }
    }

    fn kill(&mut self) {
        let pid = self.child.id();
        self.kill_group();
        let _ = self.child.kill();
        if let Err(e) = self.child.wait() {
            warn!(pid, error = %e, "failed to reap CGI child");
        }
        self.reaped = true;
    }
}

impl Drop for CgiRunner {
    fn drop(&mut self) {
        if !self.reaped {
            self.kill();
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

fn open_pidfd(pid: u32) -> Option<OwnedFd> {
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid as libc::pid_t, 0) };
    if fd < 0 {
        None
    } else {
        Some(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const LIMITS: CgiLimits = CgiLimits {
        timeout: Duration::from_secs(5),
        max_output: 1024 * 1024,
    };

    fn script(dir: &TempDir, name: &str, content: &str) -> CgiInvocation {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        let mut env = CgiEnvironment::new();
        env.set("REQUEST_METHOD", "POST");
        CgiInvocation {
            interpreter: PathBuf::from("/bin/sh"),
            script: path,
            env,
        }
    }

    fn run(invocation: &CgiInvocation, body: &[u8], limits: CgiLimits) -> Result<CgiResponse, CgiError> {
        let mut runner = CgiRunner::spawn(invocation, body, limits, Instant::now())?;
        loop {
            if let Some(response) = runner.poll(Instant::now())? {
                return Ok(response);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    /// Any live (non-zombie) process left in the group led by `pgid`
    fn group_alive(pgid: u32) -> bool {
        fs::read_dir("/proc").unwrap().flatten().any(|entry| {
            let Ok(stat) = fs::read_to_string(entry.path().join("stat")) else {
                return false;
            };
            let Some(rest) = stat.rfind(')').map(|i| &stat[i + 1..]) else {
                return false;
            };
            let fields: Vec<&str> = rest.split_whitespace().collect();
            fields.len() > 2 && fields[0] != "Z" && fields[2] == pgid.to_string()
        })
    }

    #[test]
    fn test_runs_script_with_env_and_stdin() {
        let dir = TempDir::new().unwrap();
        let invocation = script(
            &dir,
            "echo.sh",
            "printf 'Content-Type: text/plain\\r\\n\\r\\n'\nprintf '%s:' \"$REQUEST_METHOD\"\ncat\n",
        );
        let response = run(&invocation, b"payload", LIMITS).unwrap();
        assert_eq!(response.header("Content-Type"), Some("text/plain"));
        assert_eq!(response.body, b"POST:payload");
    }

    #[test]
    fn test_runs_in_script_directory() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("data.txt"), "local").unwrap();
        let invocation = script(&dir, "pwd.sh", "printf '\\n'\ncat data.txt\n");
        assert_eq!(run(&invocation, b"", LIMITS).unwrap().body, b"local");
    }

    #[test]
    fn test_timeout_kills_process_group() {
        let dir = TempDir::new().unwrap();
        let invocation = script(&dir, "slow.sh", "sleep 30 &\nsleep 30\n");
        let limits = CgiLimits {
            timeout: Duration::from_millis(200),
            ..LIMITS
        };

        let mut runner = CgiRunner::spawn(&invocation, b"", limits, Instant::now()).unwrap();
        let pid = runner.pid();
        let err = loop {
            match runner.poll(Instant::now()) {
                Ok(None) => std::thread::sleep(Duration::from_millis(20)),
                Ok(Some(_)) => panic!("script should not finish"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, CgiError::Timeout(_)));
        assert_eq!(err.status(), 504);

        // SIGKILL delivery to the background sleep is asynchronous
        let start = Instant::now();
        while group_alive(pid) && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!group_alive(pid));
    }

    #[test]
    fn test_finished_script_leaves_no_background_jobs() {
        let dir = TempDir::new().unwrap();
        let invocation = script(
            &dir,
            "bg.sh",
            "sleep 30 &\nprintf 'Content-Type: text/plain\\n\\nok'\n",
        );
        let mut runner = CgiRunner::spawn(&invocation, b"", LIMITS, Instant::now()).unwrap();
        let pid = runner.pid();
        let response = loop {
            if let Some(response) = runner.poll(Instant::now()).unwrap() {
                break response;
            }
            std::thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(response.body, b"ok");

        let start = Instant::now();
        while group_alive(pid) && start.elapsed() < Duration::from_secs(2) {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(!group_alive(pid));
    }

    #[test]
    fn test_drop_reaps_running_child() {
        let dir = TempDir::new().unwrap();
        let invocation = script(&dir, "sleep.sh", "sleep 30\n");
        let runner = CgiRunner::spawn(&invocation, b"", LIMITS, Instant::now()).unwrap();
        let pid = runner.pid();
        drop(runner);
        assert!(unsafe { libc::kill(pid as libc::pid_t, 0) } != 0);
    }

    #[test]
    fn test_failing_script() {
        let dir = TempDir::new().unwrap();
        let invocation = script(&dir, "fail.sh", "exit 3\n");
        let err = run(&invocation, b"", LIMITS).unwrap_err();
        assert!(matches!(err, CgiError::Exit(_)));
        assert_eq!(err.status(), 500);
    }

    #[test]
    fn test_output_without_headers() {
        let dir = TempDir::new().unwrap();
        let invocation = script(&dir, "raw.sh", "echo just text\n");
        assert!(matches!(run(&invocation, b"", LIMITS), Err(CgiError::Malformed(_))));
    }

    #[test]
    fn test_output_limit() {
        let dir = TempDir::new().unwrap();
        let invocation = script(&dir, "big.sh", "printf '\\n'\nhead -c 4096 /dev/zero\n");
        let limits = CgiLimits { max_output: 100, ..LIMITS };
        assert!(matches!(run(&invocation, b"", limits), Err(CgiError::OutputTooLarge(100))));
    }

    #[test]
    fn test_missing_interpreter() {
        let dir = TempDir::new().unwrap();
        let mut invocation = script(&dir, "x.sh", "true\n");
        invocation.interpreter = PathBuf::from("/no/such/interpreter");
        let err = CgiRunner::spawn(&invocation, b"", LIMITS, Instant::now()).unwrap_err();
        assert!(matches!(err, CgiError::Spawn { .. }));
    }
}
