#![allow(dead_code)]

use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use webserv::config::ConfigParser;
use webserv::net::ServerStats;
use webserv::Server;

/// A server running on an ephemeral port in a background thread, with a
/// scratch document tree. Stopped and joined on drop.
pub struct TestServer {
    pub addr: SocketAddr,
    pub dir: TempDir,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<ServerStats>>,
}

impl TestServer {
    /// `{root}` in the configuration text is replaced by the scratch
    /// directory. `prepare` populates it before the server starts.
    pub fn start(config: &str, prepare: impl FnOnce(&Path)) -> TestServer {
        let dir = TempDir::new().unwrap();
        prepare(dir.path());

        let text = config.replace("{root}", &dir.path().display().to_string());
        let config = ConfigParser::parse_str(&text).unwrap();
        let mut server = Server::from_config(&config).unwrap();
        let addr = server.local_addrs()[0];
        let shutdown = server.shutdown_handle();
        let handle = thread::spawn(move || server.run().unwrap());

        TestServer {
            addr,
            dir,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    pub fn connect(&self) -> TcpStream {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        stream
    }

    /// Send one raw request and read the response
    pub fn send(&self, raw: &[u8]) -> HttpResponse {
        let mut stream = self.connect();
        stream.write_all(raw).unwrap();
        read_response(&mut stream)
    }

    pub fn get(&self, path: &str) -> HttpResponse {
        self.send(format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).as_bytes())
    }

    /// Stop the loop and hand back its counters
    pub fn stop(mut self) -> ServerStats {
        self.shutdown.store(true, Ordering::SeqCst);
        self.handle.take().unwrap().join().unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Read exactly one response framed by its Content-Length
pub fn read_response(stream: &mut TcpStream) -> HttpResponse {
    let mut reader = BufReader::new(stream);

    let mut status_line = String::new();
    reader.read_line(&mut status_line).unwrap();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| panic!("bad status line: {:?}", status_line));

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').unwrap();
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let length: usize = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .map(|(_, v)| v.parse().unwrap())
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).unwrap();

    HttpResponse { status, headers, body }
}

/// A process exists and has not merely exited unreaped
pub fn process_alive(pid: u32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };
    let state = stat.rfind(')').and_then(|i| stat[i + 1..].split_whitespace().next());
    !matches!(state, Some("Z") | None)
}

pub fn write_script(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}
