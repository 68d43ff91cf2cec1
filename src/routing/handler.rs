use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, info};

use crate::cgi::environment::{CgiEnvironment, ServerInfo};
use crate::cgi::executor::CgiInvocation;
use crate::config::server::{Policy, Redirect};
use crate::errors::{error_response, html_escape};
use crate::fs::path_utils::{safe_path_join, status_for_io_error};
use crate::fs::static_files::{StaticFileServer, Target};
use crate::http::request::{Method, Request};
use crate::http::response::Response;
use crate::http::status;
use crate::routing::route::Route;
use crate::upload::file_storage::FileStorage;
use crate::upload::multipart::FieldType;

/// Result of handling a request
#[derive(Debug)]
pub enum HandlerResult {
    /// Response is ready to send
    Response(Response),
    /// A CGI script has to run first
    Cgi(CgiInvocation),
}

impl HandlerResult {
    fn error(code: u16, policy: &Policy) -> Self {
        HandlerResult::Response(error_response(code, policy))
    }

    fn io_error(err: &io::Error, policy: &Policy) -> Self {
        HandlerResult::error(status_for_io_error(err), policy)
    }
}

/// Produce the response for a parsed or rejected request.
///
/// Checks run in a fixed order: parser rejection, redirect, method
/// allow-list, body limit, path safety. Only then does the CGI mapping or
/// a method handler get to touch the filesystem.
pub fn handle(request: &Request, route: &Route<'_>, server: &ServerInfo<'_>) -> HandlerResult {
    let policy = route.policy;

    if let Some(code) = request.status() {
        return HandlerResult::error(code, policy);
    }
    let Some(method) = request.method else {
        return HandlerResult::error(status::BAD_REQUEST, policy);
    };

    if let Some(redirect) = &policy.redirect {
        return HandlerResult::Response(redirect_response(redirect));
    }
    if !policy.allows(method) {
        return HandlerResult::error(status::METHOD_NOT_ALLOWED, policy);
    }
    if request.body.len() > policy.body_limit {
        return HandlerResult::error(status::PAYLOAD_TOO_LARGE, policy);
    }

    let path = match safe_path_join(&policy.root, &request.path) {
        Ok(path) => path,
        Err(e) => return HandlerResult::io_error(&e, policy),
    };

    if let Some(interpreter) = policy.cgi_interpreter(&path) {
        return match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => cgi_invocation(request, &path, interpreter, server),
            Ok(_) => HandlerResult::error(status::FORBIDDEN, policy),
            Err(e) => HandlerResult::io_error(&e, policy),
        };
    }

    match method {
        Method::GET => handle_get(request, policy, &path, server),
        Method::POST => handle_upload(request, route),
        Method::DELETE => handle_delete(request, route),
        _ => HandlerResult::error(status::NOT_IMPLEMENTED, policy),
    }
}

fn redirect_response(redirect: &Redirect) -> Response {
    let mut response = Response::redirect(redirect.code, &redirect.target);
    let target = html_escape(&redirect.target);
    let body = format!(
        "<!DOCTYPE html>\n<html><head><title>Redirect</title></head>\n<body><h1>Redirecting...</h1>\n\
         <p>If you are not redirected automatically, <a href=\"{}\">click here</a>.</p></body></html>\n",
        target
    );
    response.set_body(body, "text/html");
    response
}

fn cgi_invocation(request: &Request, script: &Path, interpreter: &Path, server: &ServerInfo<'_>) -> HandlerResult {
    HandlerResult::Cgi(CgiInvocation {
        interpreter: interpreter.to_path_buf(),
        script: script.to_path_buf(),
        env: CgiEnvironment::from_request(request, script, server),
    })
}

fn handle_get(request: &Request, policy: &Policy, path: &Path, server: &ServerInfo<'_>) -> HandlerResult {
    let files = StaticFileServer::new(policy);
    let target = match files.resolve(path) {
        Ok(target) => target,
        Err(e) => return HandlerResult::io_error(&e, policy),
    };

    if let Target::File(file) = &target {
        // An index file may itself be a script
        if let Some(interpreter) = policy.cgi_interpreter(file) {
            return cgi_invocation(request, file, interpreter, server);
        }
    }
    HandlerResult::Response(files.serve(&target, &request.path))
}

/// Write uploaded content under the policy's upload directory.
///
/// Multipart file parts land in the directory named by the request path,
/// each under its sanitized client filename. Any other body is written to
/// the request path itself, or to a generated name when that path is a
/// directory.
fn handle_upload(request: &Request, route: &Route<'_>) -> HandlerResult {
    let policy = route.policy;
    let Some(upload_dir) = &policy.upload_path else {
        return HandlerResult::error(status::FORBIDDEN, policy);
    };
    let storage = FileStorage::new(upload_dir);
    let relative = route.relative_path(&request.path);
    let target = match storage.resolve(relative) {
        Ok(target) => target,
        Err(e) => return HandlerResult::io_error(&e, policy),
    };

    if request.is_multipart() {
        let files: Vec<(&str, &[u8])> = request
            .parts
            .iter()
            .filter_map(|part| match &part.field_type {
                FieldType::File { filename, data, .. } => Some((filename.as_str(), data.as_slice())),
                _ => None,
            })
            .collect();
        if files.is_empty() {
            return HandlerResult::error(status::BAD_REQUEST, policy);
        }
        match storage.store_all(&target, &files) {
            Ok(stored) => {
                for file in &stored {
                    info!(path = %file.file_path.display(), size = file.size, "file uploaded");
                }
            }
            Err(e) => return HandlerResult::io_error(&e, policy),
        }
    } else {
        let into_dir = relative.is_empty() || request.path.ends_with('/') || target.is_dir();
        let result = if into_dir {
            storage.store_generated(&target, request.content_type(), &request.body)
        } else {
            storage.store_at(&target, &request.body)
        };
        match result {
            Ok(file) => info!(path = %file.file_path.display(), size = file.size, "file uploaded"),
            Err(e) => return HandlerResult::io_error(&e, policy),
        }
    }

    HandlerResult::Response(Response::new(status::NO_CONTENT))
}

fn handle_delete(request: &Request, route: &Route<'_>) -> HandlerResult {
    let policy = route.policy;
    let Some(upload_dir) = &policy.upload_path else {
        return HandlerResult::error(status::FORBIDDEN, policy);
    };
    let storage = FileStorage::new(upload_dir);
    let result = storage
        .resolve(route.relative_path(&request.path))
        .and_then(|path| storage.delete_file(&path).map(|_| path));

    match result {
        Ok(path) => {
            debug!(path = %path.display(), "file deleted");
            HandlerResult::Response(Response::new(status::NO_CONTENT))
        }
        Err(e) => HandlerResult::io_error(&e, policy),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::server::{AllowedMethods, Location, ServerBlock};
    use crate::http::parse::{ParseLimits, Progress, RequestParser};
    use std::collections::BTreeMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn parse(raw: &[u8]) -> Request {
        let mut parser = RequestParser::new(ParseLimits::default());
        let mut progress = parser.feed(raw);
        while progress == Progress::HeadersReady {
            progress = parser.feed(&[]);
        }
        parser.take_request()
    }

    fn info() -> ServerInfo<'static> {
        ServerInfo {
            server_name: "localhost",
            server_port: 8080,
            remote_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    fn run(policy: Policy, raw: &[u8]) -> HandlerResult {
        let server = ServerBlock {
            policy,
            ..ServerBlock::default()
        };
        let request = parse(raw);
        handle(&request, &Route::server_only(&server), &info())
    }

    fn response(policy: Policy, raw: &[u8]) -> Response {
        match run(policy, raw) {
            HandlerResult::Response(response) => response,
            HandlerResult::Cgi(inv) => panic!("unexpected CGI invocation {:?}", inv.script),
        }
    }

    fn fixture() -> (TempDir, Policy) {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("hello.txt"), "hello").unwrap();
        fs::create_dir(dir.path().join("ping")).unwrap();
        fs::create_dir(dir.path().join("uploads")).unwrap();
        let policy = Policy {
            root: dir.path().to_path_buf(),
            ..Policy::default()
        };
        (dir, policy)
    }

    fn post(path: &str, body: &str) -> Vec<u8> {
        format!(
            "POST {} HTTP/1.1\r\nHost: x\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
            path,
            body.len(),
            body
        )
        .into_bytes()
    }

    #[test]
    fn test_get_file() {
        let (_dir, policy) = fixture();
        let response = response(policy, b"GET /hello.txt HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(response.status(), 200);
        assert_eq!(response.body(), b"hello");
    }

    #[test]
    fn test_directory_without_index_is_not_found() {
        let (_dir, mut policy) = fixture();
        policy.methods = AllowedMethods::none();
        policy.methods.allow(Method::GET);
        let response = response(policy, b"GET /ping HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(response.status(), 404);
    }

    #[test]
    fn test_missing_file_uses_custom_error_page() {
        let (dir, mut policy) = fixture();
        let page = dir.path().join("404.html");
        fs::write(&page, "custom missing").unwrap();
        policy.error_pages = BTreeMap::from([(404, page)]);

        let response = response(policy, b"GET /missing HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(response.status(), 404);
        assert_eq!(response.body(), b"custom missing");
    }

    #[test]
    fn test_rejected_request_gets_error_page() {
        let (_dir, policy) = fixture();
        let response = response(policy, b"PUT / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(response.status(), 501);
    }

    #[test]
    fn test_redirect_short_circuits() {
        let (_dir, mut policy) = fixture();
        policy.redirect = Some(Redirect {
            code: 301,
            target: "http://google.fr/".into(),
        });
        policy.methods = AllowedMethods::none();

        let response = response(policy, b"DELETE /anything HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(response.status(), 301);
        assert_eq!(response.header("Location"), Some("http://google.fr/"));
    }

    #[test]
    fn test_method_not_allowed() {
        let (_dir, mut policy) = fixture();
        policy.methods = AllowedMethods::none();
        policy.methods.allow(Method::GET);
        let response = response(policy, b"DELETE /hello.txt HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(response.status(), 405);
        assert_eq!(response.header("Allow"), Some("GET"));
    }

    #[test]
    fn test_body_limit() {
        let (_dir, mut policy) = fixture();
        policy.body_limit = 4;
        policy.upload_path = Some(PathBuf::from("/nonexistent"));
        let response = response(policy, &post("/x", "too long"));
        assert_eq!(response.status(), 413);
    }

    #[test]
    fn test_traversal_forbidden() {
        let (_dir, policy) = fixture();
        let response = response(policy, b"GET /../etc/passwd HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(response.status(), 403);
    }

    #[test]
    fn test_upload_then_conflict() {
        let (dir, mut policy) = fixture();
        policy.upload_path = Some(dir.path().join("uploads"));

        assert_eq!(response(policy.clone(), &post("/note.txt", "one")).status(), 204);
        assert_eq!(fs::read(dir.path().join("uploads/note.txt")).unwrap(), b"one");
        assert_eq!(response(policy, &post("/note.txt", "two")).status(), 409);
    }

    #[test]
    fn test_upload_to_directory_generates_name() {
        let (dir, mut policy) = fixture();
        policy.upload_path = Some(dir.path().join("uploads"));
        assert_eq!(response(policy, &post("/", "data")).status(), 204);
        let entries: Vec<_> = fs::read_dir(dir.path().join("uploads")).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_upload_without_upload_path() {
        let (_dir, policy) = fixture();
        assert_eq!(response(policy, &post("/x", "data")).status(), 403);
    }

    #[test]
    fn test_multipart_upload() {
        let (dir, mut policy) = fixture();
        policy.upload_path = Some(dir.path().join("uploads"));
        let body = "--B\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhi\r\n\
                    --B\r\nContent-Disposition: form-data; name=\"f\"; filename=\"a b.txt\"\r\n\
                    Content-Type: text/plain\r\n\r\nFILE\r\n--B--\r\n";
        let raw = format!(
            "POST / HTTP/1.1\r\nHost: x\r\nContent-Type: multipart/form-data; boundary=B\r\n\
             Content-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        assert_eq!(response(policy, raw.as_bytes()).status(), 204);
        assert_eq!(fs::read(dir.path().join("uploads/a_b.txt")).unwrap(), b"FILE");
    }

    #[test]
    fn test_multipart_conflict_stores_no_part() {
        let (dir, mut policy) = fixture();
        policy.upload_path = Some(dir.path().join("uploads"));
        fs::write(dir.path().join("uploads/b.txt"), "old").unwrap();
        let body = "--B\r\nContent-Disposition: form-data; name=\"a\"; filename=\"a.txt\"\r\n\r\nA\r\n\
                    --B\r\nContent-Disposition: form-data; name=\"b\"; filename=\"b.txt\"\r\n\r\nB\r\n--B--\r\n";
        let raw = format!(
            "POST / HTTP/1.1\r\nHost: x\r\nContent-Type: multipart/form-data; boundary=B\r\n\
             Content-Length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        assert_eq!(response(policy, raw.as_bytes()).status(), 409);
        assert!(!dir.path().join("uploads/a.txt").exists());
        assert_eq!(fs::read(dir.path().join("uploads/b.txt")).unwrap(), b"old");
    }

    #[test]
    fn test_delete_is_idempotent_in_outcome() {
        let (dir, mut policy) = fixture();
        policy.upload_path = Some(dir.path().join("uploads"));
        fs::write(dir.path().join("uploads/victim"), "x").unwrap();

        let raw = b"DELETE /victim HTTP/1.1\r\nHost: x\r\n\r\n";
        assert_eq!(response(policy.clone(), raw).status(), 204);
        assert_eq!(response(policy.clone(), raw).status(), 404);

        let raw = b"DELETE / HTTP/1.1\r\nHost: x\r\n\r\n";
        assert_eq!(response(policy, raw).status(), 403);
    }

    #[test]
    fn test_delete_relative_to_location() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("file_a"), "x").unwrap();
        let server = ServerBlock {
            locations: vec![Location {
                prefix: "/uploads".into(),
                policy: Policy {
                    upload_path: Some(dir.path().to_path_buf()),
                    ..Policy::default()
                },
            }],
            ..ServerBlock::default()
        };
        let route = Route::at_location(&server, &server.locations[0]);
        let request = parse(b"DELETE /uploads/file_a HTTP/1.1\r\nHost: x\r\n\r\n");
        match handle(&request, &route, &info()) {
            HandlerResult::Response(r) => assert_eq!(r.status(), 204),
            HandlerResult::Cgi(_) => panic!("expected a response"),
        }
        assert!(!dir.path().join("file_a").exists());
    }

    #[test]
    fn test_cgi_mapping() {
        let (dir, mut policy) = fixture();
        fs::write(dir.path().join("run.sh"), "echo").unwrap();
        fs::write(dir.path().join("ping/index.sh"), "echo").unwrap();
        policy.cgi.insert(".sh".into(), PathBuf::from("/bin/sh"));
        policy.index = vec!["index.sh".into()];

        match run(policy.clone(), b"GET /run.sh?x=1 HTTP/1.1\r\nHost: x\r\n\r\n") {
            HandlerResult::Cgi(inv) => {
                assert_eq!(inv.interpreter, PathBuf::from("/bin/sh"));
                assert_eq!(inv.script, dir.path().join("run.sh"));
                assert_eq!(inv.env.get("QUERY_STRING"), Some("x=1"));
            }
            HandlerResult::Response(r) => panic!("expected CGI, got {}", r.status()),
        }

        match run(policy.clone(), b"GET /ping/ HTTP/1.1\r\nHost: x\r\n\r\n") {
            HandlerResult::Cgi(inv) => assert_eq!(inv.script, dir.path().join("ping/index.sh")),
            HandlerResult::Response(r) => panic!("expected CGI, got {}", r.status()),
        }

        let response = response(policy, b"GET /missing.sh HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(response.status(), 404);
    }
}
