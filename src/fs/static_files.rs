use std::fs::{self, File, Metadata};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::server::Policy;
use crate::errors::error_response;
use crate::fs::autoindex;
use crate::fs::path_utils::status_for_io_error;
use crate::http::response::Response;
use crate::http::status;
use crate::mime::mime_for;

const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// What a GET path resolved to on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    File(PathBuf),
    /// Directory with none of the index files present
    Directory(PathBuf),
}

impl Target {
    pub fn path(&self) -> &Path {
        match self {
            Target::File(p) | Target::Directory(p) => p,
        }
    }
}

/// Serves files and listings under one policy
pub struct StaticFileServer<'a> {
    policy: &'a Policy,
}

impl<'a> StaticFileServer<'a> {
    pub fn new(policy: &'a Policy) -> Self {
        StaticFileServer { policy }
    }

    /// Resolve a filesystem path, trying each index file in order when it
    /// names a directory.
    pub fn resolve(&self, path: &Path) -> io::Result<Target> {
        let metadata = fs::metadata(path)?;
        if !metadata.is_dir() {
            return Ok(Target::File(path.to_path_buf()));
        }

        for index in &self.policy.index {
            let candidate = path.join(index);
            if candidate.is_file() {
                return Ok(Target::File(candidate));
            }
        }
        Ok(Target::Directory(path.to_path_buf()))
    }

    /// Response for a resolved target. `request_path` is the URL shown in
    /// directory listings.
    pub fn serve(&self, target: &Target, request_path: &str) -> Response {
        match target {
            Target::File(path) => match read_file(path) {
                Ok((content, metadata)) => {
                    let mut response = Response::with_body(status::OK, content, mime_for(path));
                    if let Ok(modified) = metadata.modified() {
                        let modified: DateTime<Utc> = modified.into();
                        response.set_header(
                            "Last-Modified",
                            &modified.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
                        );
                    }
                    response
                }
                Err(e) => self.failure(path, &e),
            },
            Target::Directory(path) if self.policy.autoindex => match autoindex::render(path, request_path) {
                Ok(html) => Response::with_body(status::OK, html, "text/html"),
                Err(e) => self.failure(path, &e),
            },
            Target::Directory(_) => error_response(status::NOT_FOUND, self.policy),
        }
    }

    fn failure(&self, path: &Path, err: &io::Error) -> Response {
        let code = status_for_io_error(err);
        if code == status::INTERNAL_SERVER_ERROR {
            warn!(path = %path.display(), error = %err, "failed to read file");
        }
        error_response(code, self.policy)
    }
}

fn read_file(path: &Path) -> io::Result<(Vec<u8>, Metadata)> {
    let mut file = File::open(path)?;
    let metadata = file.metadata()?;

    if metadata.len() > MAX_FILE_SIZE {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "file too large to serve"));
    }

    let mut content = Vec::with_capacity(metadata.len() as usize);
    file.read_to_end(&mut content)?;
    Ok((content, metadata))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn policy(root: &Path) -> Policy {
        Policy {
            root: root.to_path_buf(),
            ..Policy::default()
        }
    }

    #[test]
    fn test_serve_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("test.txt"), "Hello, World!").unwrap();

        let policy = policy(temp_dir.path());
        let server = StaticFileServer::new(&policy);
        let target = server.resolve(&temp_dir.path().join("test.txt")).unwrap();
        let response = server.serve(&target, "/test.txt");

        assert_eq!(response.status(), 200);
        assert_eq!(response.body(), b"Hello, World!");
        assert_eq!(response.header("Content-Type"), Some("text/plain"));
        assert!(response.header("Last-Modified").unwrap().ends_with("GMT"));
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let policy = policy(temp_dir.path());
        let server = StaticFileServer::new(&policy);
        let err = server.resolve(&temp_dir.path().join("nope")).unwrap_err();
        assert_eq!(status_for_io_error(&err), 404);
    }

    #[test]
    fn test_index_files_tried_in_order() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("home.html"), "home").unwrap();
        fs::write(temp_dir.path().join("index.html"), "index").unwrap();

        let mut policy = policy(temp_dir.path());
        policy.index = vec!["missing.html".into(), "home.html".into(), "index.html".into()];
        let server = StaticFileServer::new(&policy);

        let target = server.resolve(temp_dir.path()).unwrap();
        assert_eq!(target, Target::File(temp_dir.path().join("home.html")));
        assert_eq!(server.serve(&target, "/").body(), b"home");
    }

    #[test]
    fn test_directory_without_index_or_autoindex() {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir(temp_dir.path().join("ping")).unwrap();

        let policy = policy(temp_dir.path());
        let server = StaticFileServer::new(&policy);
        let target = server.resolve(&temp_dir.path().join("ping")).unwrap();
        assert!(matches!(target, Target::Directory(_)));
        assert_eq!(server.serve(&target, "/ping").status(), 404);
    }

    #[test]
    fn test_directory_with_autoindex() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a.txt"), "a").unwrap();
        fs::create_dir(temp_dir.path().join("sub")).unwrap();

        let mut policy = policy(temp_dir.path());
        policy.autoindex = true;
        let server = StaticFileServer::new(&policy);
        let target = server.resolve(temp_dir.path()).unwrap();
        let response = server.serve(&target, "/files/");

        assert_eq!(response.status(), 200);
        let body = String::from_utf8_lossy(response.body()).into_owned();
        assert!(body.find("sub/").unwrap() < body.find("a.txt").unwrap());
    }
}
