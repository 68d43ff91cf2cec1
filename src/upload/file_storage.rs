use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::fs::path_utils::safe_path_join;

static UPLOAD_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A file written by [`FileStorage`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    /// Original filename from the client
    pub original_filename: Option<String>,
    pub file_path: PathBuf,
    pub size: usize,
}

/// Uploads and deletions confined to one directory.
///
/// Files are only ever created, never overwritten: an existing target fails
/// with `AlreadyExists`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    upload_dir: PathBuf,
}

impl FileStorage {
    pub fn new<P: AsRef<Path>>(upload_dir: P) -> Self {
        FileStorage {
            upload_dir: upload_dir.as_ref().to_path_buf(),
        }
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Path for a request path relative to the upload directory
    pub fn resolve(&self, relative: &str) -> io::Result<PathBuf> {
        safe_path_join(&self.upload_dir, relative)
    }

    /// Store multipart file parts under `dir`, each named after the
    /// client's sanitized filename.
    ///
    /// All or nothing: every name is checked before the first write, and a
    /// write that still fails removes the files stored before it.
    pub fn store_all(&self, dir: &Path, parts: &[(&str, &[u8])]) -> io::Result<Vec<UploadedFile>> {
        if !dir.is_dir() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "upload directory does not exist"));
        }

        let mut targets: Vec<PathBuf> = Vec::with_capacity(parts.len());
        for (original, _) in parts {
            let sanitized = sanitize_filename(original);
            if sanitized.is_empty() {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "unusable upload filename"));
            }
            let path = dir.join(&sanitized);
            if targets.contains(&path) || fs::symlink_metadata(&path).is_ok() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} already exists", sanitized),
                ));
            }
            targets.push(path);
        }

        let mut stored: Vec<UploadedFile> = Vec::with_capacity(parts.len());
        for ((original, data), path) in parts.iter().zip(targets) {
            if let Err(e) = write_new(&path, data) {
                for file in &stored {
                    let _ = fs::remove_file(&file.file_path);
                }
                return Err(e);
            }
            stored.push(UploadedFile {
                original_filename: Some(original.to_string()),
                file_path: path,
                size: data.len(),
            });
        }
        Ok(stored)
    }

    /// Store a raw body at exactly `path`
    pub fn store_at(&self, path: &Path, data: &[u8]) -> io::Result<UploadedFile> {
        write_new(path, data)?;
        Ok(UploadedFile {
            original_filename: None,
            file_path: path.to_path_buf(),
            size: data.len(),
        })
    }

    /// Store a raw body under `dir` with a generated name
    pub fn store_generated(&self, dir: &Path, content_type: Option<&str>, data: &[u8]) -> io::Result<UploadedFile> {
        let extension = content_type.and_then(extension_from_content_type).unwrap_or("bin");
        loop {
            let path = dir.join(generate_filename(extension));
            match write_new(&path, data) {
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
                Ok(()) => {
                    return Ok(UploadedFile {
                        original_filename: None,
                        file_path: path,
                        size: data.len(),
                    })
                }
            }
        }
    }

    /// Remove a stored file. Directories are refused.
    pub fn delete_file(&self, path: &Path) -> io::Result<()> {
        let metadata = fs::symlink_metadata(path)?;
        if metadata.is_dir() {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "refusing to delete a directory"));
        }
        fs::remove_file(path)
    }
}

fn write_new(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(data)
}

fn generate_filename(extension: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let n = UPLOAD_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("upload_{}_{}.{}", nanos, n, extension)
}

/// Reduce a client filename to one safe path component. Directory parts,
/// `.` and `..` segments are dropped and the rest joined with `_`. Outside
/// alphanumerics, `.`, `-` and `_` every character becomes `_`, runs of
/// dots collapse to one, and leading or trailing dots are trimmed.
fn sanitize_filename(filename: &str) -> String {
    let joined = filename
        .split(['/', '\\'])
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .collect::<Vec<_>>()
        .join("_");

    let mut clean = String::with_capacity(joined.len());
    for c in joined.chars() {
        let c = if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' };
        if c == '.' && clean.ends_with('.') {
            continue;
        }
        clean.push(c);
    }
    clean.trim_matches('.').to_string()
}

fn extension_from_content_type(content_type: &str) -> Option<&'static str> {
    let essence = content_type.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    match essence.as_str() {
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/gif" => Some("gif"),
        "text/plain" => Some("txt"),
        "text/html" => Some("html"),
        "text/css" => Some("css"),
        "application/json" => Some("json"),
        "application/pdf" => Some("pdf"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("test.txt"), "test.txt");
        assert_eq!(sanitize_filename("../../../etc/passwd"), "etc_passwd");
        assert_eq!(sanitize_filename("C:\\Users\\me\\photo.png"), "C__Users_me_photo.png");
        assert_eq!(sanitize_filename("file with spaces.txt"), "file_with_spaces.txt");
        assert_eq!(sanitize_filename("file:with*bad?chars.txt"), "file_with_bad_chars.txt");
        assert_eq!(sanitize_filename("archive..tar...gz"), "archive.tar.gz");
        assert_eq!(sanitize_filename(".."), "");
        assert_eq!(sanitize_filename(".hidden"), "hidden");
    }

    #[test]
    fn test_extension_from_content_type() {
        assert_eq!(extension_from_content_type("image/jpeg"), Some("jpg"));
        assert_eq!(extension_from_content_type("text/plain; charset=utf-8"), Some("txt"));
        assert_eq!(extension_from_content_type("application/unknown"), None);
    }

    #[test]
    fn test_store_refuses_overwrite() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());

        let stored = storage.store_all(dir.path(), &[("hello.txt", &b"one"[..])]).unwrap();
        assert_eq!(stored[0].size, 3);
        assert_eq!(fs::read(&stored[0].file_path).unwrap(), &b"one"[..]);

        let err = storage.store_all(dir.path(), &[("hello.txt", &b"two"[..])]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(fs::read(dir.path().join("hello.txt")).unwrap(), &b"one"[..]);
    }

    #[test]
    fn test_store_all_writes_nothing_on_conflict() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        fs::write(dir.path().join("b.txt"), "old").unwrap();

        let err = storage
            .store_all(dir.path(), &[("a.txt", &b"new a"[..]), ("b.txt", &b"new b"[..])])
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert!(!dir.path().join("a.txt").exists());
        assert_eq!(fs::read(dir.path().join("b.txt")).unwrap(), b"old");

        // Two parts that sanitize to the same name conflict with each other
        let err = storage
            .store_all(dir.path(), &[("c d.txt", &b"1"[..]), ("c_d.txt", &b"2"[..])])
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert!(!dir.path().join("c_d.txt").exists());
    }

    #[test]
    fn test_generated_names_are_unique() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        let a = storage.store_generated(dir.path(), Some("text/plain"), b"a").unwrap();
        let b = storage.store_generated(dir.path(), None, b"b").unwrap();
        assert_ne!(a.file_path, b.file_path);
        assert_eq!(a.file_path.extension().unwrap(), "txt");
        assert_eq!(b.file_path.extension().unwrap(), "bin");
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        let path = storage.resolve("/victim").unwrap();
        storage.store_at(&path, b"x").unwrap();

        storage.delete_file(&path).unwrap();
        let err = storage.delete_file(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);

        fs::create_dir(dir.path().join("sub")).unwrap();
        let err = storage.delete_file(&dir.path().join("sub")).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let dir = TempDir::new().unwrap();
        let storage = FileStorage::new(dir.path());
        assert!(storage.resolve("/../outside").is_err());
    }
}
