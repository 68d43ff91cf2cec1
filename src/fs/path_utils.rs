use std::io;
use std::path::{Path, PathBuf};

use crate::http::status;

/// Join a decoded request path onto `base` without leaving it.
///
/// `..` segments are refused outright rather than resolved. When the
/// target exists its canonical form must still sit under `base`, which
/// catches symlinks pointing elsewhere.
pub fn safe_path_join(base: &Path, request_path: &str) -> io::Result<PathBuf> {
    let mut result = base.to_path_buf();

    for component in request_path.split('/') {
        match component {
            "" | "." => continue,
            ".." => {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "directory traversal not allowed",
                ));
            }
            comp if comp.contains('\0') => {
                return Err(io::Error::new(io::ErrorKind::InvalidInput, "NUL byte in path"));
            }
            comp => result.push(comp),
        }
    }

    if let (Ok(canonical_base), Ok(canonical_result)) = (base.canonicalize(), result.canonicalize()) {
        if !canonical_result.starts_with(&canonical_base) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "path escapes its base directory",
            ));
        }
    }

    Ok(result)
}

/// Status code for a filesystem failure
pub fn status_for_io_error(err: &io::Error) -> u16 {
    match err.kind() {
        io::ErrorKind::NotFound => status::NOT_FOUND,
        io::ErrorKind::PermissionDenied => status::FORBIDDEN,
        io::ErrorKind::InvalidInput => status::BAD_REQUEST,
        io::ErrorKind::AlreadyExists => status::CONFLICT,
        _ => status::INTERNAL_SERVER_ERROR,
    }
}
