use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

use chrono::{DateTime, Local};

use crate::errors::html_escape;

#[derive(Debug, Clone)]
struct Entry {
    name: String,
    is_dir: bool,
    modified: Option<SystemTime>,
    size: u64,
}

/// HTML listing of `dir`, shown under the URL `request_path`.
///
/// Subdirectories come first, then files, each group sorted by name.
/// Directory sizes are shown as `-`.
pub fn render(dir: &Path, request_path: &str) -> io::Result<String> {
    let mut dirs = Vec::new();
    let mut files = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        // Entries that vanish or cannot be stat'ed are skipped
        let Ok(metadata) = fs::metadata(entry.path()) else {
            continue;
        };
        let item = Entry {
            name,
            is_dir: metadata.is_dir(),
            modified: metadata.modified().ok(),
            size: metadata.len(),
        };
        if item.is_dir {
            dirs.push(item);
        } else {
            files.push(item);
        }
    }

    dirs.sort_by(|a, b| a.name.cmp(&b.name));
    files.sort_by(|a, b| a.name.cmp(&b.name));

    let base = if request_path.ends_with('/') {
        request_path.to_string()
    } else {
        format!("{}/", request_path)
    };
    let title = format!("Index of {}", html_escape(&base));

    let mut html = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{title}</title></head>\n<body>\n<h1>{title}</h1>\n<hr>\n<table>\n\
         <tr><th>Name</th><th>Last Modified</th><th>Size</th></tr>\n",
        title = title
    );

    if base != "/" {
        html.push_str(&format!(
            "<tr><td><a href=\"{}\">../</a></td><td></td><td>-</td></tr>\n",
            html_escape(&parent_of(&base))
        ));
    }

    for entry in dirs.iter().chain(files.iter()) {
        let display = if entry.is_dir {
            format!("{}/", entry.name)
        } else {
            entry.name.clone()
        };
        let href = format!("{}{}", base, encode_segment(&display));
        let size = if entry.is_dir {
            "-".to_string()
        } else {
            entry.size.to_string()
        };
        html.push_str(&format!(
            "<tr><td><a href=\"{}\">{}</a></td><td>{}</td><td>{}</td></tr>\n",
            html_escape(&href),
            html_escape(&display),
            format_time(entry.modified),
            size
        ));
    }

    html.push_str("</table>\n<hr>\n</body>\n</html>\n");
    Ok(html)
}

fn format_time(time: Option<SystemTime>) -> String {
    match time {
        Some(t) => DateTime::<Local>::from(t).format("%d-%b-%Y %H:%M").to_string(),
        None => "-".to_string(),
    }
}

/// `/a/b/` -> `/a/`
fn parent_of(base: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(i) => trimmed[..=i].to_string(),
        None => "/".to_string(),
    }
}

/// Percent-encode a name for use in an href, keeping a trailing `/`
fn encode_segment(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}
