use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

pub const DEFAULT_MIME: &str = "application/octet-stream";

/// Extension to content type table, built once per process.
pub struct MimeTypes {
    types: HashMap<&'static str, &'static str>,
}

impl MimeTypes {
    fn build() -> Self {
        let entries: &[(&str, &str)] = &[
            // Text types
            ("html", "text/html"),
            ("htm", "text/html"),
            ("shtml", "text/html"),
            ("css", "text/css"),
            ("csv", "text/csv"),
            ("txt", "text/plain"),
            ("md", "text/markdown"),
            ("xml", "text/xml"),
            ("js", "application/javascript"),
            ("mjs", "application/javascript"),
            ("json", "application/json"),
            // Image types
            ("png", "image/png"),
            ("jpg", "image/jpeg"),
            ("jpeg", "image/jpeg"),
            ("gif", "image/gif"),
            ("svg", "image/svg+xml"),
            ("svgz", "image/svg+xml"),
            ("ico", "image/x-icon"),
            ("bmp", "image/x-ms-bmp"),
            ("tif", "image/tiff"),
            ("tiff", "image/tiff"),
            ("webp", "image/webp"),
            // Font types
            ("woff", "font/woff"),
            ("woff2", "font/woff2"),
            ("ttf", "font/ttf"),
            ("otf", "font/otf"),
            // Application types
            ("pdf", "application/pdf"),
            ("zip", "application/zip"),
            ("tar", "application/x-tar"),
            ("gz", "application/gzip"),
            ("7z", "application/x-7z-compressed"),
            ("rar", "application/x-rar-compressed"),
            ("wasm", "application/wasm"),
            ("bin", "application/octet-stream"),
            ("exe", "application/octet-stream"),
            ("iso", "application/octet-stream"),
            // Video types
            ("mp4", "video/mp4"),
            ("webm", "video/webm"),
            ("mpeg", "video/mpeg"),
            ("mpg", "video/mpeg"),
            ("mov", "video/quicktime"),
            ("avi", "video/x-msvideo"),
            // Audio types
            ("mp3", "audio/mpeg"),
            ("ogg", "audio/ogg"),
            ("wav", "audio/wav"),
            ("flac", "audio/flac"),
            ("m4a", "audio/x-m4a"),
        ];

        MimeTypes {
            types: entries.iter().copied().collect(),
        }
    }

    pub fn global() -> &'static MimeTypes {
        static TABLE: OnceLock<MimeTypes> = OnceLock::new();
        TABLE.get_or_init(MimeTypes::build)
    }

    pub fn get_mime_type(&self, path: &Path) -> &'static str {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| self.types.get(ext.to_ascii_lowercase().as_str()).copied())
            .unwrap_or(DEFAULT_MIME)
    }
}

/// Content type for a file path, by extension
pub fn mime_for(path: &Path) -> &'static str {
    MimeTypes::global().get_mime_type(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_types() {
        assert_eq!(mime_for(Path::new("index.html")), "text/html");
        assert_eq!(mime_for(Path::new("style.CSS")), "text/css");
        assert_eq!(mime_for(Path::new("a/b/photo.jpeg")), "image/jpeg");
        assert_eq!(mime_for(Path::new("notes.txt")), "text/plain");
    }

    #[test]
    fn test_unknown_extension() {
        assert_eq!(mime_for(Path::new("file.unknownext")), DEFAULT_MIME);
        assert_eq!(mime_for(Path::new("Makefile")), DEFAULT_MIME);
    }

    #[test]
    fn test_table_is_shared() {
        assert!(std::ptr::eq(MimeTypes::global(), MimeTypes::global()));
    }
}
