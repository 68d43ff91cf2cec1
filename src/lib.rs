//! Single-process HTTP/1.1 server driven by one epoll loop: virtual hosts,
//! static files, directory listings, uploads, CGI and sessions.

pub mod cgi;
pub mod config;
pub mod errors;
pub mod fs;
pub mod http;
pub mod mime;
pub mod net;
pub mod routing;
pub mod server;
pub mod session;
pub mod upload;

pub use config::{Config, ConfigError};
pub use server::Server;
