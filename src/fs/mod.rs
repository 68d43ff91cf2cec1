pub mod autoindex;
pub mod path_utils;
pub mod static_files;

pub use path_utils::{safe_path_join, status_for_io_error};
pub use static_files::{StaticFileServer, Target};
