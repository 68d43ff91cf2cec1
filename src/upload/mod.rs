pub mod multipart;
pub mod form_data;
pub mod file_storage;

pub use multipart::{MultipartParser, MultipartField, FieldType};
pub use form_data::FormData;
pub use file_storage::{FileStorage, UploadedFile};
