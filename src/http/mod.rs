pub mod chunked;
pub mod parse;
pub mod request;
pub mod response;
pub mod status;

pub use parse::{ParseLimits, ParseState, Progress, RequestParser};
pub use request::{BodyFraming, Headers, Method, Request};
pub use response::Response;
