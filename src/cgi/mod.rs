pub mod environment;
pub mod error;
pub mod executor;
pub mod response;

pub use environment::{CgiEnvironment, ServerInfo};
pub use error::CgiError;
pub use executor::{CgiInvocation, CgiLimits, CgiRunner};
pub use response::CgiResponse;
