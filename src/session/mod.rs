pub mod cookie;
pub mod session;
pub mod store;

pub use cookie::{Cookie, CookieJar, SESSION_COOKIE};
pub use session::Session;
pub use store::SessionStore;
