pub mod router;
pub mod route;
pub mod handler;

pub use router::{RoutingTable, VirtualHosts};
pub use route::Route;
pub use handler::{handle, HandlerResult};
