pub mod conn;
pub mod control;
pub mod epoll;
pub mod event_loop;
pub mod listener;
pub mod stats;
pub mod timeout;

pub use conn::{Connection, Context, Outcome};
pub use epoll::{Events, Interest, Poller};
pub use event_loop::EventLoop;
pub use listener::ListenSocket;
pub use stats::ServerStats;
pub use timeout::{ConnectionState, TimeoutManager};
