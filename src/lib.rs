pub mod config;
pub mod connection;
pub mod error;
pub mod proxy;
pub mod reporter;
pub mod server;
pub mod stats;

pub use error::{Error, Result};
pub use proxy::{Acceptor, CloseReason, Dialer, DuplexRelay, RelayOutcome, Session, TcpDialer};
pub use reporter::{ErrorReporter, QueuedReporter, TracingReporter};
pub use server::RelayServer;
pub use stats::{ServerStats, StatsSnapshot};
