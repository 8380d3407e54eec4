//! The relay core.
//!
//! The acceptor owns the listener and spawns one [`Session`] per client. A
//! session dials the upstream through a [`Dialer`] and runs a [`DuplexRelay`]
//! between the two legs before closing both.

pub mod acceptor;
pub mod dialer;
pub mod relay;
pub mod session;

pub use acceptor::*;
pub use dialer::*;
pub use relay::*;
pub use session::*;
