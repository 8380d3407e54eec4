//! Owned connection endpoints with idempotent close.

use std::fmt;
use std::net::SocketAddr;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Which leg of a session an endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Upstream,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Upstream => write!(f, "upstream"),
        }
    }
}

/// A byte-stream endpoint exclusively owned by one session.
///
/// The stream can be lent out to the relay with [`Endpoint::take_stream`] and
/// handed back with [`Endpoint::restore`]. [`Endpoint::close`] releases it; any
/// later close is a no-op.
pub struct Endpoint<S> {
    role: Role,
    peer: Option<SocketAddr>,
    stream: Option<S>,
    closed: bool,
}

impl<S> fmt::Debug for Endpoint<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("role", &self.role)
            .field("peer", &self.peer)
            .field("closed", &self.closed)
            .finish()
    }
}

impl<S> Endpoint<S> {
    pub fn new(role: Role, stream: S, peer: Option<SocketAddr>) -> Self {
        Self {
            role,
            peer,
            stream: Some(stream),
            closed: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Lend the stream out. Returns `None` once closed or while already lent.
    pub fn take_stream(&mut self) -> Option<S> {
        if self.closed {
            return None;
        }
        self.stream.take()
    }

    /// Return a previously lent stream.
    pub fn restore(&mut self, stream: S) {
        if self.closed {
            // Closed while lent: release right away.
            drop(stream);
            return;
        }
        self.stream = Some(stream);
    }
}

impl<S: AsyncWrite + Unpin> Endpoint<S> {
    /// Shut the stream down and release it. Returns `true` only for the call
    /// that actually closed the endpoint.
    pub async fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;

        if let Some(mut stream) = self.stream.take() {
            // The peer may already be gone; the descriptor is released on drop either way.
            if let Err(e) = stream.shutdown().await {
                debug!("{} shutdown on close: {}", self.role, e);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (near, mut far) = tokio::io::duplex(64);
        let mut endpoint = Endpoint::new(Role::Client, near, None);

        assert!(endpoint.close().await);
        assert!(endpoint.is_closed());
        assert!(!endpoint.close().await);

        // The far side observes end-of-stream.
        let mut buf = Vec::new();
        assert_eq!(far.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_take_and_restore() {
        let (near, _far) = tokio::io::duplex(64);
        let mut endpoint = Endpoint::new(Role::Upstream, near, None);

        let stream = endpoint.take_stream().unwrap();
        assert!(endpoint.take_stream().is_none());
        endpoint.restore(stream);
        assert!(endpoint.take_stream().is_some());
    }

    #[tokio::test]
    async fn test_closed_endpoint_refuses_to_lend() {
        let (near, _far) = tokio::io::duplex(64);
        let mut endpoint = Endpoint::new(Role::Client, near, None);
        endpoint.close().await;
        assert!(endpoint.take_stream().is_none());
        assert_eq!(endpoint.role(), Role::Client);
    }
}
