//! Accept loop: owns the listener and hands each client to its own session.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::proxy::session::{Session, SessionContext};
use crate::{Error, Result};

/// Pause after a failed accept so persistent errors (e.g. EMFILE) do not spin.
pub const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Source of inbound client connections.
#[async_trait]
pub trait Incoming: Send {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Incoming for TcpListener {
    async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Main accept loop. Sessions are spawned on a [`TaskTracker`] so the owner
/// can wait for them during shutdown.
#[derive(Debug)]
pub struct Acceptor<L = TcpListener> {
    listener: L,
    context: SessionContext,
    tracker: TaskTracker,
    nodelay: bool,
}

impl Acceptor<TcpListener> {
    /// Bind the listening socket. Failure here is fatal for the process.
    pub async fn bind(addr: &str, context: SessionContext, tracker: TaskTracker) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(|source| Error::Bind {
            addr: addr.to_string(),
            source,
        })?;
        Ok(Self::new(listener, context, tracker))
    }
}

impl<L: Incoming> Acceptor<L> {
    pub fn new(listener: L, context: SessionContext, tracker: TaskTracker) -> Self {
        Self {
            listener,
            context,
            tracker,
            nodelay: true,
        }
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept until `stop` fires, then close the listener.
    ///
    /// Accept errors are reported and the loop carries on. Dispatch never
    /// waits on a session.
    pub async fn run(mut self, stop: CancellationToken) {
        let local = self
            .listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string());
        info!("Relay listening on {}", local);

        loop {
            let accepted = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.dispatch(stream, peer),
                Err(e) => {
                    self.context.stats.record_accept_error();
                    self.context
                        .reporter
                        .error(format!("Error accepting connection: {}", e));

                    tokio::select! {
                        biased;
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        info!("Stopped accepting on {}", local);
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        debug!("New connection from {}", peer);
        self.context.stats.record_accept();

        if self.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
            }
        }

        let session = Session::new(stream, peer, self.context.clone());
        self.tracker.spawn(session.run());
    }
}
