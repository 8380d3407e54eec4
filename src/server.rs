use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::proxy::{Acceptor, DuplexRelay, SessionContext, TcpDialer};
use crate::reporter::ErrorReporter;
use crate::stats::ServerStats;
use crate::Result;

/// Wires configuration, the acceptor and shutdown together.
pub struct RelayServer {
    config: Config,
    acceptor: Acceptor<TcpListener>,
    tracker: TaskTracker,
    sessions_shutdown: CancellationToken,
    stats: Arc<ServerStats>,
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("listen_addr", &self.config.listen_addr)
            .field("upstream_addr", &self.config.upstream_addr)
            .finish()
    }
}

impl RelayServer {
    /// Validate `config` and bind the listener.
    pub async fn bind(config: Config, reporter: Arc<dyn ErrorReporter>) -> Result<Self> {
        config.validate()?;

        let stats = ServerStats::with_reporter(Arc::clone(&reporter));
        let tracker = TaskTracker::new();
        let sessions_shutdown = CancellationToken::new();

        let context = SessionContext {
            dialer: Arc::new(TcpDialer::from_config(&config)),
            relay: DuplexRelay::new(config.buffer_size),
            reporter,
            stats: Arc::clone(&stats),
            shutdown: sessions_shutdown.clone(),
        };

        let acceptor = Acceptor::bind(&config.listen_addr, context, tracker.clone())
            .await?
            .with_nodelay(config.nodelay);

        Ok(Self {
            config,
            acceptor,
            tracker,
            sessions_shutdown,
            stats,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    pub fn stats(&self) -> Arc<ServerStats> {
        Arc::clone(&self.stats)
    }

    /// Serve until Ctrl+C.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve until `signal` completes, then shut down gracefully.
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            "Relaying {} -> {}",
            self.config.listen_addr, self.config.upstream_addr
        );

        let stop = CancellationToken::new();
        let accept_loop = self.acceptor.run(stop.clone());
        tokio::pin!(accept_loop);

        tokio::select! {
            _ = &mut accept_loop => {
                warn!("Accept loop exited unexpectedly");
            }
            _ = signal => {
                info!("Received shutdown signal");
                stop.cancel();
                accept_loop.await;
            }
        }

        drain(
            &self.tracker,
            &self.sessions_shutdown,
            self.config.shutdown_grace(),
        )
        .await;

        let snapshot = self.stats.snapshot();
        info!(
            "Relay stopped: {} accepted, {} completed, {} dial failures, {} relay errors",
            snapshot.accepted, snapshot.completed, snapshot.dial_failures, snapshot.relay_errors
        );
        Ok(())
    }
}

/// Let sessions finish within `grace`, then close whatever is left.
async fn drain(
    tracker: &TaskTracker,
    sessions_shutdown: &CancellationToken,
    grace: std::time::Duration,
) {
    tracker.close();
    if tracker.is_empty() {
        return;
    }

    if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
        info!("Closing {} active session(s)", tracker.len());
        sessions_shutdown.cancel();
        tracker.wait().await;
    }
}
