//! One client's lifecycle: dial upstream, relay, close both legs.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::connection::{Endpoint, Role};
use crate::proxy::dialer::Dialer;
use crate::proxy::relay::{Direction, DuplexRelay, RelayOutcome};
use crate::reporter::ErrorReporter;
use crate::stats::ServerStats;

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    DialFailed,
    Success,
    RelayError,
    /// Shutdown closed the session before it finished on its own.
    Cancelled,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::DialFailed => write!(f, "dial failed"),
            CloseReason::Success => write!(f, "success"),
            CloseReason::RelayError => write!(f, "relay error"),
            CloseReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Relaying,
    Closed(CloseReason),
}

/// Everything a session needs from the process, cloned once per session.
#[derive(Clone)]
pub struct SessionContext {
    pub dialer: Arc<dyn Dialer>,
    pub relay: DuplexRelay,
    pub reporter: Arc<dyn ErrorReporter>,
    pub stats: Arc<ServerStats>,
    /// Fires when still-running sessions must close their endpoints.
    pub shutdown: CancellationToken,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("upstream", &self.dialer.target())
            .field("relay", &self.relay)
            .finish()
    }
}

pub struct Session {
    id: Uuid,
    client: Endpoint<TcpStream>,
    context: SessionContext,
    state: watch::Sender<SessionState>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("client", &self.client)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl Session {
    pub fn new(client: TcpStream, peer: SocketAddr, context: SessionContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            client: Endpoint::new(Role::Client, client, Some(peer)),
            context,
            state: watch::Sender::new(SessionState::New),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Follow state transitions. The last value is always `Closed`.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Drive the session to a terminal state. Never fails: every error is
    /// reported and absorbed here.
    pub async fn run(mut self) -> CloseReason {
        let span = info_span!(
            "session",
            id = %self.id,
            peer = %self.client.peer().map(|p| p.to_string()).unwrap_or_default()
        );
        async move {
            let _active = self.context.stats.track_active();
            let reason = self.drive().await;
            self.state.send_replace(SessionState::Closed(reason));
            reason
        }
        .instrument(span)
        .await
    }

    async fn drive(&mut self) -> CloseReason {
        let target = self.context.dialer.target();
        debug!("dialing upstream {}", target);

        let dialed = tokio::select! {
            biased;
            _ = self.context.shutdown.cancelled() => {
                self.client.close().await;
                self.context.stats.record_cancelled();
                debug!("closed before upstream was dialed");
                return CloseReason::Cancelled;
            }
            dialed = self.context.dialer.dial() => dialed,
        };

        let upstream = match dialed {
            Ok(stream) => stream,
            Err(e) => {
                self.client.close().await;
                self.context.stats.record_dial_failure();
                self.context
                    .reporter
                    .error(format!("session {}: {}", self.id, e));
                return CloseReason::DialFailed;
            }
        };

        let upstream_peer = upstream.peer_addr().ok();
        let mut upstream = Endpoint::new(Role::Upstream, upstream, upstream_peer);
        self.state.send_replace(SessionState::Relaying);

        let reason = self.relay(&mut upstream).await;

        upstream.close().await;
        self.client.close().await;
        reason
    }

    async fn relay(&mut self, upstream: &mut Endpoint<TcpStream>) -> CloseReason {
        let (Some(client_stream), Some(upstream_stream)) =
            (self.client.take_stream(), upstream.take_stream())
        else {
            self.context.stats.record_relay_error();
            self.context
                .reporter
                .error(format!("session {}: endpoint unavailable for relay", self.id));
            return CloseReason::RelayError;
        };

        let relayed = self
            .context
            .relay
            .run(client_stream, upstream_stream, &self.context.shutdown)
            .await;

        if let Some(stream) = relayed.a {
            self.client.restore(stream);
        }
        if let Some(stream) = relayed.b {
            upstream.restore(stream);
        }

        let stats = relayed.outcome.stats();
        self.context.stats.record_bytes(stats.a_to_b, stats.b_to_a);

        match relayed.outcome {
            RelayOutcome::Success(stats) => {
                self.context.stats.record_completed();
                debug!(
                    "relay finished: {} bytes up, {} bytes down",
                    stats.a_to_b, stats.b_to_a
                );
                CloseReason::Success
            }
            RelayOutcome::Failed {
                direction, error, ..
            } => {
                self.context.stats.record_relay_error();
                let leg = match direction {
                    Direction::Forward => "client->upstream",
                    Direction::Reverse => "upstream->client",
                };
                self.context
                    .reporter
                    .error(format!("session {}: relay {} failed: {}", self.id, leg, error));
                CloseReason::RelayError
            }
            RelayOutcome::Cancelled(_) => {
                self.context.stats.record_cancelled();
                debug!("relay cancelled by shutdown");
                CloseReason::Cancelled
            }
        }
    }
}
