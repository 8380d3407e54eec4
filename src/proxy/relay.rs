//! Bidirectional byte relay between two endpoints.
//!
//! Termination follows a half-close policy. Each direction copies until its
//! source reports end-of-stream, then shuts down the write side of its
//! destination and finishes; the other direction keeps running. The relay
//! completes only once both directions have finished.
//!
//! An I/O error in either direction aborts the sibling direction, so a broken
//! leg never leaves the other one blocked on a read that will not complete.
//! Cancelling the caller's token aborts both directions.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::debug;

pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Copy direction, relative to the `(a, b)` pair handed to [`DuplexRelay::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Bytes read from `a`, written to `b`.
    Forward,
    /// Bytes read from `b`, written to `a`.
    Reverse,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => write!(f, "a->b"),
            Direction::Reverse => write!(f, "b->a"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

#[derive(Debug)]
pub enum RelayOutcome {
    /// Both directions reached end-of-stream.
    Success(RelayStats),
    /// The first I/O error observed on either direction.
    Failed {
        direction: Direction,
        error: io::Error,
        stats: RelayStats,
    },
    /// Aborted by the caller's cancellation token.
    Cancelled(RelayStats),
}

impl RelayOutcome {
    pub fn stats(&self) -> RelayStats {
        match self {
            RelayOutcome::Success(stats) | RelayOutcome::Cancelled(stats) => *stats,
            RelayOutcome::Failed { stats, .. } => *stats,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RelayOutcome::Success(_))
    }
}

/// Result of a relay run. The endpoints are handed back so the owner can
/// close them; `None` only if a copy task died and took its halves with it.
#[derive(Debug)]
pub struct Relayed<A, B> {
    pub outcome: RelayOutcome,
    pub a: Option<A>,
    pub b: Option<B>,
}

#[derive(Debug)]
enum PumpEnd {
    Eof,
    Failed { error: io::Error, first: bool },
    Aborted,
}

struct Pumped<R, W> {
    reader: ReadHalf<R>,
    writer: WriteHalf<W>,
    bytes: u64,
    end: PumpEnd,
}

fn fail(error: io::Error, abort: &CancellationToken) -> PumpEnd {
    let first = !abort.is_cancelled();
    abort.cancel();
    PumpEnd::Failed { error, first }
}

/// Copy `reader` into `writer` until end-of-stream, error or abort.
async fn pump<R, W>(
    direction: Direction,
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    buffer_size: usize,
    abort: CancellationToken,
) -> Pumped<R, W>
where
    R: AsyncRead,
    W: AsyncWrite,
{
    // Cancels the sibling if this task unwinds.
    let guard = abort.clone().drop_guard();

    let mut buf = vec![0u8; buffer_size];
    let mut bytes = 0u64;

    let end = loop {
        let read = tokio::select! {
            biased;
            _ = abort.cancelled() => break PumpEnd::Aborted,
            read = reader.read(&mut buf) => read,
        };

        let n = match read {
            Ok(0) => {
                if let Err(e) = writer.shutdown().await {
                    debug!("{} half-close: {}", direction, e);
                }
                break PumpEnd::Eof;
            }
            Ok(n) => n,
            Err(e) => break fail(e, &abort),
        };

        let written = tokio::select! {
            biased;
            _ = abort.cancelled() => break PumpEnd::Aborted,
            written = async {
                writer.write_all(&buf[..n]).await?;
                writer.flush().await
            } => written,
        };

        match written {
            Ok(()) => bytes += n as u64,
            Err(e) => break fail(e, &abort),
        }
    };

    guard.disarm();
    Pumped {
        reader,
        writer,
        bytes,
        end,
    }
}

/// Runs the two copy directions of one session.
#[derive(Debug, Clone, Copy)]
pub struct DuplexRelay {
    buffer_size: usize,
}

impl Default for DuplexRelay {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl DuplexRelay {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
        }
    }

    /// Relay between `a` and `b` until both directions finish or `shutdown` fires.
    ///
    /// Each direction runs on its own task. Both tasks are joined before this
    /// returns, and dropping the returned future aborts them.
    pub async fn run<A, B>(&self, a: A, b: B, shutdown: &CancellationToken) -> Relayed<A, B>
    where
        A: AsyncRead + AsyncWrite + Send + Unpin + 'static,
        B: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let abort = shutdown.child_token();
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);

        let forward = AbortOnDropHandle::new(tokio::spawn(pump(
            Direction::Forward,
            a_read,
            b_write,
            self.buffer_size,
            abort.clone(),
        )));
        let reverse = AbortOnDropHandle::new(tokio::spawn(pump(
            Direction::Reverse,
            b_read,
            a_write,
            self.buffer_size,
            abort.clone(),
        )));

        let (forward, reverse) = tokio::join!(forward, reverse);

        let (a_read, b_write, forward_bytes, forward_end) = match forward {
            Ok(p) => (Some(p.reader), Some(p.writer), p.bytes, p.end),
            Err(e) => (None, None, 0, join_failure(e)),
        };
        let (b_read, a_write, reverse_bytes, reverse_end) = match reverse {
            Ok(p) => (Some(p.reader), Some(p.writer), p.bytes, p.end),
            Err(e) => (None, None, 0, join_failure(e)),
        };

        let stats = RelayStats {
            a_to_b: forward_bytes,
            b_to_a: reverse_bytes,
        };
        let outcome = resolve(
            (Direction::Forward, forward_end),
            (Direction::Reverse, reverse_end),
            stats,
        );

        Relayed {
            outcome,
            a: rejoin(a_read, a_write),
            b: rejoin(b_read, b_write),
        }
    }
}

fn join_failure(e: tokio::task::JoinError) -> PumpEnd {
    PumpEnd::Failed {
        error: io::Error::new(io::ErrorKind::Other, format!("relay task failed: {e}")),
        first: true,
    }
}

fn rejoin<T: Unpin>(read: Option<ReadHalf<T>>, write: Option<WriteHalf<T>>) -> Option<T> {
    match (read, write) {
        (Some(read), Some(write)) => Some(read.unsplit(write)),
        _ => None,
    }
}

fn resolve(
    forward: (Direction, PumpEnd),
    reverse: (Direction, PumpEnd),
    stats: RelayStats,
) -> RelayOutcome {
    let mut primary = None;
    let mut secondary = None;
    let mut aborted = false;

    for (direction, end) in [forward, reverse] {
        match end {
            PumpEnd::Eof => {}
            PumpEnd::Aborted => aborted = true,
            PumpEnd::Failed { error, first: true } if primary.is_none() => {
                primary = Some((direction, error))
            }
            PumpEnd::Failed { error, .. } => {
                if secondary.is_none() {
                    secondary = Some((direction, error));
                }
            }
        }
    }

    match primary.or(secondary) {
        Some((direction, error)) => RelayOutcome::Failed {
            direction,
            error,
            stats,
        },
        None if aborted => RelayOutcome::Cancelled(stats),
        None => RelayOutcome::Success(stats),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;

    const BOUND: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_half_close_keeps_reverse_direction_open() {
        let (a, mut a_far) = duplex(1024);
        let (b, mut b_far) = duplex(1024);
        let shutdown = CancellationToken::new();

        let relay = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { DuplexRelay::new(64).run(a, b, &shutdown).await })
        };

        a_far.write_all(b"hello").await.unwrap();
        a_far.shutdown().await.unwrap();

        // a->b ends with a half-close on b ...
        let mut received = Vec::new();
        b_far.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello");

        // ... while b->a still carries data.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!relay.is_finished());
        b_far.write_all(b"world").await.unwrap();
        b_far.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        a_far.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, b"world");

        let relayed = tokio::time::timeout(BOUND, relay).await.unwrap().unwrap();
        match relayed.outcome {
            RelayOutcome::Success(stats) => {
                assert_eq!(stats, RelayStats { a_to_b: 5, b_to_a: 5 })
            }
            other => panic!("expected success, got {other:?}"),
        }
        assert!(relayed.a.is_some());
        assert!(relayed.b.is_some());
    }

    #[tokio::test]
    async fn test_large_payload_round_trip_preserves_order() {
        let (a, a_far) = duplex(4096);
        let (b, mut b_far) = duplex(4096);
        let shutdown = CancellationToken::new();

        let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();

        let echo = tokio::spawn(async move {
            let mut seen = Vec::new();
            b_far.read_to_end(&mut seen).await.unwrap();
            b_far.write_all(&seen).await.unwrap();
            b_far.shutdown().await.unwrap();
        });

        let (mut a_rd, mut a_wr) = tokio::io::split(a_far);
        let sent = payload.clone();
        let client = async move {
            let write = async {
                a_wr.write_all(&sent).await.unwrap();
                a_wr.shutdown().await.unwrap();
            };
            let read = async {
                let mut back = Vec::new();
                a_rd.read_to_end(&mut back).await.unwrap();
                back
            };
            let ((), back) = tokio::join!(write, read);
            back
        };

        let relay = DuplexRelay::new(1500);
        let (relayed, back) =
            tokio::time::timeout(BOUND, async { tokio::join!(relay.run(a, b, &shutdown), client) })
                .await
                .unwrap();

        echo.await.unwrap();
        assert_eq!(back, payload);
        assert!(relayed.outcome.is_success());
        assert_eq!(relayed.outcome.stats().a_to_b, payload.len() as u64);
        assert_eq!(relayed.outcome.stats().b_to_a, payload.len() as u64);
    }

    #[tokio::test]
    async fn test_read_error_aborts_sibling_direction() {
        let a = tokio_test::io::Builder::new()
            .read(b"abc")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        // b_far never writes or closes; the reverse direction would block forever
        // without the abort.
        let (b, mut b_far) = duplex(64);
        let shutdown = CancellationToken::new();

        let relayed = tokio::time::timeout(BOUND, DuplexRelay::default().run(a, b, &shutdown))
            .await
            .unwrap();

        match relayed.outcome {
            RelayOutcome::Failed {
                direction, error, ..
            } => {
                assert_eq!(direction, Direction::Forward);
                assert_eq!(error.kind(), io::ErrorKind::ConnectionReset);
            }
            other => panic!("expected failure, got {other:?}"),
        }

        let mut forwarded = [0u8; 3];
        b_far.read_exact(&mut forwarded).await.unwrap();
        assert_eq!(&forwarded, b"abc");
    }

    #[tokio::test]
    async fn test_write_error_is_reported() {
        let (a, mut a_far) = duplex(64);
        let (b, b_far) = duplex(64);
        drop(b_far);
        let shutdown = CancellationToken::new();

        a_far.write_all(b"lost").await.unwrap();

        let relayed = tokio::time::timeout(BOUND, DuplexRelay::default().run(a, b, &shutdown))
            .await
            .unwrap();

        match relayed.outcome {
            RelayOutcome::Failed {
                direction, error, ..
            } => {
                assert_eq!(direction, Direction::Forward);
                assert_eq!(error.kind(), io::ErrorKind::BrokenPipe);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_unblocks_idle_relay() {
        let (a, _a_far) = duplex(64);
        let (b, _b_far) = duplex(64);
        let shutdown = CancellationToken::new();

        let relay = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { DuplexRelay::default().run(a, b, &shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!relay.is_finished());
        shutdown.cancel();

        let relayed = tokio::time::timeout(BOUND, relay).await.unwrap().unwrap();
        assert!(matches!(relayed.outcome, RelayOutcome::Cancelled(_)));
        assert!(relayed.a.is_some() && relayed.b.is_some());
    }

    #[test]
    fn test_first_error_wins_over_secondary() {
        let outcome = resolve(
            (
                Direction::Forward,
                PumpEnd::Failed {
                    error: io::Error::new(io::ErrorKind::BrokenPipe, "secondary"),
                    first: false,
                },
            ),
            (
                Direction::Reverse,
                PumpEnd::Failed {
                    error: io::Error::new(io::ErrorKind::ConnectionReset, "primary"),
                    first: true,
                },
            ),
            RelayStats::default(),
        );
        match outcome {
            RelayOutcome::Failed { direction, .. } => assert_eq!(direction, Direction::Reverse),
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
