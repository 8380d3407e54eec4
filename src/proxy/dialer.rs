//! Opens the upstream leg of a session.

use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::Config;
use crate::{Error, Result};

/// Opens one outbound connection to the fixed upstream target.
///
/// Exactly one attempt per call: no retries and no backoff.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<TcpStream>;

    /// The address this dialer connects to, for diagnostics.
    fn target(&self) -> String;
}

#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
    connect_timeout: Option<Duration>,
    nodelay: bool,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout: None,
            nodelay: true,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.upstream_addr.clone())
            .with_connect_timeout(config.connect_timeout())
            .with_nodelay(config.nodelay)
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> Result<TcpStream> {
        let connect = TcpStream::connect(self.addr.as_str());

        let connected = match self.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| Error::DialTimeout {
                    addr: self.addr.clone(),
                    timeout,
                })?,
            None => connect.await,
        };

        let stream = connected.map_err(|source| Error::Dial {
            addr: self.addr.clone(),
            source,
        })?;

        if self.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                debug!("Could not set TCP_NODELAY on upstream {}: {}", self.addr, e);
            }
        }

        Ok(stream)
    }

    fn target(&self) -> String {
        self.addr.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_dial_live_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let dialer = TcpDialer::new(addr.to_string());
        let (stream, accepted) = tokio::join!(dialer.dial(), listener.accept());

        let stream = stream.unwrap();
        let (_server_side, peer) = accepted.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
        assert_eq!(stream.local_addr().unwrap(), peer);
        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_dial_refused_is_dial_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TcpDialer::new(addr.to_string()).dial().await.unwrap_err();
        assert!(matches!(err, Error::Dial { .. }));
        assert!(err.to_string().contains(&addr.to_string()));
    }

    #[tokio::test]
    async fn test_dial_unresolvable_host() {
        let err = TcpDialer::new("no-such-host.invalid:80")
            .with_connect_timeout(Some(Duration::from_secs(5)))
            .dial()
            .await
            .unwrap_err();
        assert!(err.is_dial_error());
    }

    #[test]
    fn test_from_config() {
        let config = Config {
            upstream_addr: "example.com:80".to_string(),
            connect_timeout_ms: Some(250),
            nodelay: false,
            ..Config::default()
        };
        let dialer = TcpDialer::from_config(&config);
        assert_eq!(dialer.target(), "example.com:80");
        assert_eq!(dialer.connect_timeout, Some(Duration::from_millis(250)));
        assert!(!dialer.nodelay);
    }
}
