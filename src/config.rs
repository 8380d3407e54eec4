use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

/// Prefix for environment overrides, e.g. `TCP_RELAY_UPSTREAM_ADDR`.
pub const ENV_PREFIX: &str = "TCP_RELAY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the acceptor binds, in `host:port` form.
    pub listen_addr: String,
    /// The single upstream every session is forwarded to.
    pub upstream_addr: String,
    /// Bound on one dial attempt. `None` leaves it to the OS.
    pub connect_timeout_ms: Option<u64>,
    /// Copy buffer size for each relay direction.
    pub buffer_size: usize,
    /// Set TCP_NODELAY on both legs of a session.
    pub nodelay: bool,
    /// Capacity of the queued reporter. Zero reports synchronously.
    pub report_queue_capacity: usize,
    /// How long sessions may drain after the acceptor stops.
    pub shutdown_grace_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "localhost:8000".to_string(),
            upstream_addr: String::new(),
            connect_timeout_ms: None,
            buffer_size: 16 * 1024,
            nodelay: true,
            report_queue_capacity: 1024,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl Config {
    /// Layers defaults, an optional file and `TCP_RELAY_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(
            path,
            config::Environment::with_prefix(ENV_PREFIX).try_parsing(true),
        )
    }

    fn load_with_env(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder.add_source(env).build()?;
        let config: Config = settings.try_deserialize()?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(Some(path.as_ref()))
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        check_host_port("listen_addr", &self.listen_addr)?;
        if self.upstream_addr.trim().is_empty() {
            return Err(Error::invalid_config("upstream_addr must be set"));
        }
        check_host_port("upstream_addr", &self.upstream_addr)?;
        if self.buffer_size == 0 {
            return Err(Error::invalid_config("buffer_size must be greater than zero"));
        }
        if self.connect_timeout_ms == Some(0) {
            return Err(Error::invalid_config(
                "connect_timeout_ms must be greater than zero when set",
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

fn check_host_port(field: &str, addr: &str) -> Result<()> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::invalid_config(format!("{field} must be host:port, got {addr:?}")))?;

    if host.is_empty() {
        return Err(Error::invalid_config(format!("{field} is missing a host: {addr:?}")));
    }
    port.parse::<u16>()
        .map_err(|_| Error::invalid_config(format!("{field} has an invalid port: {addr:?}")))?;
    Ok(())
}
