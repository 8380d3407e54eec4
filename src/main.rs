use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use tcp_relay::{config::Config, reporter, server::RelayServer};
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "tcp-relay")]
#[command(about = "Forward every inbound TCP connection to one fixed upstream")]
struct Cli {
    /// Address to listen on (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Upstream every connection is forwarded to (host:port)
    #[arg(short, long)]
    upstream: Option<String>,

    /// Bound on a single upstream dial, in milliseconds
    #[arg(long)]
    connect_timeout_ms: Option<u64>,

    #[arg(short, long)]
    verbose: bool,

    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    info!("Starting tcp-relay");

    // Load configuration
    let mut config = Config::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Some(upstream) = cli.upstream {
        config.upstream_addr = upstream;
    }
    if cli.connect_timeout_ms.is_some() {
        config.connect_timeout_ms = cli.connect_timeout_ms;
    }

    let (reporter, worker) = reporter::build(config.report_queue_capacity);

    let server = match RelayServer::bind(config, reporter).await {
        Ok(server) => server,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    server.run().await?;

    if let Some(worker) = worker {
        worker.finish().await;
    }
    Ok(())
}
