//! Remofs CLI - serve a local project tree to a remote runtime
//!
//! Usage:
//! - remofs -s text:hunter2                 - serve the current directory
//! - remofs -r ./app -s env:APP_SECRET -t 30000
//! - remofs -s stdin -e 127.0.0.1:9000 --allow-shutdown-requests

mod secret;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use remofs_daemon::config::DEFAULT_PORT;
use remofs_daemon::{RemoteFsServer, ServerConfig, ShutdownReason};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Remofs - secure remote file system server
#[derive(Parser, Debug)]
#[command(
    name = "remofs",
    version,
    about = "Serve a directory tree over TLS for remote reading, searching and watching",
    disable_version_flag = true
)]
struct Cli {
    /// Root directory to serve (default: current directory)
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Shared secret: text[:utf8|base64]:<value>, env[:utf8|base64]:<name>, file:<path>, stdin[:utf8|base64]
    #[arg(short, long)]
    secret: String,

    /// Listen address
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    address: IpAddr,

    /// Listen port
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Listen endpoint as host:port (overrides --address and --port)
    #[arg(short, long)]
    endpoint: Option<String>,

    /// PEM file with the certificate chain and private key (default: ephemeral)
    #[arg(short, long)]
    certificate: Option<PathBuf>,

    /// Maximum search recursion depth; <= 0 is unbounded
    #[arg(short = 'd', long, default_value_t = 0, allow_negative_numbers = true)]
    max_search_depth: i64,

    /// Idle shutdown in milliseconds with no authenticated clients; <= 0 disables
    #[arg(short, long, default_value_t = 0, allow_negative_numbers = true)]
    timeout: i64,

    /// Let clients shut the server down
    #[arg(long)]
    allow_shutdown_requests: bool,

    /// Print version
    #[arg(short = 'v', long, action = ArgAction::Version)]
    version: Option<bool>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            // --help and --version are reported as "errors" on stdout
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match build_config(cli).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match serve(config).await {
        Ok(reason) => {
            info!("Shut down: {:?}", reason);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn build_config(cli: Cli) -> Result<ServerConfig> {
    let secret = secret::parse_secret(&cli.secret).context("invalid --secret")?;
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    let listen = match &cli.endpoint {
        Some(endpoint) => tokio::net::lookup_host(endpoint.as_str())
            .await
            .with_context(|| format!("resolving endpoint {endpoint:?}"))?
            .next()
            .with_context(|| format!("endpoint {endpoint:?} resolved to no address"))?,
        None => SocketAddr::new(cli.address, cli.port),
    };

    Ok(ServerConfig::new(root, secret)
        .listen(listen)
        .certificate(cli.certificate)
        .max_search_depth(cli.max_search_depth)
        .allow_shutdown_requests(cli.allow_shutdown_requests)
        .idle_timeout_ms(cli.timeout))
}

async fn serve(config: ServerConfig) -> Result<ShutdownReason> {
    let server = RemoteFsServer::bind(config).await?;

    let registry = server.registry();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            registry.begin_drain(ShutdownReason::Interrupted);
        }
    });

    server.run().await
}
