//! Signaling relay binary entry point
//!
//! # Usage
//!
//! ```bash
//! # Listen on 0.0.0.0:3000 (PORT is honoured too)
//! cargo run -p peercall-signaling-server
//!
//! # Config file plus overrides
//! cargo run -p peercall-signaling-server -- \
//!   --config ./relay.toml \
//!   --port 8080 \
//!   --on-conflict replace \
//!   --notify-unavailable
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use peercall_signaling::{ConflictPolicy, RelayConfig, SignalingServer};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// PeerCall signaling relay
///
/// Lets browser endpoints register an identifier and exchange call setup
/// messages over WebSocket.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "PEERCALL_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long, env = "PEERCALL_HOST")]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "PEERCALL_PORT")]
    port: Option<u16>,

    /// What to do when an identifier is already registered
    #[arg(long, value_enum, env = "PEERCALL_ON_CONFLICT")]
    on_conflict: Option<ConflictArg>,

    /// Tell senders when a call or offer could not be delivered
    #[arg(long, env = "PEERCALL_NOTIFY_UNAVAILABLE")]
    notify_unavailable: bool,

    /// Refuse calls to endpoints already in another call
    #[arg(long, env = "PEERCALL_REJECT_BUSY")]
    reject_busy: bool,

    /// Emit logs as JSON lines
    #[arg(long, env = "PEERCALL_LOG_JSON")]
    log_json: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum ConflictArg {
    /// Refuse the newcomer
    Reject,
    /// Hand the identifier to the newcomer
    Replace,
}

impl From<ConflictArg> for ConflictPolicy {
    fn from(arg: ConflictArg) -> Self {
        match arg {
            ConflictArg::Reject => ConflictPolicy::Reject,
            ConflictArg::Replace => ConflictPolicy::Replace,
        }
    }
}

impl Args {
    /// Resolve file, environment and command line into one config
    fn relay_config(&self) -> Result<RelayConfig> {
        let mut config =
            RelayConfig::load(self.config.as_ref()).context("Failed to load relay config")?;

        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(policy) = self.on_conflict {
            config.registry.on_conflict = policy.into();
        }
        if self.notify_unavailable {
            config.routing.notify_unavailable = true;
        }
        if self.reject_busy {
            config.routing.reject_busy_targets = true;
        }

        config.validate().context("Invalid relay config")?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Set up Ctrl+C handler at the very start
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        eprintln!("\nCtrl+C received, shutting down...");

        if shutdown_flag_handler.swap(true, Ordering::SeqCst) {
            eprintln!("Shutdown already in progress, forcing exit");
            std::process::exit(0);
        }

        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(3));
            eprintln!("Graceful shutdown timed out, forcing exit");
            std::process::exit(0);
        });
    })
    .context("Failed to install Ctrl+C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("signaling-worker")
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(
    args: Args,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<()> {
    init_tracing(args.log_json);

    let config = args.relay_config()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %config.bind_addr(),
        on_conflict = ?config.registry.on_conflict,
        notify_unavailable = config.routing.notify_unavailable,
        reject_busy_targets = config.routing.reject_busy_targets,
        "PeerCall signaling relay starting"
    );

    let handle = SignalingServer::bind(config)
        .await
        .context("Failed to start signaling relay")?;
    info!("Accepting connections on {}", handle.url());

    while !shutdown_flag.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("Shutdown signal received, stopping relay...");
    handle.shutdown().await;
    info!("Signaling relay shut down gracefully");

    Ok(())
}

fn init_tracing(json: bool) {
    // RUST_LOG wins; default to info
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::parse_from([
            "signaling-server",
            "--port",
            "0",
            "--host",
            "127.0.0.1",
            "--on-conflict",
            "replace",
            "--notify-unavailable",
        ]);
        let config = args.relay_config().unwrap();
        assert_eq!(config.bind_addr(), "127.0.0.1:0");
        assert_eq!(config.registry.on_conflict, ConflictPolicy::Replace);
        assert!(config.routing.notify_unavailable);
        assert!(!config.routing.reject_busy_targets);
    }

    #[test]
    fn test_missing_config_file_falls_back_to_defaults() {
        let args = Args::parse_from([
            "signaling-server",
            "--config",
            "/nonexistent/relay.toml",
            "--port",
            "4000",
        ]);
        let config = args.relay_config().unwrap();
        assert_eq!(config.server.port, 4000);
    }
}
