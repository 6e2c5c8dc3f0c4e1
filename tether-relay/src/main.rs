//! Tether relay — entry point.
//!
//! ```text
//! tether-relay                     Run in the foreground
//! tether-relay --config <path>     Load a custom config TOML
//! tether-relay --gen-config        Write default config to stdout
//! tether-relay --max-sessions <n>  Override session.max_sessions
//! tether-relay --grace-ms <ms>     Override session.grace_period_ms
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tether_relay::config::RelayConfig;
use tether_relay::service::RelayService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "tether-relay", about = "Tether rendezvous relay")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "tether-relay.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Maximum sessions waiting for a viewer.
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Reconnection grace window in milliseconds.
    #[arg(long)]
    grace_ms: Option<u64>,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&RelayConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = RelayConfig::load(&cli.config);
    if let Some(max) = cli.max_sessions {
        config.session.max_sessions = max;
    }
    if let Some(grace) = cli.grace_ms {
        config.session.grace_period_ms = grace;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("tether-relay v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "ports: screen {}, control {}, chat {}, udp {}",
        config.network.screen_port,
        config.network.control_port,
        config.network.chat_port,
        config.network.udp_port
    );
    info!("max sessions: {}", config.session.max_sessions);
    info!("grace period: {} ms", config.session.grace_period_ms);

    let service = RelayService::new(config);
    let stop = service.stop_handle();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;
    Ok(())
}
