//! chatbridge-server: chat relay hub binary.
//!
//! Binds the TCP stream server, hooks the relay into it, and drains
//! channel posts into the log — an embedding application would own the
//! post receiver and forward to a real chat surface instead.

use clap::Parser;
use std::path::Path;
use tracing::{error, info};

use chatbridge_server::chat;
use chatbridge_server::config::ServerConfig;
use chatbridge_server::listener::StreamServer;
use chatbridge_server::server::RelayServer;

/// chatbridge-server — chat relay hub
#[derive(Parser, Debug)]
#[command(name = "chatbridge-server", version, about = "Chat relay hub")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.chatbridge/config.toml")]
    config: String,

    /// Relay state file (types, routing, restrictions)
    #[arg(long)]
    state: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting chatbridge-server");

    let config = match ServerConfig::load(
        Some(Path::new(&cli.config)),
        cli.bind.as_deref(),
        cli.port,
        cli.state.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let (chat_tx, mut chat_rx) = chat::channel();
    let server = match RelayServer::new(config.clone(), chat_tx) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to load relay state");
            std::process::exit(1);
        }
    };

    let streams = StreamServer::new();
    server.initialize(&streams).await;

    let addr = match streams.listen(&config.bind, config.port).await {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "failed to bind listener");
            std::process::exit(1);
        }
    };
    info!(%addr, "chatbridge-server ready");

    // Stand-in chat surface: log every rendered post.
    let surface = tokio::spawn(async move {
        while let Some(post) = chat_rx.recv().await {
            info!(channel = %post.channel_id, text = %post.text, "channel post");
        }
    });

    shutdown_signal().await;
    info!("received shutdown signal");
    server.close(&streams).await;
    surface.abort();

    info!("chatbridge-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
