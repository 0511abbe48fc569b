//! `portico start` — run the tunnel, inspector, and dashboard.

use crate::config;
use anyhow::{bail, Context, Result};
use clap::Args;
use portico_common::constants::{DEFAULT_INSPECTOR_PORT, DEFAULT_SERVER_ADDR};
use portico_common::{InspectorConfig, ReconnectConfig, TunnelConfig, TunnelError};
use portico_core::transport::TlsOptions;
use portico_core::{EventBus, Stats, Tunnel};
use portico_http::ProxyWorker;
use portico_inspector::{ExchangeStore, InspectorServer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Local port to expose
    pub port: u16,

    /// Ingress server address (host:port)
    #[arg(long, default_value = DEFAULT_SERVER_ADDR, env = "PORTICO_SERVER")]
    pub server: String,

    /// Authentication token. Defaults to the token saved by `portico auth`.
    #[arg(long, env = "PORTICO_TOKEN")]
    pub token: Option<String>,

    /// Specific subdomain to bind (default: every domain owned by the token)
    #[arg(long)]
    pub subdomain: Option<String>,

    /// Inspector port on loopback
    #[arg(long, default_value_t = DEFAULT_INSPECTOR_PORT, env = "PORTICO_INSPECTOR_PORT")]
    pub inspector_port: u16,

    /// Disable the terminal dashboard
    #[arg(long)]
    pub no_tui: bool,

    /// Path to a CA certificate to verify the server against. Without it,
    /// server certificates are not verified.
    #[arg(long, env = "PORTICO_TLS_CA")]
    pub tls_ca: Option<std::path::PathBuf>,

    /// Server name (SNI) override for TLS
    #[arg(long, env = "PORTICO_TLS_SERVER_NAME")]
    pub tls_server_name: Option<String>,
}

fn resolve_token(args: &StartArgs) -> Result<String> {
    if let Some(token) = &args.token {
        return Ok(token.clone());
    }
    let cfg = config::load()?;
    if cfg.token.is_empty() {
        bail!("no token found. Run 'portico auth <token>' first.");
    }
    Ok(cfg.token)
}

pub async fn run(args: StartArgs) -> Result<()> {
    let token = resolve_token(&args)?;

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, closing tunnel");
            signal_cancel.cancel();
        }
    });

    let inspector_config = InspectorConfig {
        port: args.inspector_port,
        ..Default::default()
    };
    let store = Arc::new(ExchangeStore::with_capacity(inspector_config.capacity));
    let stats = Arc::new(Stats::new());
    let bus = Arc::new(EventBus::new());

    let inspector =
        InspectorServer::new(store.clone(), inspector_config).with_local_port(args.port);
    tokio::spawn(async move {
        if let Err(err) = inspector.serve().await {
            error!("inspector server error: {err}");
        }
    });
    info!(
        "inspector ui on http://127.0.0.1:{}",
        args.inspector_port
    );

    let worker = ProxyWorker::new(args.port, store, stats.clone(), bus.clone());

    let mut tunnel_config = TunnelConfig::new(args.server.clone(), token, args.port);
    if let Some(subdomain) = args.subdomain.clone() {
        tunnel_config = tunnel_config.with_subdomain(subdomain);
    }
    tunnel_config.validate()?;

    let tls_options = TlsOptions {
        ca_cert_path: args.tls_ca.clone(),
        server_name: args.tls_server_name.clone(),
    };

    let tunnel = Arc::new(
        Tunnel::new(tunnel_config, Arc::new(worker), stats.clone(), bus.clone())
            .with_tls_options(tls_options),
    );

    info!(
        "starting tunnel to localhost:{} via {}",
        args.port, args.server
    );

    let policy = ReconnectConfig::default();
    let tunnel_task = {
        let tunnel = tunnel.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { tunnel.start_with_reconnect(&cancel, &policy).await })
    };

    if !args.no_tui {
        portico_tui::run(bus.clone(), stats.clone(), args.inspector_port, cancel.clone()).await?;
        // Dashboard quit tears the tunnel down with it
        cancel.cancel();
    }

    let result = tunnel_task.await.context("tunnel task panicked")?;
    bus.close();

    match result {
        Err(TunnelError::Cancelled) => {
            println!("Tunnel closed");
            Ok(())
        }
        Err(err) => Err(err.into()),
        Ok(()) => Ok(()),
    }
}
