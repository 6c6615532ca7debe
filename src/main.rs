//! Binary entry point: parse flags, load the routing table, run the proxy
//! until SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use venture_proxy::routes::{self, RouteTable};
use venture_proxy::{spawn_proxy, ProxyConfig};

#[derive(Parser)]
#[command(name = "venture-proxy")]
#[command(about = "Domain-aware reverse proxy routing venture domains to code-server workspaces")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, env = "PROXY_LISTEN", default_value = "0.0.0.0:3000")]
    listen: SocketAddr,

    /// Default code-server backend (host:port)
    #[arg(long, env = "PROXY_BACKEND", default_value = "127.0.0.1:8080")]
    backend: String,

    /// Routing table JSON file; built-in defaults when omitted
    #[arg(long, env = "PROXY_ROUTES")]
    routes: Option<PathBuf>,

    /// Directory holding login theme stylesheets
    #[arg(long, env = "PROXY_THEME_DIR", default_value = "login-themes")]
    theme_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let (route_list, downloads) = match &cli.routes {
        Some(path) => {
            let config = routes::load_config(path)
                .with_context(|| format!("loading routing config {}", path.display()))?;
            (config.routes, config.downloads)
        }
        None => (routes::default_routes(), routes::default_downloads()),
    };
    let table = RouteTable::new(route_list);

    info!("default backend {}", cli.backend);
    for route in table.iter() {
        match &route.target {
            Some(target) => info!("  {} -> {} ({})", route.domain, target, route.workspace_folder),
            None => info!("  {} -> {}", route.domain, route.workspace_folder),
        }
    }

    let config = ProxyConfig {
        listen: cli.listen,
        backend: cli.backend,
        routes: table,
        downloads,
        theme_dir: cli.theme_dir,
    };

    let (addr, handle) = spawn_proxy(config, Box::pin(shutdown_signal()))?;
    info!("venture proxy running on {}", addr);

    handle.await.context("proxy task failed")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
