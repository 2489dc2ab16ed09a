use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

mod config;
mod config_channel;
mod connection;
mod context;
mod gateway;
mod health;
mod server;
mod settings;
mod tabs;
mod transport;

use config::GatewayConfig;
use context::{Controller, WorkerContext};
use gateway::{InterceptedRequest, ReqwestFetcher};
use health::{probe_endpoint, Prober, WsProber};
use settings::SettingsStore;
use tabs::TabRegistry;
use transport::WsTransportFactory;

#[derive(Parser)]
#[command(name = "tunnelgate")]
#[command(author = "Tunnelgate Team")]
#[command(version = "0.1.0")]
#[command(about = "Fetch gateway that tunnels requests over one shared connection", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: tunnelgate.yml in cwd or home)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the local interception server
    Serve {
        /// Listen address (overrides the config file)
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },
    /// Open one tab per input and load them all through the tunnel
    Fetch {
        /// URLs, hostnames, or search terms
        #[arg(required = true)]
        inputs: Vec<String>,
    },
    /// Test whether a tunnel endpoint accepts connections
    Probe {
        /// Endpoint to test (default: the current setting)
        url: Option<String>,
    },
    /// Persist a new tunnel endpoint
    SetEndpoint {
        url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "tunnelgate=debug" } else { "tunnelgate=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let conf = GatewayConfig::resolve(cli.config.as_deref())?;
    let settings = SettingsStore::new(
        conf.settings_path
            .clone()
            .unwrap_or_else(SettingsStore::default_path),
    );

    match cli.command {
        Commands::Serve { listen } => run_server(conf, settings, listen).await?,
        Commands::Fetch { inputs } => run_fetch(conf, settings, inputs).await?,
        Commands::Probe { url } => run_probe(conf, settings, url).await?,
        Commands::SetEndpoint { url } => {
            let endpoint = tunnelgate_shared::Endpoint::parse(&url)?;
            settings.set_endpoint(endpoint.as_str())?;
            println!("✓ Tunnel endpoint set to {}", endpoint);
        }
    }

    Ok(())
}

/// Build the worker, start listening for config, and deliver the persisted endpoint.
async fn start_worker(
    conf: &GatewayConfig,
    settings: SettingsStore,
) -> Result<(Arc<WorkerContext>, Arc<Controller>)> {
    let factory = Arc::new(WsTransportFactory {
        response_timeout: conf.response_timeout(),
    });
    let direct = Arc::new(ReqwestFetcher::new()?);
    let ctx = Arc::new(WorkerContext::new(conf, factory, Arc::new(WsProber), direct));

    let (tx, rx) = mpsc::channel(16);
    Arc::clone(&ctx).spawn(rx);

    let controller = Arc::new(Controller::new(settings, conf.default_endpoint.clone(), tx));
    let endpoint = controller.start().await?;
    info!("Using tunnel endpoint {}", endpoint);

    Ok((ctx, controller))
}

async fn run_server(conf: GatewayConfig, settings: SettingsStore, listen: Option<SocketAddr>) -> Result<()> {
    let addr = listen.unwrap_or(conf.listen);
    let (ctx, controller) = start_worker(&conf, settings).await?;

    if conf.health.enabled {
        Arc::clone(&ctx.health).spawn();

        let mut events = ctx.health.subscribe();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                warn!(
                    "Tunnel connection error: {} may be down ({}). Check your settings.",
                    event.endpoint, event.reason
                );
            }
        });
    }

    let state = server::AppState {
        ctx,
        controller,
        prober: Arc::new(WsProber),
        probe_timeout: conf.health_timeout(),
        local_origin: Url::parse(&format!("http://{}", addr))?,
        tabs: Arc::new(parking_lot::Mutex::new(TabRegistry::new())),
    };

    tokio::select! {
        res = server::serve(state, addr) => res?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down..."),
    }

    Ok(())
}

async fn run_fetch(conf: GatewayConfig, settings: SettingsStore, inputs: Vec<String>) -> Result<()> {
    let (ctx, _controller) = start_worker(&conf, settings).await?;
    let origin = Url::parse(&format!("http://{}", conf.listen))?;

    let mut tabs = TabRegistry::new();
    let mut loads = Vec::new();
    for input in &inputs {
        tabs.create_tab(true);
        let Some(target) = tabs.navigate(input) else {
            warn!("Skipping empty input");
            continue;
        };
        let url = origin
            .join(&ctx.gateway.codec().encode(&target))
            .with_context(|| format!("Cannot build tunnel URL for {}", target))?;

        let gateway = Arc::clone(&ctx.gateway);
        loads.push(tokio::spawn(async move {
            let resp = gateway.handle(InterceptedRequest::navigate(url)).await;
            (target, resp)
        }));
    }

    for load in loads {
        let (target, resp) = load.await?;
        println!(
            "  {} {} {} ({} bytes)",
            if resp.status < 400 { "✓" } else { "✗" },
            resp.status,
            target,
            resp.body.len()
        );
    }

    Ok(())
}

async fn run_probe(conf: GatewayConfig, settings: SettingsStore, url: Option<String>) -> Result<()> {
    let url = match url {
        Some(url) => url,
        None => settings.endpoint_or(&conf.default_endpoint)?,
    };

    let prober: &dyn Prober = &WsProber;
    match probe_endpoint(prober, &url, conf.health_timeout()).await {
        Ok(()) => println!("✓ {} accepted the handshake", url),
        Err(e) => {
            println!("✗ {}: {}", url, e);
            anyhow::bail!("Probe failed");
        }
    }

    Ok(())
}
