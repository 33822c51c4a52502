//! simplelb - a round-robin HTTP load balancer
//!
//! Usage:
//!     simplelb [--config <path>] [--listen <addr>] <backend-url>...
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use simplelb::backend::{Backend, BackendPool};
use simplelb::config::{load_config, Config, ConfigOverrides};
use simplelb::frontend::FrontendListener;
use simplelb::health::HealthChecker;
use simplelb::metrics::{MetricsCollector, MetricsServer};
use simplelb::proxy::{HttpTransport, LoadBalanceHandler, RetryPolicy};
use simplelb::util::{init_logging, ShutdownSignal};

/// A round-robin HTTP load balancer with health checking and failover.
#[derive(Parser, Debug)]
#[command(name = "simplelb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Backend URLs (http://host[:port]), comma separated or repeated
    #[arg(value_name = "BACKEND", value_delimiter = ',')]
    backends: Vec<String>,

    /// Path to a YAML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let overrides = ConfigOverrides {
        backends: cli.backends,
        listen: cli.listen,
        log_level: cli.log_level,
    };

    let config = load_config(cli.config.as_deref(), overrides).with_context(|| match &cli.config {
        Some(path) => format!("failed to load configuration from '{}'", path.display()),
        None => "invalid command-line configuration".to_string(),
    })?;

    init_logging(&config.global.log_level, &config.global.log_format)
        .context("failed to initialize logging")?;

    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Listen: {}", config.listen);
        println!("  Backends: {}", config.backends.len());
        for backend in &config.backends {
            println!("    - {}", backend);
        }
        return Ok(());
    }

    info!(
        listen = %config.listen,
        backends = config.backends.len(),
        "simplelb starting"
    );

    run(config)
}

/// Run the load balancer with the given configuration.
fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(async { run_async(config).await })
}

/// Async entry point for the load balancer.
async fn run_async(config: Config) -> Result<()> {
    let shutdown = ShutdownSignal::new();
    let metrics = MetricsCollector::new();

    let backends = config
        .backends
        .iter()
        .map(|url| Backend::parse(url))
        .collect::<Result<Vec<_>, _>>()
        .context("invalid backend address")?;

    for backend in &backends {
        info!(backend = %backend, "configured backend");
        metrics.set_backend_alive(&backend.to_string(), true);
    }

    let pool = Arc::new(BackendPool::new(backends).context("failed to create backend pool")?);

    let transport = HttpTransport::new(config.proxy.connect_timeout, config.proxy.request_timeout);
    let handler = Arc::new(
        LoadBalanceHandler::new(
            Arc::clone(&pool),
            transport,
            RetryPolicy::from(&config.retry),
            metrics.clone(),
        )
        .with_max_body_size(config.proxy.max_body_size),
    );

    let listener = FrontendListener::bind(config.listen, handler, &config.proxy)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.listen))?;

    let mut handles = Vec::new();

    let checker = HealthChecker::new(
        Arc::clone(&pool),
        metrics.clone(),
        config.health_check.interval,
        config.health_check.timeout,
    );
    handles.push(tokio::spawn(checker.run(shutdown.subscribe())));

    let metrics_config = &config.global.metrics;
    if metrics_config.enabled {
        let server = MetricsServer::bind(
            metrics_config.address,
            metrics_config.path.clone(),
            metrics.clone(),
            Arc::clone(&pool),
        )
        .await
        .with_context(|| format!("failed to bind metrics server on {}", metrics_config.address))?;
        handles.push(tokio::spawn(server.run(shutdown.subscribe())));
    }

    let frontend = tokio::spawn(listener.run(shutdown.subscribe()));

    info!("simplelb is running");
    info!("press Ctrl+C to stop");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("received shutdown signal");
        }
        Err(e) => {
            error!(error = %e, "failed to listen for shutdown signal");
        }
    }

    shutdown.shutdown();

    // The frontend drains in-flight requests within its grace period
    let _ = frontend.await;
    for handle in handles {
        let _ = handle.await;
    }

    info!("simplelb shut down complete");
    Ok(())
}
