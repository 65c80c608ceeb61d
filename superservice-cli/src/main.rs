//! SuperService CLI

use anyhow::Result;
use axum::extract::Path;
use axum::routing::get;
use axum::Router;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use superservice_config::{load_config, LogFormat, ServiceConfig};
use superservice_core::Error;
use superservice_discovery::{ConsulConfig, FinderRegistry};
use superservice_runtime::{discover_service_with_tag, SuperService};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "superservice")]
#[command(about = "Single-port gRPC and HTTP service runtime", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the demo service
    Serve {
        /// Path to configuration file, defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Port to listen on, overrides the configuration
        #[arg(short, long, env = "SUPERSERVICE_PORT")]
        port: Option<u16>,

        /// Service name (`name` or `name:tag`), overrides the configuration
        #[arg(short, long)]
        name: Option<String>,

        /// Log level (trace, debug, info, warn, error)
        #[arg(short, long)]
        log_level: Option<String>,
    },

    /// Validate configuration file
    Validate {
        /// Path to configuration file
        #[arg(short, long, default_value = "superservice.yaml")]
        config: PathBuf,
    },

    /// Resolve a service through the registry
    Resolve {
        /// Service name
        service: String,

        /// Tag to filter instances by
        #[arg(short, long, default_value = "")]
        tag: String,

        /// Path to configuration file for the registry address
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            port,
            name,
            log_level,
        } => {
            let mut config = read_config(config.as_ref())?;
            if let Some(port) = port {
                config.service.port = port;
            }
            if let Some(name) = name {
                config.service.name = name;
            }
            let level = log_level.unwrap_or_else(|| config.log.level.clone());
            init_tracing(&level, config.log.format)?;

            tracing::info!(
                service = %config.service.name,
                port = config.service.port,
                registry = config.registry.enabled,
                "Configuration loaded"
            );

            let result = SuperService::from_config(&config)
                .with_http_handler("/hello", hello_routes())
                .with_named_worker("heartbeat", heartbeat)
                .listen_and_serve(config.service.port)
                .await;

            match result {
                Err(Error::Signal(signal)) => {
                    tracing::info!(signal = %signal, "Service stopped");
                    Ok(())
                }
                Err(e) => Err(e.into()),
                Ok(()) => Ok(()),
            }
        }

        Commands::Validate { config } => {
            tracing_subscriber::fmt().with_target(false).init();

            tracing::info!("Validating configuration: {}", config.display());

            match load_config(&config) {
                Ok(cfg) => {
                    tracing::info!("✓ Configuration is valid");
                    tracing::info!("  Service: {}", display_or(&cfg.service.name, "(unnamed)"));
                    tracing::info!("  Port: {}", cfg.service.port);
                    tracing::info!("  Registry: {} (enabled: {})", cfg.registry.address, cfg.registry.enabled);
                    tracing::info!("  Grace period: {:?}", cfg.runtime.grace_period);
                    Ok(())
                }
                Err(e) => {
                    tracing::error!("✗ Configuration validation failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Resolve { service, tag, config } => {
            let config = read_config(config.as_ref())?;
            init_tracing("warn", config.log.format)?;

            let finders = FinderRegistry::new(ConsulConfig::from(&config.registry));
            finders.use_registry();

            match discover_service_with_tag(&finders, &service, &tag).await {
                Some(address) => {
                    println!("{address}");
                    Ok(())
                }
                None => {
                    eprintln!("service {service} with tag '{tag}' not found");
                    std::process::exit(1);
                }
            }
        }

        Commands::Version => {
            println!("SuperService");
            println!("Version: {}", env!("CARGO_PKG_VERSION"));
            println!("Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
            Ok(())
        }
    }
}

fn read_config(path: Option<&PathBuf>) -> Result<ServiceConfig> {
    Ok(match path {
        Some(path) => load_config(path)?,
        None => ServiceConfig::default(),
    })
}

fn display_or<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.is_empty() {
        fallback
    } else {
        value
    }
}

fn init_tracing(level: &str, format: LogFormat) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_level(true))
            .try_init()?,
        LogFormat::Json => registry.with(fmt::layer().json()).try_init()?,
    }

    Ok(())
}

fn hello_routes() -> Router {
    Router::new()
        .route("/", get(|| async { "hello" }))
        .route("/:name", get(|Path(name): Path<String>| async move { format!("hello {name}") }))
}

async fn heartbeat(token: CancellationToken) -> Result<()> {
    let mut ticker = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            _ = ticker.tick() => tracing::debug!("heartbeat"),
        }
    }
}
