use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use nanolink_gateway::collaborators::{InMemoryAuditSink, LatestMetricsStore, StaticTokenAuthority};
use nanolink_gateway::config::GatewayConfig;
use nanolink_gateway::dashboard::{DashboardState, Hub};
use nanolink_gateway::proto::nano_link_service_server::NanoLinkServiceServer;
use nanolink_gateway::{CommandRouter, GatewayService, GatewayServiceConfig, Reaper, Registry};

/// Default config file search paths (in order of priority).
const CONFIG_SEARCH_PATHS: &[&str] = &[
    "nanolink-gateway.yaml",
    "nanolink-gateway.toml",
    "/etc/nanolink/gateway.yaml",
    "/etc/nanolink/gateway.toml",
];

#[derive(Parser, Debug)]
#[command(name = "nanolink-gateway")]
#[command(author = "NanoLink Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "NanoLink agent fleet gateway", long_about = None)]
struct Args {
    /// Path to configuration file (auto-detected if not specified).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Print the resolved configuration and exit without starting the
    /// gateway.
    #[arg(long)]
    generate_config: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a sample configuration file and exit.
    Init {
        /// Output path for the config file.
        #[arg(short, long, default_value = "nanolink-gateway.yaml")]
        output: PathBuf,
        /// Use TOML instead of YAML.
        #[arg(long)]
        toml: bool,
    },
    /// Start the gateway (default if no subcommand is given).
    Run,
}

fn find_config_file() -> Option<PathBuf> {
    CONFIG_SEARCH_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

fn init_logging(level: &str) {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).compact().finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn write_sample_config(output: &std::path::Path, toml: bool) -> Result<()> {
    let sample = GatewayConfig::sample();
    let content = if toml {
        toml::to_string_pretty(&sample)?
    } else {
        serde_yaml::to_string(&sample)?
    };
    std::fs::write(output, content)?;
    println!("Wrote sample configuration to {}", output.display());
    Ok(())
}

async fn run_gateway(config: GatewayConfig) -> Result<()> {
    info!(
        grpc_port = config.grpc_port,
        dashboard_port = config.dashboard_port,
        require_authentication = config.require_authentication,
        "starting nanolink gateway"
    );

    let registry = Registry::new();
    let metrics = Arc::new(LatestMetricsStore::new());
    let audit = Arc::new(InMemoryAuditSink::new());
    let authority = Arc::new(StaticTokenAuthority::new(
        config.agent_token.clone(),
        config.agent_permission_level,
        config.super_admin_token.clone(),
    ));

    let hub = Hub::new(registry.clone(), metrics.clone(), config.subscriber_queue_depth);
    hub.install();

    // Constructed here so an embedding REST layer (out of scope for this
    // binary) can be handed a ready-to-use router; this process doesn't
    // call `execute` itself.
    let _router = CommandRouter::new(registry.clone(), authority.clone(), audit);

    let reaper = Reaper::new(
        registry.clone(),
        config.heartbeat_check_interval(),
        config.heartbeat_timeout(),
    );
    let reaper_handle = tokio::spawn(reaper.run());

    let grpc_service = GatewayService::new(
        registry.clone(),
        authority.clone(),
        metrics.clone(),
        hub.clone(),
        GatewayServiceConfig {
            require_authentication: config.require_authentication,
            async_callbacks: config.async_callbacks,
            command_timeout: config.command_timeout(),
            outbound_queue_depth: config.subscriber_queue_depth,
        },
    );

    let grpc_addr = format!("0.0.0.0:{}", config.grpc_port).parse()?;
    let service = NanoLinkServiceServer::new(grpc_service)
        .max_decoding_message_size(config.max_message_bytes)
        .max_encoding_message_size(config.max_message_bytes);
    let grpc_server = tonic::transport::Server::builder()
        .add_service(service)
        .serve(grpc_addr);

    let dashboard_state = DashboardState {
        hub: hub.clone(),
        token_validator: authority.clone(),
    };
    let dashboard_app = axum::Router::new()
        .route("/ws", axum::routing::get(nanolink_gateway::dashboard::upgrade_handler))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(dashboard_state);
    let dashboard_addr = format!("0.0.0.0:{}", config.dashboard_port);
    let dashboard_listener = tokio::net::TcpListener::bind(&dashboard_addr).await?;

    info!(%grpc_addr, %dashboard_addr, "gateway listening");

    tokio::select! {
        result = grpc_server => {
            result?;
        }
        result = axum::serve(dashboard_listener, dashboard_app) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    reaper_handle.abort();
    for conn in registry.snapshot() {
        conn.close();
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    if let Some(Commands::Init { output, toml }) = &args.command {
        return write_sample_config(output, *toml);
    }

    if args.generate_config {
        let sample = GatewayConfig::sample();
        println!("{}", serde_yaml::to_string(&sample)?);
        return Ok(());
    }

    let config_path = args.config.or_else(find_config_file);
    let config = match config_path {
        Some(path) => GatewayConfig::load(&path)?,
        None => {
            tracing::warn!("no configuration file found, using defaults");
            GatewayConfig::default()
        }
    };

    run_gateway(config).await
}
