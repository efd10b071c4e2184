/// Anonroute Daemon - per-destination circuit routing
///
/// This daemon attaches to the network client's control port and:
/// - Builds one circuit per destination named in the routing rules
/// - Attaches new streams to their destination's circuit
/// - Rebuilds circuits that fail or close
/// - Serves a read-only status API

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use anonroute_common::{flatten_rules, retry, RouterConfig};
use anonroute_core::{
    BroadcastNotifier, ControlChannel, FingerprintGeoIndex, JsonRuleStore, Notification,
    NotificationSink, RouteEntry, RuleStore, Session, SessionOptions, TorControlClient,
};
use anonroute_daemon::ApiServer;

const DEFAULT_CONFIG_PATH: &str = "anonroute.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let mut command = None;
    let mut config_path = None;
    let mut rest = args.iter().skip(1);
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = rest.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            other if command.is_none() => command = Some(other.to_string()),
            other => {
                eprintln!("Unexpected argument: {}", other);
                std::process::exit(1);
            }
        }
    }

    match command.as_deref().unwrap_or("run") {
        "help" | "--help" | "-h" => print_help(),
        "version" | "--version" | "-v" => {
            println!("Anonroute Daemon v{}", env!("CARGO_PKG_VERSION"));
        }
        "run" => {
            let config = load_config(config_path)?;
            init_logging(config.verbose);
            run_router(config).await?;
        }
        "routes" => {
            let config = load_config(config_path)?;
            init_logging(config.verbose);
            print_configured_routes(&config).await?;
        }
        other => {
            eprintln!("Unknown command: {}", other);
            eprintln!("Run with 'help' to see available commands");
            std::process::exit(1);
        }
    }

    Ok(())
}

/// INFO by default, DEBUG when verbose; RUST_LOG wins over both
fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: Option<PathBuf>) -> Result<RouterConfig> {
    if let Some(path) = path {
        return RouterConfig::from_file(&path)
            .with_context(|| format!("loading configuration from {}", path.display()));
    }

    let config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    if config_path.exists() {
        return Ok(RouterConfig::from_file(&config_path)?);
    }

    let config = RouterConfig::default();
    // Save default config for next time
    if let Err(e) = config.to_file(&config_path) {
        eprintln!("Failed to save default config: {}", e);
    }
    Ok(config)
}

/// Connect, start the session and serve until Ctrl+C
async fn run_router(config: RouterConfig) -> Result<()> {
    info!("Starting Anonroute Daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("Control port: {}", config.control_addr);

    // The client needs a moment before its control port answers
    tokio::time::sleep(Duration::from_millis(retry::CONTROL_SETTLE_MS)).await;

    let client = TorControlClient::new(config.control_addr.clone(), config.control_auth.clone())
        .with_command_timeout(config.command_timeout());
    client
        .authenticate()
        .await
        .with_context(|| format!("authenticating to control port {}", config.control_addr))?;
    let control: Arc<dyn ControlChannel> = Arc::new(client);

    // Shared by the session and the API's event stream
    let notifier = BroadcastNotifier::default();

    let rules = JsonRuleStore::new(config.rules_path.clone()).load_rules().await?;

    let geo_index = match &config.geo_index_path {
        Some(path) => match FingerprintGeoIndex::load(path).await {
            Ok(index) => index,
            Err(e) => {
                notifier.notify(Notification::proxy_error(format!(
                    "Error parsing fingerprint data: {}",
                    e
                )));
                return Err(e.into());
            }
        },
        None => {
            info!("No geo index configured, relay locations unavailable");
            FingerprintGeoIndex::new()
        }
    };

    let session = Arc::new(
        Session::new(control, Arc::new(notifier.clone()), SessionOptions::from(&config))
            .with_geo_index(geo_index),
    );

    // Serve before starting so event subscribers see the start itself
    let api_addr: SocketAddr = config.api_addr.parse()?;
    info!("API server will listen on: {}", api_addr);
    let api_server = ApiServer::new(api_addr, session.clone(), notifier);
    tokio::spawn(async move {
        if let Err(e) = api_server.start().await {
            warn!("API server error: {}", e);
        }
    });

    let routes = session.start(&rules).await?;
    print_routes(&routes);

    info!("Routing is active. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received");
    session.stop().await?;

    info!("Daemon stopped");
    Ok(())
}

async fn print_configured_routes(config: &RouterConfig) -> Result<()> {
    let rules = JsonRuleStore::new(config.rules_path.clone()).load_rules().await?;
    let specs = flatten_rules(&rules);

    println!("\n========================================");
    println!("         Configured Routes");
    println!("========================================");
    for spec in &specs {
        let exits: Vec<&str> = spec.exit_countries.iter().map(|c| c.as_str()).collect();
        println!(
            "{:<30} hops={} exits=[{}]",
            spec.target_address,
            spec.hops,
            exits.join(",")
        );
    }
    println!("Total:            {}", specs.len());
    println!("========================================\n");
    Ok(())
}

fn print_routes(routes: &[RouteEntry]) {
    println!("\n========================================");
    println!("         Routing Map");
    println!("========================================");
    for route in routes {
        println!("{:<30} circuit {}", route.target, route.circuit_id);
    }
    println!("Mapped:           {}", routes.len());
    println!("========================================\n");
}

/// Print help message
fn print_help() {
    println!("Anonroute Daemon - per-destination circuit routing");
    println!();
    println!("USAGE:");
    println!("    anonroute-daemon [COMMAND] [--config <path>]");
    println!();
    println!("COMMANDS:");
    println!("    run         Build circuits for the routing rules and keep them healthy (default)");
    println!("    routes      Print the routes the rules expand to");
    println!("    help        Show this help message");
    println!("    version     Show version information");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <path>   TOML configuration (default: {})", DEFAULT_CONFIG_PATH);
    println!();
    println!("API:");
    println!("    GET /health              Liveness");
    println!("    GET /api/routes          Destination to circuit bindings");
    println!("    GET /api/rules           Configured routes");
    println!("    GET /api/relay/current   Entry relay of the active circuit");
    println!("    GET /api/status          Session status");
    println!("    GET /api/events          Notifications as server-sent events");
}
