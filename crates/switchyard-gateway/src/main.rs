//! switchyard: Distributed Conversation Router Main Binary
//!
//! Main entry point for one supervisor process.
//!
//! Usage:
//!   switchyard                 - Start server mode (HTTP API + runtime loops)
//!   switchyard --cli           - Start interactive CLI mode
//!   switchyard --execute "..." - Route one message and exit
//!   switchyard --help          - Show help

mod cli;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use switchyard_core::agent::register_builtin_agents;
use switchyard_core::{
    open_backend, AgentRegistry, Config, KeywordClassifier, Runtime, SessionStore, Supervisor,
    SupervisorDirectory,
};

/// Run mode
enum RunMode {
    /// Server mode (HTTP API + runtime loops)
    Server,
    /// Interactive CLI mode
    Cli,
    /// Route one message, print the reply, exit
    Execute(String),
    /// Show help
    Help,
    /// Show version
    Version,
}

/// Parsed command line
struct CliArgs {
    mode: RunMode,
    config_path: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = parse_args()?;

    match args.mode {
        RunMode::Help => {
            print_help();
            return Ok(());
        }
        RunMode::Version => {
            println!("switchyard {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }
    let mode = args.mode;

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    // Load .env file
    dotenvy::dotenv().ok();

    // Load configuration (--config path, else switchyard.toml, else environment)
    let mut config = match args.config_path.as_deref() {
        Some(path) => Config::from_toml_file(path)
            .map_err(|e| anyhow::anyhow!("Config error in {}: {}", path, e))?,
        None => Config::load().map_err(|e| anyhow::anyhow!("Config error: {}", e))?,
    };
    if config.supervisor.id.trim().is_empty() {
        config.supervisor.id = generate_supervisor_id();
    }

    tracing::info!("Starting switchyard...");
    tracing::info!(
        "Supervisor {} at {} ({:?} store)",
        config.supervisor.id,
        config.supervisor.address,
        config.store.backend
    );

    let supervisor = build_supervisor(&config)?;

    match mode {
        RunMode::Cli => {
            tracing::info!("Running in CLI mode");
            run_cli_mode(config, supervisor).await
        }
        RunMode::Execute(message) => cli::run_execute(supervisor, &message).await,
        RunMode::Server => run_server(config, supervisor).await,
        _ => Ok(()),
    }
}

/// Parse command line arguments
fn parse_args() -> anyhow::Result<CliArgs> {
    let args: Vec<String> = std::env::args().collect();

    let mut mode = RunMode::Server;
    let mut config_path = None;

    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "server" => mode = RunMode::Server,
            "cli" | "--cli" | "-c" => mode = RunMode::Cli,
            "--execute" | "-e" => {
                let message = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--execute requires a message argument"))?;
                mode = RunMode::Execute(message.clone());
            }
            "--config" => {
                let path = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--config requires a file path argument"))?;
                config_path = Some(path.clone());
            }
            "--help" | "-h" => return Ok(CliArgs { mode: RunMode::Help, config_path }),
            "--version" | "-v" => return Ok(CliArgs { mode: RunMode::Version, config_path }),
            other => {
                return Err(anyhow::anyhow!(
                    "Unknown argument: {} (try --help)",
                    other
                ));
            }
        }
    }

    Ok(CliArgs { mode, config_path })
}

/// Print help message
fn print_help() {
    println!("switchyard - Distributed Conversation Router");
    println!();
    println!("Usage:");
    println!("  switchyard                 Start server mode (HTTP API + runtime loops)");
    println!("  switchyard --cli           Start interactive CLI mode");
    println!("  switchyard --execute MSG   Route one message and exit");
    println!("  switchyard --config PATH   Load configuration from PATH");
    println!("  switchyard --help          Show this help message");
    println!("  switchyard --version       Show version");
    println!();
    println!("Configuration is read from ./switchyard.toml when present.");
    println!();
    println!("Environment Variables:");
    println!("  SUPERVISOR_ID            Supervisor id (default: generated)");
    println!("  SUPERVISOR_ADDRESS       Address advertised for redirects (default: 127.0.0.1:8080)");
    println!("  MAX_SESSIONS             Concurrent turn ceiling (default: 50)");
    println!("  DISPATCH_TIMEOUT_SECS    Per-dispatch timeout (default: 60)");
    println!("  STORE_BACKEND            sqlite or memory (default: sqlite)");
    println!("  STORE_PATH               SQLite database path (default: data/switchyard.db)");
    println!("  SESSION_TTL_SECS         Session idle expiry (default: 3600)");
    println!("  HEARTBEAT_INTERVAL_SECS  Heartbeat publish interval (default: 30)");
    println!("  LIVENESS_MULTIPLIER      Missed beats before a peer counts as stale (default: 3)");
    println!("  API_HOST                 HTTP API bind host (default: 0.0.0.0)");
    println!("  API_PORT                 HTTP API port (default: 8080)");
}

fn generate_supervisor_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("sup-{}", &id[..8])
}

/// Wire the supervisor together: backend, store, registry, directory
fn build_supervisor(config: &Config) -> anyhow::Result<Arc<Supervisor>> {
    let backend = open_backend(&config.store)
        .map_err(|e| anyhow::anyhow!("Failed to open state backend: {}", e))?;

    let store = SessionStore::new(backend.clone(), config.store.session_ttl());
    let registry = Arc::new(AgentRegistry::new(config.heartbeat.liveness_threshold()));
    let directory = SupervisorDirectory::new(backend, config.heartbeat.liveness_threshold());

    register_builtin_agents(&registry)
        .map_err(|e| anyhow::anyhow!("Failed to register built-in agents: {}", e))?;
    tracing::info!("Registered {} built-in agents", registry.len());

    Ok(Arc::new(Supervisor::new(
        &config.supervisor,
        store,
        registry,
        directory,
        Arc::new(KeywordClassifier::new()),
    )))
}

/// Run server mode (HTTP API + runtime loops)
async fn run_server(config: Config, supervisor: Arc<Supervisor>) -> anyhow::Result<()> {
    // Visible in the directory before the first request arrives
    supervisor
        .publish_heartbeat()
        .await
        .map_err(|e| anyhow::anyhow!("Initial heartbeat failed: {}", e))?;

    let runtime = Runtime::new(supervisor.clone(), config.heartbeat.clone()).start();

    // Start HTTP API server
    let api_config = config.api.clone();
    let api_supervisor = supervisor.clone();
    let api = tokio::spawn(async move {
        if let Err(e) = switchyard_api::start_server(&api_config, api_supervisor).await {
            tracing::error!("HTTP API error: {}", e);
        }
    });
    tracing::info!("HTTP API server started on port {}", config.api.port);

    tracing::info!("switchyard initialized successfully");
    tracing::info!("Press Ctrl+C to exit");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    api.abort();
    runtime.stop().await;

    // Leave the directory so peers stop redirecting to this instance;
    // owned sessions stay in the store for adoption
    if let Err(e) = supervisor.withdraw().await {
        tracing::warn!("Could not withdraw supervisor record: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Run CLI mode with the runtime loops alive, so heartbeats keep flowing
/// while the user types
async fn run_cli_mode(config: Config, supervisor: Arc<Supervisor>) -> anyhow::Result<()> {
    supervisor
        .publish_heartbeat()
        .await
        .map_err(|e| anyhow::anyhow!("Initial heartbeat failed: {}", e))?;
    let runtime = Runtime::new(supervisor.clone(), config.heartbeat.clone()).start();

    let result = cli::run_cli(supervisor.clone()).await;

    runtime.stop().await;
    if let Err(e) = supervisor.withdraw().await {
        tracing::warn!("Could not withdraw supervisor record: {}", e);
    }

    result
}
