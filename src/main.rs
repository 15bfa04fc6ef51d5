// src/main.rs

//! The main entry point for the controller binary.

use ms_controller::ControllerError;
use ms_controller::config::{ControllerConfig, DynamicConfigWatcher};
use ms_controller::core::client::ControlClient;
use ms_controller::core::leader::AlwaysLeader;
use ms_controller::core::persist::ClusterStatusWriter;
use ms_controller::core::planner::{PlannerContext, RatePlanner};
use ms_controller::core::probe::WorkerProber;
use ms_controller::core::publish::CoordinatorPublisher;
use ms_controller::core::scheduler::ClusterScheduler;
use ms_controller::core::status::NodeStatusStore;
use ms_controller::core::switch::RoleSwitcher;
use ms_controller::core::topology::RankTableLoader;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = std::env::args().collect();
    if args.contains(&"--version".to_string()) {
        println!("ms_controller version {VERSION}");
        return;
    }

    // Load the controller configuration first; the server cannot run
    // without a valid one.
    let config_path = ControllerConfig::resolve_path();
    let config = match ControllerConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "Failed to load configuration from \"{}\": {e}",
                config_path.display()
            );
            std::process::exit(1);
        }
    };

    // Setup logging with reloading capabilities. The env var wins over
    // the configured level.
    let initial_log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact() // Use the compact, single-line format.
                .with_ansi(true), // Enable ANSI color codes for log levels.
        )
        .init();
    let reload_handle = Arc::new(reload_handle);

    info!("ms_controller {VERSION} starting");
    if let Err(e) = run_app(config, config_path, reload_handle).await {
        error!("controller runtime error: {e:#}");
        let code = e
            .downcast_ref::<ControllerError>()
            .map(ControllerError::exit_code)
            .unwrap_or(1);
        std::process::exit(if code == 0 { 1 } else { code });
    }
}

async fn run_app(
    config: ControllerConfig,
    config_path: std::path::PathBuf,
    reload_handle: Arc<reload::Handle<EnvFilter, tracing_subscriber::Registry>>,
) -> anyhow::Result<()> {
    // Composition root: construct everything once and pass handles
    // explicitly; no component owns hidden global state.
    let shared_config = Arc::new(RwLock::new(config.clone()));
    let store = Arc::new(NodeStatusStore::new());
    let loader = Arc::new(RankTableLoader::from_env(config.check_mounted_files));
    let client = Arc::new(ControlClient::new(&config)?);
    let prober = WorkerProber::new(store.clone(), client.clone());
    let switcher = RoleSwitcher::new(store.clone(), client.clone());
    let publisher = CoordinatorPublisher::new(store.clone(), client.clone());
    // Validate the planner parameter files up front; a capacity planner
    // linked in place of the rate-based default consumes this context.
    if !config.model_config_path.is_empty() || !config.machine_config_path.is_empty() {
        let context = PlannerContext::build(&config)?;
        info!(
            "planner context assembled: {} model and {} machine parameters",
            context.model_params.len(),
            context.machine_params.len()
        );
    }
    let planner = Arc::new(RatePlanner::from_config(&config));
    let leader = Arc::new(AlwaysLeader);

    let scheduler = ClusterScheduler::new(
        shared_config.clone(),
        store.clone(),
        loader,
        prober,
        switcher,
        publisher,
        planner,
        leader,
    );

    // Fatal bootstrap errors carry the exit-code contract: invalid
    // topology exits 2, invalid configuration exits 1.
    scheduler.bootstrap().await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut tasks: JoinSet<()> = JoinSet::new();

    let mut watcher = DynamicConfigWatcher::new(config_path, shared_config.clone());
    watcher.subscribe("log_level", move |value| {
        let Some(level) = value.as_str() else {
            warn!("ignoring non-string log_level");
            return;
        };
        match EnvFilter::try_new(level) {
            Ok(filter) => {
                if reload_handle.reload(filter).is_ok() {
                    info!("log level changed to '{level}'");
                }
            }
            Err(e) => warn!("ignoring invalid log_level '{level}': {e}"),
        }
    });
    tasks.spawn(watcher.run(shutdown_tx.subscribe()));

    let status_writer = ClusterStatusWriter::new(store.clone(), shared_config.clone());
    tasks.spawn(status_writer.run(shutdown_tx.subscribe()));

    tasks.spawn(scheduler.run(shutdown_tx.subscribe()));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!("failed to listen for shutdown signal: {e}"),
    }

    // Deterministic shutdown: broadcast stop, then join every task.
    let _ = shutdown_tx.send(());
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!("a background task panicked during shutdown: {e}");
        }
    }
    info!("ms_controller stopped cleanly");
    Ok(())
}
