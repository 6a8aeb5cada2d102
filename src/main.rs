//! Kubernetes Storage Version Migrator
//!
//! Main entry point. Parses the command line, sets up the Kubernetes client
//! and runs a single migration, creates migration objects, or runs the
//! controller.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use storage_version_migrator::{
    adapters::{KubeDiscovery, KubeResourceClient},
    config::{self, Cli, Command, ControllerArgs, LogFormat, OutputFormat, RunArgs, SelectionArgs},
    controllers::{self, Context},
    metrics,
    migrator::{EligibilityFilter, FileProgressStore, Migrator, MigratorConfig, ProgressTracker},
    reconcilers::migration as migration_reconciler,
};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize tracing
    init_tracing(cli.log_format);

    let file_config = config::load_config(cli.config.as_deref())?;
    let client = config::kube_client(cli.kubeconfig.as_deref(), cli.context.as_deref()).await?;
    info!("Connected to Kubernetes API server");

    match cli.command {
        Command::Run(args) => run(client, file_config, args).await,
        Command::Launch(selection) => launch(client, file_config, selection).await,
        Command::Controller(args) => controller(client, file_config, args).await,
    }
}

/// One full migration of every eligible resource type
async fn run(client: Client, file_config: MigratorConfig, args: RunArgs) -> anyhow::Result<ExitCode> {
    let config = config::apply_overrides(
        file_config,
        args.concurrency,
        args.chunk_size,
        Some(&args.selection),
    )?;

    let progress = match &args.progress_file {
        Some(path) => {
            let store = FileProgressStore::new(path);
            info!(path = %store.path().display(), "Checkpoints are kept on disk");
            ProgressTracker::new(Arc::new(store))
        }
        None => ProgressTracker::in_memory(),
    };

    let migrator = Migrator::new(
        Arc::new(KubeDiscovery::new(client.clone())),
        Arc::new(KubeResourceClient::new(client)),
        progress,
        config,
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Received shutdown signal, stopping after in-flight writes");
        on_signal.cancel();
    });

    let report = migrator.run(&cancel).await?;

    let rendered = match args.output {
        OutputFormat::Json => serde_json::to_string_pretty(&report)?,
        OutputFormat::Yaml => serde_yaml::to_string(&report)?,
    };
    println!("{}", rendered);

    if report.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Create a StorageVersionMigration per eligible resource type
async fn launch(
    client: Client,
    file_config: MigratorConfig,
    selection: SelectionArgs,
) -> anyhow::Result<ExitCode> {
    let config = config::apply_overrides(file_config, None, None, Some(&selection))?;
    let filter = EligibilityFilter::new(config.eligibility);

    let created = migration_reconciler::launch_migrations(&client, &filter).await?;
    info!(created = created.len(), "Storage migrations launched");
    for name in created {
        println!("{}", name);
    }

    Ok(ExitCode::SUCCESS)
}

/// Run the controller and the metrics server until shutdown
async fn controller(
    client: Client,
    file_config: MigratorConfig,
    args: ControllerArgs,
) -> anyhow::Result<ExitCode> {
    info!("Starting Storage Version Migrator controller");

    let config = config::apply_overrides(file_config, args.concurrency, args.chunk_size, None)?;
    let cancel = CancellationToken::new();

    // Create shared context
    let context = Arc::new(Context::new(client.clone(), config, cancel.clone()));

    // Start metrics server
    let metrics_handle = tokio::spawn(metrics::serve(args.metrics_port));
    info!("Metrics server starting on port {}", args.metrics_port);

    let migration_controller = controllers::run_migration_controller(client, context);
    tokio::pin!(migration_controller);

    // Handle graceful shutdown
    tokio::select! {
        _ = &mut migration_controller => {
            error!("Migration controller exited unexpectedly");
        }
        _ = metrics_handle => {
            error!("Metrics server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping controller");
            cancel.cancel();
            migration_controller.await;
        }
    }

    metrics::MIGRATOR_HEALTH.set(0.0);
    info!("Storage Version Migrator stopped");
    Ok(ExitCode::SUCCESS)
}

/// Initialize tracing subscriber
fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        // Logs go to stderr; stdout carries the report
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
