use anyhow::anyhow;
use clap::{Parser, Subcommand, ValueEnum};
use mltr_api::{run_server, ApiState};
use mltr_broker::KafkaPublisher;
use mltr_engines::create_engine;
use mltr_types::AppConfig;
use mltr_worker::{run_workers, WorkerContext, WorkerRole};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "mltr", about = "Task-oriented multilingual translation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the ingress API server.
    Api,
    /// Run stage workers (default: all roles in one process).
    Worker {
        #[arg(value_enum, default_value_t = RoleArg::All)]
        role: RoleArg,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    All,
    Audio,
    Translation,
    Packaging,
}

impl From<RoleArg> for WorkerRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::All => WorkerRole::All,
            RoleArg::Audio => WorkerRole::Audio,
            RoleArg::Translation => WorkerRole::Translation,
            RoleArg::Packaging => WorkerRole::Packaging,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --- Configuration Loading ---
    let config = match mltr_config::load_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            // Basic print here as tracing is not initialized yet
            eprintln!("FATAL: Failed to load configuration: {}", e);
            AppConfig::default()
        }
    };

    // --- Logging Initialization ---
    let log_level = Level::from_str(&config.log_level).unwrap_or_else(|_| {
        eprintln!(
            "Warning: Invalid log level '{}' in config, defaulting to INFO",
            config.log_level
        );
        Level::INFO
    });
    let filter_layer = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt::layer())
        .init();

    info!(app_name = %config.app_name, "MLTR starting...");

    // --- Database Initialization ---
    info!("Initializing task store...");
    let db_pool = mltr_db::init_db(&config.database.url)
        .await
        .map_err(|e| anyhow!("Database initialization failed: {}", e))?;

    let config = Arc::new(config);

    match cli.command.unwrap_or(Command::Worker { role: RoleArg::All }) {
        Command::Api => run_api(config, db_pool).await,
        Command::Worker { role } => run_worker_process(config, db_pool, role.into()).await,
    }
}

async fn run_api(config: Arc<AppConfig>, db_pool: sqlx::SqlitePool) -> anyhow::Result<()> {
    info!("Initializing Kafka producer...");
    let publisher = Arc::new(KafkaPublisher::new(&config.broker)?);

    let state = Arc::new(ApiState {
        config,
        db_pool,
        publisher,
    });

    let mut server_handle = tokio::spawn(run_server(state));
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down API server...");
        }
        result = &mut server_handle => {
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(e.into()),
            };
        }
    }
    server_handle.abort();
    info!("MLTR API exiting.");
    Ok(())
}

async fn run_worker_process(
    config: Arc<AppConfig>,
    db_pool: sqlx::SqlitePool,
    role: WorkerRole,
) -> anyhow::Result<()> {
    info!("Initializing AI engine...");
    let engine = create_engine(&config)?;
    info!("Initializing Kafka producer...");
    let publisher = Arc::new(KafkaPublisher::new(&config.broker)?);

    let ctx = Arc::new(WorkerContext {
        config,
        db_pool,
        engine,
        publisher,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut worker_handle = tokio::spawn(run_workers(ctx, role, shutdown_rx));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, initiating shutdown...");
            let _ = shutdown_tx.send(true);
            match worker_handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(e) => return Err(e.into()),
            }
        }
        result = &mut worker_handle => {
            // Workers only return on their own on a fatal error
            match result {
                Ok(Ok(())) => warn!("Workers exited unexpectedly without error"),
                Ok(Err(e)) => return Err(e.into()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    info!("MLTR workers exiting.");
    Ok(())
}
