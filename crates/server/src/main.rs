//! Keyhole server binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use keyhole_core::config::AppConfig;
use keyhole_metadata::{MetadataRepo, PostgresRepo};
use keyhole_server::{AppState, GrantAuthenticator, create_router};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const CONFIG_TEMPLATE: &str = include_str!("config_template.toml");

/// Keyhole - metadata search for encrypted object storage
#[derive(Parser, Debug)]
#[command(name = "keyholed")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "KEYHOLE_CONFIG",
        default_value = "config/keyhole.toml"
    )]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the search server
    Run,
    /// Apply the database schema
    Migrate,
    /// Write a configuration template
    Setup,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.command {
        Command::Run => run(&args.config).await,
        Command::Migrate => migrate(&args.config).await,
        Command::Setup => setup(&args.config),
    }
}

fn load_config(path: &str) -> Result<AppConfig> {
    let mut figment = Figment::new();

    if Path::new(path).exists() {
        tracing::info!(config_path = %path, "loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!(config_path = %path, "no config file found, using environment only");
    }

    figment
        .merge(Env::prefixed("KEYHOLE_").split("__"))
        .extract()
        .context("failed to load configuration")
}

async fn connect(config: &AppConfig) -> Result<PostgresRepo> {
    let repo = PostgresRepo::from_url(
        &config.database.url,
        config.database.max_connections,
        config.database.statement_timeout_ms,
    )
    .await
    .context("failed to connect to the database")?;

    repo.health_check()
        .await
        .context("database health check failed")?;
    Ok(repo)
}

async fn run(config_path: &str) -> Result<()> {
    tracing::info!("Keyhole v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(config_path)?;
    let repo = Arc::new(connect(&config).await?) as Arc<dyn MetadataRepo>;
    tracing::info!("metadata repository initialized");

    let auth = Arc::new(GrantAuthenticator::new());
    let sweep_interval = config.server.sweep_interval();
    let bind = config.server.bind.clone();

    let state = AppState::new(config, repo, auth);
    state.migrator.clone().start(sweep_interval);
    tracing::info!("migration sweeper started");

    let app = create_router(state);

    let addr: SocketAddr = bind.parse().context("invalid bind address")?;
    tracing::info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn migrate(config_path: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let repo = connect(&config).await?;

    tracing::info!("running database migrations");
    repo.migrate().await.context("database migration failed")?;
    tracing::info!("database migrations applied");
    Ok(())
}

fn setup(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        anyhow::bail!("configuration already exists at {}", path.display());
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    std::fs::write(path, CONFIG_TEMPLATE)
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(config_path = %path.display(), "wrote configuration template");
    Ok(())
}
