use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use orgmirror::github::test_authentication;
use orgmirror::{Config, GitHubClient, SqliteStore, SyncEngine};

#[derive(Parser)]
#[command(name = "orgmirror")]
#[command(about = "Incremental GitHub organization mirror")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a configuration file
    Init {
        /// Organization login to mirror
        #[arg(long)]
        org: Option<String>,
    },

    /// Manage authentication
    Auth {
        #[command(subcommand)]
        auth_command: AuthCommands,
    },

    /// Mirror the organization incrementally
    Sync {
        /// Lower bound (RFC 3339); disables watermark resume
        #[arg(long)]
        since: Option<String>,

        /// Exclusive upper bound (RFC 3339)
        #[arg(long)]
        until: Option<String>,

        /// Organization to mirror instead of the configured one
        #[arg(long)]
        org: Option<String>,

        /// Ignore stored watermarks
        #[arg(long)]
        full: bool,
    },

    /// Refresh a single issue, pull request or discussion by node id
    Resync {
        /// Global node id
        node_id: String,
    },

    /// Show stored watermarks and recent sync runs
    Status,
}

#[derive(Subcommand)]
enum AuthCommands {
    /// Show authentication status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = load_config(cli.config.clone())?;

    init_logging(cli.verbose, &config)?;
    info!("Starting orgmirror v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Init { org } => cmd_init(org, cli.config, config),
        Commands::Auth {
            auth_command: AuthCommands::Status,
        } => test_authentication(&config).await,
        Commands::Sync {
            since,
            until,
            org,
            full,
        } => cmd_sync(since, until, org, full, config).await,
        Commands::Resync { node_id } => cmd_resync(&node_id, config).await,
        Commands::Status => cmd_status(&config),
    }
}

/// Initialize logging from verbosity and the logging section
fn init_logging(verbose: bool, config: &Config) -> Result<()> {
    let default_level = if verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    match config.logging.format.as_str() {
        "pretty" => registry.with(fmt::layer().pretty()).init(),
        _ => registry.with(fmt::layer().compact()).init(),
    }

    Ok(())
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) if path.exists() => Config::load(&path),
        Some(_) => Ok(Config::default()),
        None => Config::load_or_default(),
    }
}

fn open_store(config: &Config) -> Result<SqliteStore> {
    SqliteStore::open_at(std::path::Path::new(&config.database.path))
}

/// Write the configuration file
fn cmd_init(org: Option<String>, config_path: Option<PathBuf>, mut config: Config) -> Result<()> {
    if let Some(org) = org {
        config.github.organization = org;
    }

    let config_path = match config_path {
        Some(path) => path,
        None => Config::default_config_path()?,
    };
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }
    config.save(&config_path)?;

    println!("✅ orgmirror initialized");
    println!("   Config: {:?}", config_path);
    println!("   Database: {}", config.database.path);
    if config.github.organization.is_empty() {
        println!("   Next: set github.organization, then run 'orgmirror sync'");
    } else {
        println!("   Organization: {}", config.github.organization);
        println!("   Next: run 'orgmirror sync'");
    }

    Ok(())
}

async fn build_engine(config: Config) -> Result<SyncEngine> {
    let client = GitHubClient::new(&config).await?;
    let executor = client.executor(&config)?;
    let store = open_store(&config)?;
    Ok(SyncEngine::new(config, executor, Arc::new(store)))
}

/// Run the orchestrator
async fn cmd_sync(
    since: Option<String>,
    until: Option<String>,
    org: Option<String>,
    full: bool,
    mut config: Config,
) -> Result<()> {
    if let Some(org) = org {
        config.github.organization = org;
    }
    if until.is_some() {
        config.sync.until = until;
    }
    config.validate()?;

    let engine = build_engine(config).await?;
    let window = engine.window(full, since.as_deref())?;

    println!("🔄 Mirroring {}", engine.organization());
    let summary = engine.run_sync(&window).await?;

    println!("\n🎉 Sync complete in {:.2}s", summary.duration.as_secs_f64());
    println!("   Repositories processed: {}", summary.repositories_processed);
    for resource in &summary.resources {
        let latest = resource
            .latest
            .map(orgmirror::model::format_timestamp)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "   {:<14} {:>6}  latest {}",
            resource.resource.as_str(),
            resource.count,
            latest
        );
    }
    println!("   New reviews: {}", summary.new_reviews);
    println!(
        "   Open items refreshed: {} issues, {} pull requests",
        summary.open_items.issues, summary.open_items.pull_requests
    );
    println!(
        "   Review requests: +{} -{}",
        summary.review_requests.added, summary.review_requests.removed
    );

    Ok(())
}

/// Repair one node
async fn cmd_resync(node_id: &str, config: Config) -> Result<()> {
    let engine = build_engine(config).await?;
    let outcome = engine.collector().resync_node(node_id).await?;
    println!("✅ {}", outcome);
    Ok(())
}

/// Print watermarks and recent runs
fn cmd_status(config: &Config) -> Result<()> {
    let store = open_store(config)?;

    println!("📊 Watermarks");
    let states = store.list_sync_states()?;
    if states.is_empty() {
        println!("   none yet, run 'orgmirror sync'");
    }
    for state in &states {
        println!(
            "   {}/{:<14} {}",
            state.scope_key,
            state.resource,
            orgmirror::model::format_timestamp(state.watermark)
        );
    }

    println!("\n🕑 Recent runs");
    for run in store.recent_sync_logs(10)? {
        println!(
            "   #{:<5} {:<14} {:<8} {} {}",
            run.id,
            run.resource,
            run.status.as_str(),
            orgmirror::model::format_timestamp(run.started_at),
            run.message.unwrap_or_default()
        );
    }

    Ok(())
}
