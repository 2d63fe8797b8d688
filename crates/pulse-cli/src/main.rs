use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use pulse_core::{ConnectedAccount, META_PROVIDER};
use pulse_graph::{FixtureGraphConnector, GraphConnector, HttpGraphConnector};
use pulse_storage::{InMemoryStore, MetricsStore, PgStore};
use pulse_sync::{maybe_build_scheduler, SyncConfig, SyncOrchestrator};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "pulse")]
#[command(about = "Meta (Facebook/Instagram) metrics sync")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync one user's connected Meta accounts.
    Sync {
        #[arg(long)]
        user: Uuid,
        /// Restrict the run to one connected account.
        #[arg(long)]
        account: Option<Uuid>,
        /// Serve Graph responses from a JSON fixture instead of the live API.
        #[arg(long)]
        fixture: Option<PathBuf>,
        /// Store this access token for the user before syncing.
        #[arg(long)]
        token: Option<String>,
    },
    /// Sync every user holding a Meta grant.
    SyncAll {
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Store a Meta access token for a user.
    Connect {
        #[arg(long)]
        user: Uuid,
        #[arg(long)]
        token: String,
        /// Token lifetime in seconds.
        #[arg(long)]
        expires_in: Option<i64>,
    },
    Migrate,
    Serve {
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Run the cron scheduler until interrupted.
    Schedule {
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

async fn open_store(config: &SyncConfig) -> Result<Arc<dyn MetricsStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url, 5)
                .await
                .context("connecting to postgres")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory store (data is lost on exit)");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

fn graph_connector(
    config: &SyncConfig,
    fixture: Option<&PathBuf>,
) -> Result<Arc<dyn GraphConnector>> {
    match fixture {
        Some(path) => {
            info!(path = %path.display(), "serving graph responses from fixture");
            Ok(Arc::new(FixtureGraphConnector::load(path)?))
        }
        None => Ok(Arc::new(HttpGraphConnector::new(config.graph_config())?)),
    }
}

async fn build_orchestrator(
    config: &SyncConfig,
    fixture: Option<&PathBuf>,
) -> Result<Arc<SyncOrchestrator>> {
    let store = open_store(config).await?;
    let graph = graph_connector(config, fixture)?;
    Ok(Arc::new(SyncOrchestrator::new(store, graph, config.settings()?)))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env_or_yaml()?;

    match cli.command {
        Commands::Sync {
            user,
            account,
            fixture,
            token,
        } => {
            let orchestrator = build_orchestrator(&config, fixture.as_ref()).await?;
            if let Some(token) = token {
                let grant = ConnectedAccount::new(user, META_PROVIDER, &token, None);
                orchestrator.store().upsert_connected_account(&grant).await?;
            }
            let report = orchestrator.sync(user, account).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::SyncAll { fixture } => {
            let orchestrator = build_orchestrator(&config, fixture.as_ref()).await?;
            let batch = orchestrator.sync_all_users().await?;
            println!("{}", serde_json::to_string_pretty(&batch)?);
        }
        Commands::Connect {
            user,
            token,
            expires_in,
        } => {
            let store = open_store(&config).await?;
            let expires_at = expires_in.map(|secs| Utc::now() + Duration::seconds(secs));
            let grant = ConnectedAccount::new(user, META_PROVIDER, &token, expires_at);
            store.upsert_connected_account(&grant).await?;
            println!("connected account stored: id={} user={}", grant.id, user);
        }
        Commands::Migrate => {
            let Some(url) = &config.database_url else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgStore::connect(url, 1).await.context("connecting to postgres")?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Serve { fixture } => {
            let orchestrator = build_orchestrator(&config, fixture.as_ref()).await?;
            let scheduler = maybe_build_scheduler(orchestrator.clone(), &config).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, "scheduler started");
            }
            let state = pulse_web::AppState::new(orchestrator, config.cron_secret.clone());
            pulse_web::serve(state, config.web_port).await?;
        }
        Commands::Schedule { fixture } => {
            let orchestrator = build_orchestrator(&config, fixture.as_ref()).await?;
            let Some(mut sched) = maybe_build_scheduler(orchestrator, &config).await? else {
                bail!("scheduler disabled; set PULSE_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler started; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
