use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use encerra_core::{JobRequest, LedgerKind, PeriodRange};
use encerra_storage::StatusStore;
use encerra_sync::{
    AppConfig, ClosingOrchestrator, JobCoordinator, StatusNotifier, WebDriverSessions,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "encerra-cli")]
#[command(about = "Automated ledger closing for the SIGISS portal")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP/WebSocket API with the in-process worker pool.
    Serve,
    /// Close one client's periods in this process and report via the callback url.
    RunJob {
        tax_id: String,
        period_start: String,
        period_end: String,
        #[arg(long, default_value = "services_taken")]
        ledger: LedgerKind,
    },
    Migrate,
    /// Print the periods a job would visit.
    Periods { start: String, end: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            config.validate().context("invalid configuration")?;
            let coordinator = build_coordinator(&config).await?;
            let state = encerra_web::AppState::new(coordinator);
            encerra_web::serve(state, &config.listen_addr, async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutting down");
            })
            .await?;
        }
        Commands::RunJob {
            tax_id,
            period_start,
            period_end,
            ledger,
        } => {
            config.validate().context("invalid configuration")?;
            let request = JobRequest::from_submission(&tax_id, &period_start, &period_end, ledger)?;
            let coordinator = build_coordinator(&config).await?;
            let handle = coordinator.submit(request).await?;
            let summary = handle.wait().await?;
            println!(
                "closing complete: total={} closed={} already_closed={} failed={}",
                summary.total, summary.closed, summary.already_closed, summary.failed
            );
        }
        Commands::Migrate => {
            StatusStore::open(&config.db_path)
                .await
                .with_context(|| format!("migrating {}", config.db_path.display()))?;
            println!("database ready at {}", config.db_path.display());
        }
        Commands::Periods { start, end } => {
            let range = PeriodRange::parse(&start, &end)?;
            for period in range.periods() {
                println!("{period}");
            }
        }
    }

    Ok(())
}

async fn build_coordinator(config: &AppConfig) -> Result<JobCoordinator> {
    let profile = config.load_profile().context("loading portal profile")?;
    let store = StatusStore::open(&config.db_path)
        .await
        .with_context(|| format!("opening {}", config.db_path.display()))?;
    let notifier = StatusNotifier::from_config(config)?;
    let orchestrator = ClosingOrchestrator::from_config(config, &profile, store, notifier);
    let sessions = Arc::new(WebDriverSessions::from_config(config, profile));
    info!(workers = config.workers, webdriver = %config.webdriver_url, "worker pool ready");
    Ok(JobCoordinator::new(orchestrator, sessions, config.workers))
}
