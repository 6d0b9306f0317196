use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use gpuherd_common::config::{load_accounts, GlobalConfig};
use gpuherd_common::{FleetError, RetryPolicy};
use gpuherd_engine::store::Store;
use gpuherd_engine::{availability, budget, collector, notify, sweep, AccountContext};
use gpuherd_providers::lambda::LambdaProvider;

#[derive(Parser)]
#[command(
    name = "gpuherd",
    about = "GPU fleet state tracking and policy engine",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the fleet: upsert instances, record utilization samples, sync SSH config
    Monitor,
    /// Evaluate the idle policy and terminate eligible instances
    Sweep {
        /// Log what would be terminated without calling the provider
        #[arg(long)]
        dry_run: bool,
    },
    /// Aggregate spend, send milestone notifications, enforce budget limits
    EnforceBudgets {
        /// Log what would be terminated without calling the provider
        #[arg(long)]
        dry_run: bool,
    },
    /// Snapshot instance type availability by region
    RecordAvailability,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = GlobalConfig::from_env()?;
    let retry = RetryPolicy::default();

    let resolved = load_accounts(&cfg.accounts_path, &cfg)?;
    for (name, reason) in &resolved.skipped {
        error!(account = %name, %reason, "account skipped due to bad config");
    }
    if resolved.accounts.is_empty() {
        anyhow::bail!(
            "no usable accounts: populate {} or set API_KEY",
            cfg.accounts_path.display()
        );
    }

    let mut contexts = Vec::with_capacity(resolved.accounts.len());
    for account in resolved.accounts {
        let provider = LambdaProvider::new(
            account.api_key.clone(),
            cfg.ssh_user.clone(),
            cfg.ssh_identity.clone(),
            &retry,
        )
        .with_context(|| format!("building provider client for account '{}'", account.name))?;
        contexts.push(AccountContext {
            config: account,
            provider: Arc::new(provider),
        });
    }

    let store = Store::open(&cfg.db_path).await?;
    let now = Utc::now().timestamp();
    let holder = Uuid::new_v4().to_string();

    match store.acquire_lock(&holder, now, cfg.lock_stale_secs).await {
        Ok(()) => {}
        Err(FleetError::LockContention) => {
            // Clean skip, not a failure: the next scheduled invocation
            // catches up.
            info!("store lock held by another invocation, skipping this cycle");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    }

    let result = run_command(&cli.command, &store, &contexts, &cfg, &retry, now).await;
    if let Err(e) = store.release_lock(&holder).await {
        error!("failed to release store lock (a later invocation will take over): {}", e);
    }
    result
}

async fn run_command(
    command: &Command,
    store: &Store,
    contexts: &[AccountContext],
    cfg: &GlobalConfig,
    retry: &RetryPolicy,
    now: i64,
) -> anyhow::Result<()> {
    match command {
        Command::Monitor => {
            let summary = collector::run_monitor_pass(store, contexts, cfg, retry, now).await?;
            info!(
                accounts_ok = summary.accounts_ok,
                accounts_failed = summary.accounts_failed,
                instances = summary.instances_seen,
                samples = summary.samples_written,
                ended = summary.instances_ended,
                "monitor pass complete"
            );
        }
        Command::Sweep { dry_run } => {
            let settings = cfg.policy();
            let summary =
                sweep::run_sweep_pass(store, contexts, &settings, retry, now, *dry_run).await?;
            info!(
                evaluated = summary.evaluated,
                requested = summary.terminations_requested,
                rejected = summary.terminations_rejected,
                dry_run,
                "sweep pass complete"
            );
        }
        Command::EnforceBudgets { dry_run } => {
            let sink = notify::DiscordSink::new()?;
            let summary =
                budget::run_budget_pass(store, contexts, &sink, retry, now, *dry_run).await?;
            info!(
                accounts = summary.accounts_evaluated,
                milestones = summary.milestones_notified,
                breaches = summary.breaches,
                requested = summary.terminations_requested,
                dry_run,
                "budget pass complete"
            );
        }
        Command::RecordAvailability => {
            let rows = availability::run_availability_pass(store, contexts, cfg, retry, now).await?;
            info!(rows, "availability pass complete");
        }
    }
    Ok(())
}
