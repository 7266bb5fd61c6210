//! Multivault - multi-strategy yield vault engine
//!
//! Usage:
//!   cargo run --release -- simulate --days 365 --step-days 7
//!   cargo run --release -- keeper
//!   cargo run --release -- events --vault resolv --limit 20
//!   cargo run --release -- config --output multivault.toml

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use multivault_backend::config::EngineConfig;
use multivault_backend::vault::{
    spawn_event_recorder, spawn_harvest_keeper, Amount, Caller, Clock, EventBus, ManualClock, Role,
    SystemClock, VaultDb, VaultRegistry,
};

#[derive(Parser, Debug)]
#[command(name = "multivault")]
#[command(about = "Multi-strategy yield vault engine")]
struct Cli {
    /// Engine config (TOML)
    #[arg(short, long, env = "MULTIVAULT_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// SQLite path, overrides the config file
    #[arg(long, env = "MULTIVAULT_DB_PATH")]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every configured vault against a simulated clock
    Simulate {
        /// Simulated horizon in days
        #[arg(long, default_value = "365")]
        days: u32,

        /// Keeper cadence in simulated days
        #[arg(long, default_value = "7")]
        step_days: u32,

        /// Depositors per vault
        #[arg(long, default_value = "5")]
        depositors: usize,

        /// Deposit per depositor, in base units
        #[arg(long, default_value = "100000")]
        deposit: u64,

        /// Persist events to the configured database instead of memory
        #[arg(long)]
        persist: bool,

        /// Write the final vault summaries as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run the periodic harvest/rebalance keeper on the wall clock
    Keeper,

    /// Show persisted vault events
    Events {
        #[arg(long)]
        vault: Option<String>,

        #[arg(long)]
        depositor: Option<String>,

        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Print the effective configuration as TOML
    Config {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let mut cfg = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env(),
    };
    if let Some(db_path) = cli.db_path.clone() {
        cfg.db_path = db_path;
    }

    match cli.command {
        Commands::Simulate {
            days,
            step_days,
            depositors,
            deposit,
            persist,
            output,
        } => {
            run_simulation(&cfg, days, step_days, depositors, deposit, persist, output).await?
        }
        Commands::Keeper => run_keeper(&cfg).await?,
        Commands::Events {
            vault,
            depositor,
            limit,
        } => show_events(&cfg, vault.as_deref(), depositor.as_deref(), limit).await?,
        Commands::Config { output } => {
            let contents = toml::to_string_pretty(&cfg)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, contents)
                        .with_context(|| format!("write config {}", path.display()))?;
                    info!(path = %path.display(), "config written");
                }
                None => println!("{}", contents),
            }
        }
    }

    Ok(())
}

/// Initialize tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "multivault_backend=info,multivault=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn keeper_caller() -> Caller {
    Caller::new("keeper")
        .with_role(Role::Harvester)
        .with_role(Role::Strategist)
}

async fn run_simulation(
    cfg: &EngineConfig,
    days: u32,
    step_days: u32,
    depositors: usize,
    deposit: u64,
    persist: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    let clock = Arc::new(ManualClock::new(Utc::now().timestamp()));
    let events = EventBus::new(cfg.event_channel_capacity);
    let db_path = if persist { cfg.db_path.as_str() } else { ":memory:" };
    let db = VaultDb::new(db_path)?;
    let recorder = spawn_event_recorder(db.clone(), events.subscribe());

    let registry = VaultRegistry::from_config(cfg, clock.clone(), events.clone())?;
    let keeper = keeper_caller();

    for name in registry.names() {
        let Some(vault) = registry.get(&name) else {
            continue;
        };
        for i in 0..depositors {
            let who = format!("depositor-{:02}", i);
            if let Err(e) = vault.deposit(&who, deposit as Amount).await {
                warn!(vault = %name, depositor = %who, error = %e, "simulated deposit rejected");
            }
        }
    }

    let step_days = step_days.max(1);
    let mut elapsed_days: u32 = 0;
    while elapsed_days < days {
        let step = step_days.min(days - elapsed_days);
        clock.advance_days(step as i64);
        elapsed_days += step;

        // Let the hedge drift so the keeper has something to correct
        for name in registry.names() {
            if let Some(hedged) = registry.delta_neutral(&name) {
                let info = hedged.delta_neutral_info().await;
                let drift = info.long_position / 25;
                if let Err(e) = hedged
                    .sync_leg_values(
                        &keeper,
                        info.long_position + drift,
                        info.short_position.saturating_sub(drift),
                    )
                    .await
                {
                    warn!(vault = %name, error = %e, "leg sync failed");
                }
            }
        }

        let report = registry.run_keeper_pass(&keeper).await;
        for (name, amount) in &report.harvested {
            info!(day = elapsed_days, vault = %name, amount = *amount, "harvested");
        }
    }

    registry.snapshot_all(&db, clock.as_ref()).await?;
    let infos = registry.strategy_infos().await;

    println!();
    println!(
        "{:<10} {:<18} {:>14} {:>14} {:>8} {:>12} {:>6}",
        "vault", "strategy", "total_assets", "total_shares", "apy_bps", "yield", "risk"
    );
    for info in &infos {
        println!(
            "{:<10} {:<18} {:>14} {:>14} {:>8} {:>12} {:>6}",
            info.name,
            info.kind.as_str(),
            info.total_assets,
            info.total_shares,
            info.apy_bps,
            info.total_yield_generated,
            info.risk_score
        );
    }

    for name in registry.names() {
        if let Some(vault) = registry.get(&name) {
            if let Err(e) = vault.check_invariants().await {
                warn!(vault = %name, error = %e, "invariant check failed");
            }
        }
    }

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&infos)?;
        std::fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
        info!(path = %path.display(), "simulation summary written");
    }

    drop(registry);
    drop(events);
    recorder.await.context("event recorder task")?;
    Ok(())
}

async fn run_keeper(cfg: &EngineConfig) -> Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let events = EventBus::new(cfg.event_channel_capacity);
    let db = VaultDb::new(&cfg.db_path)?;
    let recorder = spawn_event_recorder(db.clone(), events.subscribe());

    let registry = Arc::new(VaultRegistry::from_config(cfg, clock.clone(), events)?);
    let keeper = spawn_harvest_keeper(
        registry,
        keeper_caller(),
        cfg.keeper.clone(),
        Some(db),
        clock,
    );

    tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
    info!("shutting down keeper");
    keeper.abort();
    recorder.abort();
    Ok(())
}

async fn show_events(
    cfg: &EngineConfig,
    vault: Option<&str>,
    depositor: Option<&str>,
    limit: usize,
) -> Result<()> {
    let db = VaultDb::new(&cfg.db_path)?;
    for ev in db.list_events(limit, vault, depositor).await? {
        println!(
            "{} {:<8} {:<28} {:<24} {}",
            ev.ts,
            ev.vault,
            ev.kind,
            ev.depositor.as_deref().unwrap_or("-"),
            ev.amount.map(|a| a.to_string()).unwrap_or_else(|| "-".to_string())
        );
    }
    Ok(())
}
