//! Bitfinex Bracket Bot CLI
//!
//! Keeps bracket orders on Bitfinex consistent while positions are open.

use anyhow::{Context, Result};
use bitfinex_bracket_bot::services::bracket::{BracketStage, StateFile, DEFAULT_CAPACITY};
use bitfinex_bracket_bot::{
    BitfinexClient, BracketHandle, BracketManager, BracketRequest, Config, Metrics, OrderGateway,
    OrderId, PaperGateway, PrivateWebSocket, PrivateWsConfig,
};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bitfinex-bracket-bot")]
#[command(about = "OCO bracket manager for Bitfinex")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Follow the private stream and enforce brackets (live only)
    Run,

    /// Show tracked bracket groups
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Forget every tracked group
    Reset {
        /// Leave the state file on disk
        #[arg(long)]
        keep_file: bool,
    },

    /// Place an entry with stop-loss / take-profit and start tracking it
    Open {
        /// Group id; numeric ids are also sent as the Bitfinex gid
        #[arg(short, long)]
        group_id: String,

        /// Trading pair, e.g. tBTCUSD
        #[arg(short, long)]
        symbol: String,

        /// Signed amount: positive buys, negative sells
        #[arg(short, long, allow_negative_numbers = true)]
        amount: Decimal,

        /// Entry limit price (market entry if omitted)
        #[arg(short, long)]
        price: Option<Decimal>,

        /// Stop-loss trigger price
        #[arg(long)]
        stop_loss: Option<Decimal>,

        /// Take-profit limit price
        #[arg(long)]
        take_profit: Option<Decimal>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Override with RUST_LOG, e.g. RUST_LOG=bitfinex_bracket_bot=debug
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let config = Config::from_env()?;

    match cli.command {
        Commands::Run => run_bot(&config).await?,
        Commands::Status { json } => show_status(&config, json)?,
        Commands::Reset { keep_file } => reset_groups(&config, keep_file)?,
        Commands::Open {
            group_id,
            symbol,
            amount,
            price,
            stop_loss,
            take_profit,
        } => {
            let request = BracketRequest {
                group_id,
                symbol,
                amount,
                entry_price: price,
                stop_loss_price: stop_loss,
                take_profit_price: take_profit,
            };
            open_bracket(&config, request).await?
        }
    }

    Ok(())
}

/// Live REST client, or the in-memory paper gateway
fn build_gateway(config: &Config) -> Result<Arc<dyn OrderGateway>> {
    match (config.is_live(), &config.api_key, &config.api_secret) {
        (true, Some(key), Some(secret)) => {
            let client = BitfinexClient::new(
                &config.rest_url,
                key,
                secret,
                config.exchange_wallet,
                Duration::from_secs(config.http_timeout_seconds),
            )
            .context("Failed to build Bitfinex client")?;
            Ok(Arc::new(client))
        }
        _ => Ok(Arc::new(PaperGateway::new())),
    }
}

fn print_banner(config: &Config) {
    println!("\n{}", "=".repeat(70));
    println!("  BITFINEX BRACKET BOT");
    println!(
        "  Paper Trading: {} | Partial Adjust: {}",
        if config.is_live() { "NO - LIVE MODE" } else { "YES" },
        if config.bracket.partial_adjust { "ON" } else { "OFF" }
    );
    println!("  State File: {}", config.active_bracket_config().state_file.display());
    println!("{}\n", "=".repeat(70));
}

async fn run_bot(config: &Config) -> Result<()> {
    print_banner(config);

    let (Some(api_key), Some(api_secret)) = (config.api_key.clone(), config.api_secret.clone())
    else {
        anyhow::bail!("run needs BFX_API_KEY and BFX_API_SECRET with PAPER_TRADING=false");
    };
    if !config.is_live() {
        anyhow::bail!("run follows the live account stream; set PAPER_TRADING=false");
    }

    let bracket = config.active_bracket_config();
    let _lock = StateFile::new(&bracket.state_file).lock()?;

    let metrics = Metrics::new();
    let manager = BracketManager::new(build_gateway(config)?, &bracket, metrics.clone());
    let (handle, mut manager_task) = BracketHandle::spawn(manager, DEFAULT_CAPACITY);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ws_config = PrivateWsConfig {
        url: config.ws_url.clone(),
        api_key,
        api_secret,
        dead_man_switch: config.dead_man_switch,
    };
    let ws_task = tokio::spawn(PrivateWebSocket::run(ws_config, handle.clone(), metrics.clone(), shutdown_rx));

    info!("[Bot] Running. Press Ctrl+C to stop.");
    let manager_exit = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl+C")?;
            info!("[Bot] Shutting down...");
            None
        }
        exit = &mut manager_task => {
            error!("[Bot] Bracket manager stopped unexpectedly, brackets are no longer enforced");
            Some(exit)
        }
    };

    let _ = shutdown_tx.send(true);
    if let Err(e) = ws_task.await {
        error!("[Bot] Private stream task failed: {}", e);
    }

    drop(handle);
    let stopped_early = manager_exit.is_some();
    let manager_exit = match manager_exit {
        Some(exit) => exit,
        None => manager_task.await,
    };

    info!("[Bot] Metrics: {}", serde_json::to_string(&metrics.snapshot())?);

    manager_exit.context("Bracket manager task failed")?;
    if stopped_early {
        anyhow::bail!("bracket manager stopped before shutdown");
    }
    Ok(())
}

fn show_status(config: &Config, json: bool) -> Result<()> {
    let bracket = config.active_bracket_config();
    let groups: BTreeMap<_, _> = StateFile::new(&bracket.state_file).load().into_iter().collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&groups)?);
        return Ok(());
    }

    print_banner(config);
    if groups.is_empty() {
        println!("No active bracket groups.");
        return Ok(());
    }

    println!("Active Groups ({}):", groups.len());
    for (gid, group) in &groups {
        let stage = group.stage();
        println!(
            "  {:<12} {:<14} entry={:<12} sl={:<12} tp={:<12} filled={}",
            gid,
            stage.to_string(),
            fmt_leg(group.entry_id),
            fmt_leg(group.sl_id),
            fmt_leg(group.tp_id),
            group.entry_filled
        );
        if stage == BracketStage::Protected && group.sl_id.is_none() && group.tp_id.is_none() {
            warn!("[Bot] Group {} holds a position with no exits", gid);
        }
    }

    Ok(())
}

fn fmt_leg(id: Option<OrderId>) -> String {
    id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string())
}

fn reset_groups(config: &Config, keep_file: bool) -> Result<()> {
    let bracket = config.active_bracket_config();
    let _lock = StateFile::new(&bracket.state_file)
        .lock()
        .context("reset refuses to touch state owned by another process")?;

    let gateway = build_gateway(config)?;
    let mut manager = BracketManager::new(gateway, &bracket, Metrics::new());
    let cleared = manager.reset(!keep_file);
    println!("Cleared {} bracket groups.", cleared);
    Ok(())
}

async fn open_bracket(config: &Config, request: BracketRequest) -> Result<()> {
    print_banner(config);

    // `run` owns the state file while it is up
    let bracket = config.active_bracket_config();
    let _lock = StateFile::new(&bracket.state_file)
        .lock()
        .context("open refuses to place orders while another process owns the state")?;

    let mut manager = BracketManager::new(build_gateway(config)?, &bracket, Metrics::new());
    let group = manager
        .open_bracket(&request)
        .await
        .with_context(|| format!("Failed to open bracket {}", request.group_id))?;

    println!("Opened group {}:", request.group_id);
    println!("  Entry:       {}", fmt_leg(group.entry_id));
    println!("  Stop-Loss:   {}", fmt_leg(group.sl_id));
    println!("  Take-Profit: {}", fmt_leg(group.tp_id));
    Ok(())
}
