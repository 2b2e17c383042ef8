//! CLI implementation for swapscan
//!
//! Wires the configuration, chain client, dispatcher, durable queue and
//! scan controller together for the `scanswap` sub-command.

use crate::cache::SwapRing;
use crate::config::{self, TokenRegistry};
use crate::dispatch::Dispatcher;
use crate::pending::PendingWorker;
use crate::rpc::RpcClient;
use crate::scanner::{ScanSettings, Scanner, SyncState, DEFAULT_SYNC_FLUSH_COUNT};
use crate::store::SwapStore;
use crate::verify::Verifier;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Ten-block buffer against off-by-one at start-up.
const STARTUP_BUFFER_BLOCKS: u64 = 10;

/// Cross chain swap scanner
#[derive(Parser)]
#[command(name = "swapscan")]
#[command(about = "Scan cross chain swaps on EVM compatible chains")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan cross chain swaps
    Scanswap(ScanswapArgs),
}

#[derive(Args)]
struct ScanswapArgs {
    /// Path to the TOML config file
    #[arg(long)]
    config: PathBuf,

    /// Chain gateway JSON-RPC URL
    #[arg(long)]
    gateway: String,

    /// Scan transaction receipt instead of transaction
    #[arg(long = "scanReceipt")]
    scan_receipt: bool,

    /// Init synced block number in the store before scanning
    #[arg(long)]
    initsync: bool,

    /// Start height: positive is absolute, negative is relative to
    /// latest, zero resumes tail-follow from the checkpoint
    #[arg(long, default_value_t = 0)]
    start: i64,

    /// End height (exclusive), zero means open ended
    #[arg(long, default_value_t = 0)]
    end: u64,

    /// Stable height, the block depth assumed immune to reorg
    #[arg(long, default_value_t = 5)]
    stable: u64,

    /// Parallel range scan jobs
    #[arg(long, default_value_t = 4)]
    jobs: u64,

    /// Timeout of scanning one block in seconds
    #[arg(long, default_value_t = 300)]
    timeout: u64,
}

/// Parse the command line and run the selected sub-command.
pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Scanswap(args) => scan_swap(args).await,
    }
}

async fn scan_swap(args: ScanswapArgs) -> Result<()> {
    let config = config::load_config(&args.config)?;
    info!(
        "get argument success, gateway {} scanReceipt {} start {} end {} stable {} jobs {} timeout {}",
        args.gateway, args.scan_receipt, args.start, args.end, args.stable, args.jobs, args.timeout
    );

    let registry = Arc::new(TokenRegistry::new(config.tokens.clone()));
    tokio::spawn(config::watch_and_reload(args.config.clone(), registry.clone()));

    let rpc = Arc::new(RpcClient::new(args.gateway.clone()));
    let chain_id = rpc.chain_id().await.context("get chainID failed")?;
    info!("get chainID success, chainID {}", chain_id);

    let bc = &config.blockchain;
    let chain = bc.chain.clone();
    let stable_height = if bc.stable_height > 0 { bc.stable_height } else { args.stable };
    let sync_flush_count = if bc.sync_number > 0 {
        bc.sync_number
    } else {
        DEFAULT_SYNC_FLUSH_COUNT
    };

    let store = match &config.mongodb {
        Some(mcfg) if mcfg.enable => Some(Arc::new(
            SwapStore::connect(mcfg).await.context("init mongodb failed")?,
        )),
        _ => None,
    };

    if args.initsync {
        if let Some(store) = &store {
            let number = rpc.loop_latest_height().await.saturating_sub(STARTUP_BUFFER_BLOCKS);
            store
                .update_synced_block(&chain, number)
                .await
                .context("init synced block number failed")?;
            info!("init synced block number, number {}", number);
        }
    }

    let synced_number = match &store {
        Some(store) => get_synced_block_number(store, &chain)
            .await?
            .saturating_sub(STARTUP_BUFFER_BLOCKS),
        None => rpc.loop_latest_height().await.saturating_sub(STARTUP_BUFFER_BLOCKS),
    };

    let ring = Arc::new(SwapRing::new());
    let dispatcher = Arc::new(Dispatcher::new(chain.clone(), ring.clone(), store.clone()));
    tokio::spawn(dispatcher.clone().repost_cached_swaps());

    if let Some(store) = &store {
        let worker = PendingWorker::new(
            store.clone(),
            dispatcher.clone(),
            rpc.clone(),
            chain.clone(),
        );
        tokio::spawn(worker.run());
    }

    let verifier = Arc::new(Verifier::new(
        rpc.clone(),
        registry.clone(),
        dispatcher,
        args.scan_receipt,
    ));
    let scanner = Scanner::new(
        rpc,
        verifier,
        registry,
        store,
        ScanSettings {
            chain,
            end_height: args.end,
            stable_height,
            scan_back_height: bc.scan_back_height,
            job_count: args.jobs,
            process_block_timeout: Duration::from_secs(args.timeout),
        },
    );
    let sync = SyncState::new(synced_number, sync_flush_count);
    scanner.run(args.start, sync).await?;

    // a bounded range scan leaves the retry workers running
    futures::future::pending::<()>().await;
    Ok(())
}

/// Read the checkpointed sync height with bounded retry; fatal after
/// exhaustion.
async fn get_synced_block_number(store: &SwapStore, chain: &str) -> Result<u64> {
    let mut last_err = None;
    for _ in 0..5 {
        match store.find_synced_block(chain).await {
            Ok(number) => {
                info!("get synced block number success, number {}", number);
                return Ok(number);
            }
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("get synced block number failed")))
}
