//! Scan controller
//!
//! Orchestrates the parallel range-scan workers and the tail-follower,
//! and owns the sync-height checkpoint. Range mode splits a fixed
//! interval across jobs; tail mode follows the chain head inside the
//! stability window and checkpoints progress to the store.

use crate::cache::ScannedBlockRing;
use crate::config::TokenRegistry;
use crate::rpc::RpcClient;
use crate::store::SwapStore;
use crate::verify::Verifier;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Checkpoint flush interval in blocks when the config leaves it unset.
pub const DEFAULT_SYNC_FLUSH_COUNT: u64 = 100;

/// Chain parameters and scan bounds fixed at startup.
pub struct ScanSettings {
    pub chain: String,
    pub end_height: u64,
    pub stable_height: u64,
    pub scan_back_height: u64,
    pub job_count: u64,
    pub process_block_timeout: Duration,
}

/// Sync-height checkpoint state, owned by the tail-follower.
///
/// The counter advances only on contiguous heights and flushes to the
/// store every `flush_every` increments, so a crash loses at most one
/// flush interval.
pub struct SyncState {
    number: u64,
    count: u64,
    flush_every: u64,
    flushed: bool,
}

impl SyncState {
    pub fn new(number: u64, flush_every: u64) -> Self {
        Self {
            number,
            count: 0,
            flush_every: flush_every.max(1),
            flushed: false,
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// Advance on a contiguous height; true when a flush is due.
    fn advance(&mut self, height: u64) -> bool {
        if height == self.number + 1 {
            self.count += 1;
            self.number = height;
        }
        self.count >= self.flush_every
    }
}

/// Orchestrates range workers and the tail-follower.
#[derive(Clone)]
pub struct Scanner {
    rpc: Arc<RpcClient>,
    verifier: Arc<Verifier>,
    registry: Arc<TokenRegistry>,
    store: Option<Arc<SwapStore>>,
    chain: String,
    end_height: u64,
    stable_height: u64,
    scan_back_height: u64,
    job_count: u64,
    process_block_timeout: Duration,
}

impl Scanner {
    pub fn new(
        rpc: Arc<RpcClient>,
        verifier: Arc<Verifier>,
        registry: Arc<TokenRegistry>,
        store: Option<Arc<SwapStore>>,
        settings: ScanSettings,
    ) -> Self {
        Self {
            rpc,
            verifier,
            registry,
            store,
            chain: settings.chain,
            end_height: settings.end_height,
            stable_height: settings.stable_height,
            scan_back_height: settings.scan_back_height,
            job_count: settings.job_count,
            process_block_timeout: settings.process_block_timeout,
        }
    }

    /// Run the configured scan: an optional range job followed by the
    /// tail-follower when the end height is open.
    ///
    /// Returns only for bounded range scans; tail mode runs forever.
    pub async fn run(&self, start_arg: i64, mut sync: SyncState) -> Result<()> {
        let mut tail_from = sync.number();
        let wend = if self.end_height != 0 {
            self.end_height
        } else {
            self.rpc.loop_latest_height().await
        };

        if start_arg != 0 || self.end_height != 0 {
            let start = resolve_range_start(start_arg, wend, sync.number());
            self.scan_range_job(start, wend).await?;
            if self.end_height == 0 {
                self.rewrite_synced(&mut sync, wend).await;
                tail_from = wend;
            }
        }

        if self.end_height == 0 {
            self.scan_tail(tail_from, sync).await;
        }
        Ok(())
    }

    /// Split `[start, end)` across the configured jobs and join all
    /// workers.
    pub async fn scan_range_job(&self, start: u64, end: u64) -> Result<()> {
        info!(
            "start scan range job, start {} end {} jobs {}",
            start, end, self.job_count
        );
        if self.job_count == 0 {
            anyhow::bail!("zero count jobs specified");
        }
        if start >= end {
            anyhow::bail!("wrong scan range [{}, {})", start, end);
        }
        let mut handles = Vec::new();
        for (i, (from, to)) in split_ranges(start, end, self.job_count).into_iter().enumerate() {
            let scanner = self.clone();
            let job = i as u64 + 1;
            handles.push(tokio::spawn(async move {
                scanner.scan_range(job, from, to).await;
            }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("scan range worker failed: {}", e);
            }
        }
        Ok(())
    }

    async fn scan_range(&self, job: u64, from: u64, to: u64) {
        info!("[{}] scan range, from {} to {}", job, from, to);
        for height in from..to {
            self.scan_block(job, height, None).await;
        }
        info!("[{}] scan range finish, from {} to {}", job, from, to);
    }

    /// Follow the chain head, checkpointing each processed height.
    ///
    /// The window compresses to the stability horizon each pass; a set
    /// reload latch rewinds it by the scan-back depth once so recent
    /// blocks are re-inspected under the new token rules.
    async fn scan_tail(&self, mut from: u64, mut sync: SyncState) {
        let stable = self.stable_height;
        let scan_back = self.scan_back_height;
        info!("start scan loop job, from {} stable {}", from, stable);
        let mut ring = ScannedBlockRing::new();
        loop {
            let latest = self.rpc.loop_latest_height().await;
            for height in from..=latest {
                self.scan_block(0, height, Some(&mut ring)).await;
                if self.store.is_some() {
                    self.update_synced(&mut sync, height).await;
                }
            }
            if from + stable < latest {
                from = latest - stable;
            }
            if sync.flushed && self.registry.reload_pending() {
                sync.flushed = false;
                from = from.saturating_sub(scan_back);
                info!("scan loop scan back, justnow {} now {}", latest, from);
                self.registry.clear_reload();
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Fetch one block and offer every transaction to the verifier,
    /// bounded by the per-block deadline. Each worker owns its own
    /// deadline. A block that fails to fetch or times out is skipped,
    /// not re-queued.
    async fn scan_block(&self, job: u64, height: u64, ring: Option<&mut ScannedBlockRing>) {
        let block = match self.rpc.loop_get_block(height).await {
            Ok(block) => block,
            Err(_) => return,
        };
        if let Some(ring) = &ring {
            if ring.is_scanned(block.hash) {
                return;
            }
        }
        info!(
            "[{}] scan block {}, hash {:#x} txs {}",
            job,
            height,
            block.hash,
            block.transactions.len()
        );

        let deadline = Instant::now() + self.process_block_timeout;
        for (i, tx) in block.transactions.iter().enumerate() {
            if Instant::now() >= deadline {
                warn!(
                    "[{}] scan block {} timeout, hash {:#x} txs {}",
                    job,
                    height,
                    block.hash,
                    block.transactions.len()
                );
                break;
            }
            debug!("[{}] scan tx in block {} index {}, tx {:#x}", job, height, i, tx.hash);
            self.verifier.scan_transaction(tx).await;
        }
        if let Some(ring) = ring {
            ring.add_block(block.hash);
        }
    }

    /// Advance the checkpoint counter, flushing to the store when due.
    async fn update_synced(&self, sync: &mut SyncState, height: u64) {
        if !sync.advance(height) {
            return;
        }
        sync.flushed = true;
        if let Some(store) = &self.store {
            match store.update_synced_block(&self.chain, sync.number()).await {
                Ok(()) => {
                    info!("update synced block number, height {}", sync.number());
                    sync.count = 0;
                }
                Err(e) => warn!("update synced block number failed: {:#}", e),
            }
        }
    }

    /// Rewrite the checkpoint after an open-ended range scan so the
    /// tail-follower starts contiguously.
    async fn rewrite_synced(&self, sync: &mut SyncState, number: u64) {
        sync.number = number;
        sync.count = 0;
        if let Some(store) = &self.store {
            match store.update_synced_block(&self.chain, number).await {
                Ok(()) => info!("rewrite synced block number, height {}", number),
                Err(e) => warn!("rewrite synced block number failed: {:#}", e),
            }
        }
    }
}

/// Resolve the start height for a range scan. A positive start is
/// absolute; zero or negative counts back from the range end and
/// clamps to the checkpoint so the range stays contiguous with it.
pub fn resolve_range_start(start_arg: i64, wend: u64, checkpoint: u64) -> u64 {
    let start = if start_arg > 0 {
        start_arg as u64
    } else {
        wend.saturating_sub(start_arg.unsigned_abs())
    };
    if start_arg <= 0 && start > checkpoint {
        return checkpoint;
    }
    start
}

/// Split `[start, end)` into equal jobs; the last absorbs the
/// remainder. Fewer blocks than jobs collapses to a single job.
pub fn split_ranges(start: u64, end: u64, jobs: u64) -> Vec<(u64, u64)> {
    let count = end - start;
    let mut jobs = jobs;
    let mut step = count / jobs;
    if step == 0 {
        jobs = 1;
        step = count;
    }
    (0..jobs)
        .map(|i| {
            let from = start + i * step;
            let to = if i + 1 == jobs { end } else { start + (i + 1) * step };
            (from, to)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_range_start_bounded_end_with_default_start() {
        // --end alone falls back to the checkpoint, not [end, end)
        assert_eq!(resolve_range_start(0, 5_000_000, 4_900_000), 4_900_000);
    }

    #[test]
    fn test_resolve_range_start_positive_is_absolute() {
        assert_eq!(resolve_range_start(7_000, 10_000, 500), 7_000);
    }

    #[test]
    fn test_resolve_range_start_negative_counts_back_from_end() {
        assert_eq!(resolve_range_start(-100, 10_000, 9_990), 9_900);
        // never opens a gap past the checkpoint
        assert_eq!(resolve_range_start(-100, 10_000, 4_000), 4_000);
    }

    #[test]
    fn test_split_ranges_even() {
        assert_eq!(split_ranges(0, 90, 3), vec![(0, 30), (30, 60), (60, 90)]);
    }

    #[test]
    fn test_split_ranges_last_absorbs_remainder() {
        assert_eq!(split_ranges(0, 100, 3), vec![(0, 33), (33, 66), (66, 100)]);
        assert_eq!(split_ranges(10, 21, 2), vec![(10, 15), (15, 21)]);
    }

    #[test]
    fn test_split_ranges_fewer_blocks_than_jobs() {
        assert_eq!(split_ranges(5, 8, 10), vec![(5, 8)]);
    }

    #[test]
    fn test_sync_state_flushes_once_per_interval() {
        let mut sync = SyncState::new(1000, 100);
        let mut flushes = Vec::new();
        for height in 1001..=1100 {
            if sync.advance(height) {
                flushes.push(sync.number());
                sync.count = 0;
            }
        }
        assert_eq!(flushes, vec![1100]);
        assert_eq!(sync.number(), 1100);
    }

    #[test]
    fn test_sync_state_ignores_gaps() {
        let mut sync = SyncState::new(1000, 2);
        assert!(!sync.advance(1001));
        // a non-contiguous height neither advances nor counts
        assert!(!sync.advance(1005));
        assert_eq!(sync.number(), 1001);
        assert!(sync.advance(1002));
        assert_eq!(sync.number(), 1002);
    }

    #[test]
    fn test_sync_state_monotonic() {
        let mut sync = SyncState::new(50, 1);
        sync.advance(51);
        // re-scanning an old height never lowers the checkpoint
        sync.advance(40);
        assert_eq!(sync.number(), 51);
    }
}
