//! Pending-queue worker
//!
//! Drains the durable pending queue: re-posts each entry through the
//! dispatcher's single-shot path and garbage-collects entries whose
//! underlying transaction is gone from the canonical chain (receipt
//! missing or reverted, likely reorged out).

use crate::dispatch::Dispatcher;
use crate::rpc::RpcClient;
use crate::store::{SwapDoc, SwapStore};
use alloy_primitives::B256;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const PAGE_SIZE: i64 = 10;
/// Sleep between completed passes over the pending snapshot.
const PASS_INTERVAL: Duration = Duration::from_secs(10);
/// Sleep when the queue is empty or the store is unreachable.
const IDLE_INTERVAL: Duration = Duration::from_secs(20);
/// Sleep between entries to bound fan-out against the swap server.
const ENTRY_INTERVAL: Duration = Duration::from_secs(1);

/// Long-lived worker over the `SwapPending` collection.
pub struct PendingWorker {
    store: Arc<SwapStore>,
    dispatcher: Arc<Dispatcher>,
    rpc: Arc<RpcClient>,
    chain: String,
}

impl PendingWorker {
    pub fn new(
        store: Arc<SwapStore>,
        dispatcher: Arc<Dispatcher>,
        rpc: Arc<RpcClient>,
        chain: String,
    ) -> Self {
        Self {
            store,
            dispatcher,
            rpc,
            chain,
        }
    }

    pub async fn run(self) {
        info!("start swap pending loop job");
        loop {
            let idle = self.run_pass().await;
            let interval = if idle { IDLE_INTERVAL } else { PASS_INTERVAL };
            tokio::time::sleep(interval).await;
        }
    }

    /// Scan the current pending snapshot to completion, one page at a
    /// time. The offset is a cursor within this single pass and resets
    /// at pass boundaries. Returns true when there was nothing to do.
    async fn run_pass(&self) -> bool {
        let mut offset = 0u64;
        loop {
            let page = match self.store.find_swap_pending(&self.chain, offset, PAGE_SIZE).await {
                Ok(page) => page,
                Err(e) => {
                    warn!("find pending swaps failed: {:#}", e);
                    return true;
                }
            };
            if page.is_empty() {
                return offset == 0;
            }
            info!("pending pass page, offset {} len {}", offset, page.len());
            let page_len = page.len();
            for doc in &page {
                self.process_entry(doc).await;
                tokio::time::sleep(ENTRY_INTERVAL).await;
            }
            if (page_len as i64) < PAGE_SIZE {
                return false;
            }
            offset += PAGE_SIZE as u64;
        }
    }

    /// Re-post one pending entry; tombstone it when its transaction no
    /// longer exists with a successful receipt.
    async fn process_entry(&self, doc: &SwapDoc) {
        let swap = doc.to_post();
        if self.dispatcher.repost_swap(&swap).await {
            if let Err(e) = self.store.remove_swap_pending(&doc.txid).await {
                warn!("remove pending swap {} failed: {:#}", doc.txid, e);
            }
            return;
        }

        let doomed = match parse_txid(&doc.txid) {
            Some(hash) => self.rpc.loop_get_receipt(hash).await.is_err(),
            None => true,
        };
        if doomed {
            warn!("pending swap removed, txid {}", doc.txid);
            if let Err(e) = self.store.remove_swap_pending(&doc.txid).await {
                warn!("remove pending swap {} failed: {:#}", doc.txid, e);
            }
            if let Err(e) = self.store.add_swap_deleted(doc).await {
                warn!("tombstone pending swap {} failed: {:#}", doc.txid, e);
            }
        }
    }
}

/// Parse a stored txid back into a 32-byte hash.
fn parse_txid(txid: &str) -> Option<B256> {
    let s = txid.strip_prefix("0x").unwrap_or(txid);
    let bytes = hex::decode(s).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    Some(B256::from_slice(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_txid() {
        let txid = "0x8e38b4dbf6b11fcc3b9dee84fb7986e29ca0a02cecd8977c161ff7333329681e";
        assert!(parse_txid(txid).is_some());
        assert!(parse_txid(txid.strip_prefix("0x").unwrap()).is_some());
        assert!(parse_txid("0x1234").is_none());
        assert!(parse_txid("not hex").is_none());
    }
}
