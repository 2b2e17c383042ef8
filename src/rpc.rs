//! JSON-RPC client for EVM chain nodes
//!
//! Provides a typed interface over the gateway's JSON-RPC endpoint plus
//! the retrying wrappers the scanner relies on. Handles hex string
//! parsing and error handling.

use crate::types::{Block, Receipt};
use alloy_primitives::B256;
use anyhow::{Context, Result};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{info, warn};

/// How many attempts bounded retry loops make before giving up.
const RPC_RETRY_ATTEMPTS: usize = 5;

/// JSON-RPC client for the chain gateway.
pub struct RpcClient {
    client: reqwest::Client,
    url: String,
    retry_interval: Duration,
}

impl RpcClient {
    /// Create a new RPC client for the given gateway URL.
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            retry_interval: Duration::from_secs(1),
        }
    }

    /// Make a JSON-RPC call.
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params
        });

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .context("Failed to send RPC request")?;

        let json: Value = response
            .json()
            .await
            .context("Failed to parse RPC response")?;

        if let Some(error) = json.get("error") {
            anyhow::bail!("RPC error: {}", error);
        }

        json.get("result")
            .cloned()
            .context("RPC response missing 'result' field")
    }

    /// Get the chain id via `eth_chainId`.
    ///
    /// Queried once at startup; a failure here is fatal for the caller.
    pub async fn chain_id(&self) -> Result<u64> {
        let result = self.call("eth_chainId", json!([])).await?;
        parse_hex_u64(&result).context("Failed to parse chain id")
    }

    /// Get the latest block height via `eth_blockNumber`.
    pub async fn latest_height(&self) -> Result<u64> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        parse_hex_u64(&result).context("Failed to parse block number")
    }

    /// Get a block by number with full transaction details.
    pub async fn block_by_number(&self, height: u64) -> Result<Block> {
        let params = json!([format!("0x{:x}", height), true]);
        let result = self.call("eth_getBlockByNumber", params).await?;
        if result.is_null() {
            anyhow::bail!("block {} not found", height);
        }
        serde_json::from_value(result).context("Failed to deserialize block")
    }

    /// Get a transaction receipt by hash.
    pub async fn transaction_receipt(&self, tx_hash: B256) -> Result<Receipt> {
        let hash_str = format!("0x{:x}", tx_hash);
        let result = self.call("eth_getTransactionReceipt", json!([hash_str])).await?;
        if result.is_null() {
            anyhow::bail!("tx not found");
        }
        serde_json::from_value(result).context("Failed to deserialize receipt")
    }

    /// Get the latest block height, retrying forever until it succeeds.
    pub async fn loop_latest_height(&self) -> u64 {
        loop {
            match self.latest_height().await {
                Ok(height) => {
                    info!("get latest block number success, height {}", height);
                    return height;
                }
                Err(e) => warn!("get latest block number failed: {:#}", e),
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    /// Get a block by number with bounded retry.
    ///
    /// Callers skip the block when this fails; the tail-follower will
    /// re-encounter heights inside the stability window.
    pub async fn loop_get_block(&self, height: u64) -> Result<Block> {
        let mut last_err = None;
        for _ in 0..RPC_RETRY_ATTEMPTS {
            match self.block_by_number(height).await {
                Ok(block) => return Ok(block),
                Err(e) => {
                    warn!("get block {} failed: {:#}", height, e);
                    last_err = Some(e);
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("get block {} failed", height)))
    }

    /// Get a transaction receipt with bounded retry.
    ///
    /// A receipt whose status is not 1 is reported as an error so that
    /// callers treat reverted transactions the same as missing ones.
    pub async fn loop_get_receipt(&self, tx_hash: B256) -> Result<Receipt> {
        let mut last_err = None;
        for _ in 0..RPC_RETRY_ATTEMPTS {
            match self.transaction_receipt(tx_hash).await {
                Ok(receipt) => {
                    if !receipt.is_success() {
                        anyhow::bail!("tx with wrong receipt status");
                    }
                    return Ok(receipt);
                }
                Err(e) => last_err = Some(e),
            }
            tokio::time::sleep(self.retry_interval).await;
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("get receipt failed")))
    }
}

/// Parse a quantity result ("0x..") into a u64.
fn parse_hex_u64(value: &Value) -> Result<u64> {
    let s = value.as_str().context("quantity response is not a string")?;
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(s, 16).context("invalid hex quantity")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_u64() {
        assert_eq!(parse_hex_u64(&json!("0x10")).unwrap(), 16);
        assert_eq!(parse_hex_u64(&json!("0x")).unwrap(), 0);
        assert!(parse_hex_u64(&json!(16)).is_err());
    }
}
