//! Registration dispatcher
//!
//! Posts discovered swaps to the configured swap server over JSON-RPC,
//! classifies server responses through one keyword table, and feeds the
//! retry ring and the durable pending queue. The server's wire protocol
//! reports outcomes as human-readable phrases, so classification is by
//! substring match.

use crate::cache::SwapRing;
use crate::config::TokenRule;
use crate::store::SwapStore;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const POST_SWAP_SUCCESS_RESULT: &str = "success";
const BRIDGE_SWAP_EXIST_KEYWORDS: &str = "mgoError: Item is duplicate";
const ROUTER_SWAP_EXIST_RESULT: &str = "already registered";
// a known server-side misspelling, kept verbatim
const ROUTER_SWAP_EXIST_RESULT_TMP: &str = "alreday registered";
const HTTP_TIMEOUT_KEYWORDS: &str = "Client.Timeout exceeded while awaiting headers";
const ERR_CONNECTION_REFUSED: &str = "connect: connection refused";
const ERR_MAXIMUM_REQUEST_LIMIT: &str = "You have reached maximum request limit";
const RPC_QUERY_ERR_KEYWORDS: &str = "rpc query error";
const ERR_DEPOSIT_LOG_NOT_FOUND: &str =
    "return error: json-rpc error -32099, verify swap failed! deposit log not found or removed";
const SWAP_IS_CLOSED_RESULT: &str = "swap is closed";
const SWAP_TRADE_NOT_SUPPORT: &str = "swap trade not support";
const TX_WITH_WRONG_CONTRACT: &str = "tx with wrong contract";

/// Server phrases that make a failed post worth retrying.
const TRANSIENT_KEYWORDS: [&str; 5] = [
    HTTP_TIMEOUT_KEYWORDS,
    ERR_CONNECTION_REFUSED,
    ERR_MAXIMUM_REQUEST_LIMIT,
    RPC_QUERY_ERR_KEYWORDS,
    ERR_DEPOSIT_LOG_NOT_FOUND,
];

/// Fixed timeout for swap-server posts.
const SWAP_POST_TIMEOUT: Duration = Duration::from_secs(300);
const SWAP_POST_REQUEST_ID: u64 = 666;

/// A discovered registration intent.
///
/// Bridge-shaped records carry a pair id; router-shaped records carry a
/// chain id and log index. Empty strings mark absent fields so records
/// round-trip through the document store unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapPost {
    pub txid: String,
    pub rpc_method: String,
    pub swap_server: String,
    pub chain: String,

    // bridge
    pub pair_id: String,

    // router
    pub chain_id: String,
    pub log_index: String,
}

/// A failed post, classified as retryable or not.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct PostError {
    message: String,
    transient: bool,
}

impl PostError {
    /// Classify a server phrase through the transient-keyword table.
    fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let transient = TRANSIENT_KEYWORDS.iter().any(|k| message.contains(k));
        Self { message, transient }
    }

    fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        let transient = err.is_timeout() || err.is_connect();
        let message = err.to_string();
        if transient {
            Self { message, transient }
        } else {
            Self::classify(message)
        }
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

/// Posts swap records and routes failures to the retry caches.
pub struct Dispatcher {
    client: reqwest::Client,
    chain: String,
    ring: Arc<SwapRing>,
    store: Option<Arc<SwapStore>>,
    retry_count: usize,
    retry_interval: Duration,
}

impl Dispatcher {
    pub fn new(chain: String, ring: Arc<SwapRing>, store: Option<Arc<SwapStore>>) -> Self {
        Self {
            client: reqwest::Client::new(),
            chain,
            ring,
            store,
            retry_count: 3,
            retry_interval: Duration::from_secs(1),
        }
    }

    /// Register a bridge swap (swapin or swapout, decided by the rule).
    pub async fn post_bridge_swap(&self, txid: &str, rule: &TokenRule) {
        let (subject, rpc_method) = if !rule.deposit_address.is_empty() {
            ("post bridge swapin register", "swap.Swapin")
        } else {
            ("post bridge swapout register", "swap.Swapout")
        };
        info!("{}, txid {} pairID {}", subject, txid, rule.pair_id);
        let swap = SwapPost {
            txid: txid.to_string(),
            rpc_method: rpc_method.to_string(),
            swap_server: rule.swap_server.clone(),
            chain: self.chain.clone(),
            pair_id: rule.pair_id.clone(),
            chain_id: String::new(),
            log_index: String::new(),
        };
        self.post_swap(swap).await;
    }

    /// Register a router swap for one receipt log.
    pub async fn post_router_swap(&self, txid: &str, log_index: usize, rule: &TokenRule) {
        info!(
            "post router swap register, swaptype {} chainid {} txid {} logindex {}",
            rule.tx_type, rule.chain_id, txid, log_index
        );
        let swap = SwapPost {
            txid: txid.to_string(),
            rpc_method: "swap.RegisterRouterSwap".to_string(),
            swap_server: rule.swap_server.clone(),
            chain: self.chain.clone(),
            pair_id: String::new(),
            chain_id: rule.chain_id.clone(),
            log_index: log_index.to_string(),
        };
        self.post_swap(swap).await;
    }

    /// Post with retries, then settle the record: success or permanent
    /// failure lands in the registered collection, a transient failure
    /// goes to the retry ring and the durable pending queue.
    async fn post_swap(&self, swap: SwapPost) {
        let mut success = false;
        let mut transient = false;
        for _ in 0..self.retry_count {
            match self.rpc_post(&swap).await {
                Ok(()) => {
                    success = true;
                    break;
                }
                Err(e) => {
                    if e.is_transient() {
                        transient = true;
                    }
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }

        if success {
            self.record_registered(&swap).await;
            return;
        }
        if transient {
            warn!("cache swap {:?}", swap);
            self.ring.add(swap.clone());
            if let Some(store) = &self.store {
                if let Err(e) = store.add_swap_pending(&swap).await {
                    warn!("add pending swap failed for {}: {:#}", swap.txid, e);
                }
            }
        } else {
            self.record_registered(&swap).await;
        }
    }

    async fn record_registered(&self, swap: &SwapPost) {
        if let Some(store) = &self.store {
            if let Err(e) = store.add_swap(swap).await {
                warn!("add registered swap failed for {}: {:#}", swap.txid, e);
            }
        }
    }

    /// Single-shot repost path used by the ring poller and the pending
    /// worker: retries transient failures only, reports overall success.
    pub async fn repost_swap(&self, swap: &SwapPost) -> bool {
        for _ in 0..self.retry_count {
            match self.rpc_post(swap).await {
                Ok(()) => return true,
                Err(e) if e.is_transient() => {}
                Err(_) => return false,
            }
            tokio::time::sleep(self.retry_interval).await;
        }
        false
    }

    /// Drain the retry ring every ten seconds.
    pub async fn repost_cached_swaps(self: Arc<Self>) {
        loop {
            for (index, swap) in self.ring.entries() {
                if self.repost_swap(&swap).await {
                    self.ring.evict(index, &swap);
                }
            }
            tokio::time::sleep(Duration::from_secs(10)).await;
        }
    }

    /// One JSON-RPC post, with the server's answer classified.
    async fn rpc_post(&self, swap: &SwapPost) -> Result<(), PostError> {
        let (is_router, args) = build_post_args(swap)?;
        let request = json!({
            "jsonrpc": "2.0",
            "id": SWAP_POST_REQUEST_ID,
            "method": swap.rpc_method,
            "params": [args],
        });

        let response = self
            .client
            .post(&swap.swap_server)
            .timeout(SWAP_POST_TIMEOUT)
            .json(&request)
            .send()
            .await
            .map_err(PostError::from_reqwest)?;
        let body: Value = response.json().await.map_err(PostError::from_reqwest)?;

        if let Some(error) = body.get("error").filter(|e| !e.is_null()) {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| error.to_string());
            if message_is_swap_exist(&message) || message_is_terminal_ok(&message) {
                info!("post swap already settled, txid {}: {}", swap.txid, message);
                return Ok(());
            }
            if !is_router && message.contains(BRIDGE_SWAP_EXIST_KEYWORDS) {
                info!("post bridge swap already exist, txid {}", swap.txid);
                return Ok(());
            }
            warn!(
                "post swap failed, txid {} server {}: {}",
                swap.txid, swap.swap_server, message
            );
            return Err(PostError::classify(message));
        }

        if !is_router {
            info!("post bridge swap success, txid {}", swap.txid);
            return Ok(());
        }

        // Router result is a map from log-index string to status phrase.
        let result = body.get("result").cloned().unwrap_or(Value::Null);
        let status = result
            .get(&swap.log_index)
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if status.is_empty() {
            if let Some(map) = result.as_object() {
                for value in map.values() {
                    if value.as_str().map(message_is_swap_exist) == Some(true) {
                        info!("post router swap already exist, txid {}", swap.txid);
                        return Ok(());
                    }
                }
            }
            return Err(PostError::permanent("post router swap unmarshal result failed"));
        }
        check_router_status(status, &swap.txid)
    }
}

/// Build the JSON-RPC arguments from the record's shape.
///
/// Returns whether the record is router-shaped; records with neither a
/// pair id nor a log index are rejected.
fn build_post_args(swap: &SwapPost) -> Result<(bool, Value), PostError> {
    if !swap.pair_id.is_empty() {
        Ok((
            false,
            json!({"txid": swap.txid, "pairid": swap.pair_id}),
        ))
    } else if !swap.log_index.is_empty() {
        Ok((
            true,
            json!({"chainid": swap.chain_id, "txid": swap.txid, "logindex": swap.log_index}),
        ))
    } else {
        Err(PostError::permanent(format!(
            "wrong swap post item {:?}, no pairid and logindex",
            swap
        )))
    }
}

/// Per-log status from the router registration response.
fn check_router_status(status: &str, txid: &str) -> Result<(), PostError> {
    if status.contains(POST_SWAP_SUCCESS_RESULT) {
        info!("post router swap success, txid {}", txid);
        return Ok(());
    }
    if message_is_swap_exist(status) {
        info!("post router swap already exist, txid {}", txid);
        return Ok(());
    }
    if message_is_terminal_ok(status) {
        info!("post router swap terminal, txid {}: {}", txid, status);
        return Ok(());
    }
    info!("post router swap failed, txid {}: {}", txid, status);
    Err(PostError::classify(status))
}

/// "Already registered" phrasings, including the known misspelling.
fn message_is_swap_exist(message: &str) -> bool {
    message.contains(ROUTER_SWAP_EXIST_RESULT) || message.contains(ROUTER_SWAP_EXIST_RESULT_TMP)
}

/// Terminal non-retryable phrases, success-equivalent for queue
/// management.
fn message_is_terminal_ok(message: &str) -> bool {
    message.contains(SWAP_IS_CLOSED_RESULT)
        || message.contains(SWAP_TRADE_NOT_SUPPORT)
        || message.contains(TX_WITH_WRONG_CONTRACT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge_post() -> SwapPost {
        SwapPost {
            txid: "0xabc".to_string(),
            rpc_method: "swap.Swapin".to_string(),
            swap_server: "http://server".to_string(),
            chain: "ETH".to_string(),
            pair_id: "usdt".to_string(),
            chain_id: String::new(),
            log_index: String::new(),
        }
    }

    fn router_post() -> SwapPost {
        SwapPost {
            txid: "0xabc".to_string(),
            rpc_method: "swap.RegisterRouterSwap".to_string(),
            swap_server: "http://server".to_string(),
            chain: "ETH".to_string(),
            pair_id: String::new(),
            chain_id: "56".to_string(),
            log_index: "7".to_string(),
        }
    }

    #[test]
    fn test_build_bridge_args() {
        let (is_router, args) = build_post_args(&bridge_post()).unwrap();
        assert!(!is_router);
        assert_eq!(args, json!({"txid": "0xabc", "pairid": "usdt"}));
    }

    #[test]
    fn test_build_router_args() {
        let (is_router, args) = build_post_args(&router_post()).unwrap();
        assert!(is_router);
        assert_eq!(
            args,
            json!({"chainid": "56", "txid": "0xabc", "logindex": "7"})
        );
    }

    #[test]
    fn test_build_args_rejects_shapeless_record() {
        let mut swap = bridge_post();
        swap.pair_id = String::new();
        let err = build_post_args(&swap).unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_classification() {
        for keyword in TRANSIENT_KEYWORDS {
            assert!(
                PostError::classify(format!("error: {}", keyword)).is_transient(),
                "{} should be transient",
                keyword
            );
        }
        assert!(!PostError::classify("some other failure").is_transient());
    }

    #[test]
    fn test_duplicate_phrases_including_misspelling() {
        assert!(message_is_swap_exist("swap already registered"));
        assert!(message_is_swap_exist("alreday registered"));
        assert!(!message_is_swap_exist("registered"));
    }

    #[test]
    fn test_bridge_duplicate_keyword() {
        assert!("mgoError: Item is duplicate in collection".contains(BRIDGE_SWAP_EXIST_KEYWORDS));
    }

    #[test]
    fn test_router_status_outcomes() {
        assert!(check_router_status("success", "0xabc").is_ok());
        assert!(check_router_status("already registered", "0xabc").is_ok());
        assert!(check_router_status("swap is closed", "0xabc").is_ok());
        assert!(check_router_status("swap trade not support", "0xabc").is_ok());
        assert!(check_router_status("tx with wrong contract", "0xabc").is_ok());

        let err = check_router_status("rpc query error", "0xabc").unwrap_err();
        assert!(err.is_transient());
        let err = check_router_status("verify value mismatch", "0xabc").unwrap_err();
        assert!(!err.is_transient());
    }
}
