//! Configuration loading and the token-rule registry
//!
//! Parses the TOML configuration (`MongoDB`, `BlockChain` and repeated
//! `[[Tokens]]` tables), validates the token-rule table, and publishes
//! rule snapshots through `TokenRegistry` so the tail-follower can react
//! to hot reloads.

use alloy_primitives::Address;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tracing::{error, info, warn};

// Swap tx types
pub const TX_SWAPIN: &str = "swapin";
pub const TX_SWAPOUT: &str = "swapout";
pub const TX_SWAPOUT2: &str = "swapout2"; // swapout to string address (eg. BTC)
pub const TX_ROUTER_ERC20_SWAP: &str = "routerswap";
pub const TX_ROUTER_NFT_SWAP: &str = "nftswap";
pub const TX_ROUTER_ANYCALL_SWAP: &str = "anycallswap";
pub const TX_ROUTER_GAS_SWAP: &str = "gasswap";

/// How often the reload watcher polls the config file for changes.
const RELOAD_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Top-level configuration file layout.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "MongoDB")]
    pub mongodb: Option<MongoDbConfig>,

    #[serde(rename = "BlockChain")]
    pub blockchain: BlockChainConfig,

    #[serde(rename = "Tokens", default)]
    pub tokens: Vec<TokenRule>,
}

/// Document store connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MongoDbConfig {
    #[serde(rename = "DBURL", default)]
    pub db_url: String,

    #[serde(rename = "DBName", default)]
    pub db_name: String,

    #[serde(rename = "UserName", default)]
    pub user_name: String,

    #[serde(rename = "Password", default)]
    pub password: String,

    #[serde(rename = "Enable", default)]
    pub enable: bool,
}

/// Chain parameters for the scanner.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockChainConfig {
    /// Chain tag used to key checkpoint and queue documents
    #[serde(rename = "Chain", default)]
    pub chain: String,

    /// Block depth assumed immune to reorg
    #[serde(rename = "StableHeight", default)]
    pub stable_height: u64,

    /// How many blocks to rewind when the token table reloads
    #[serde(rename = "ScanBackHeight", default)]
    pub scan_back_height: u64,

    /// Checkpoint flush interval in blocks (0 keeps the default of 100)
    #[serde(rename = "SyncNumber", default)]
    pub sync_number: u64,
}

/// One configured contract/deposit target to match transactions against.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenRule {
    #[serde(rename = "TxType", default)]
    pub tx_type: String,

    #[serde(rename = "SwapServer", default)]
    pub swap_server: String,

    #[serde(rename = "CallByContract", default)]
    pub call_by_contract: String,

    #[serde(rename = "Whitelist", default)]
    pub whitelist: Vec<String>,

    // bridge
    #[serde(rename = "PairID", default)]
    pub pair_id: String,

    #[serde(rename = "TokenAddress", default)]
    pub token_address: String,

    #[serde(rename = "DepositAddress", default)]
    pub deposit_address: String,

    // router
    #[serde(rename = "ChainID", default)]
    pub chain_id: String,

    #[serde(rename = "RouterContract", default)]
    pub router_contract: String,
}

impl TokenRule {
    pub fn is_native_token(&self) -> bool {
        self.token_address == "native"
    }

    pub fn is_valid_swap_type(&self) -> bool {
        matches!(
            self.tx_type.as_str(),
            TX_SWAPIN
                | TX_SWAPOUT
                | TX_SWAPOUT2
                | TX_ROUTER_ERC20_SWAP
                | TX_ROUTER_NFT_SWAP
                | TX_ROUTER_ANYCALL_SWAP
                | TX_ROUTER_GAS_SWAP
        )
    }

    pub fn is_bridge_swap(&self) -> bool {
        matches!(self.tx_type.as_str(), TX_SWAPIN | TX_SWAPOUT | TX_SWAPOUT2)
    }

    /// Router erc20 rules also cover gas swaps (same topic set).
    pub fn is_router_erc20_swap(&self) -> bool {
        matches!(self.tx_type.as_str(), TX_ROUTER_ERC20_SWAP | TX_ROUTER_GAS_SWAP)
    }

    pub fn is_router_nft_swap(&self) -> bool {
        self.tx_type == TX_ROUTER_NFT_SWAP
    }

    pub fn is_router_anycall_swap(&self) -> bool {
        self.tx_type == TX_ROUTER_ANYCALL_SWAP
    }

    pub fn is_router_swap(&self) -> bool {
        self.is_router_erc20_swap() || self.is_router_nft_swap() || self.is_router_anycall_swap()
    }

    /// Per-rule validation; applies the swapin token-address fixup.
    fn check(&mut self) -> Result<()> {
        if !self.is_valid_swap_type() {
            anyhow::bail!("invalid 'TxType' {}", self.tx_type);
        }
        if self.swap_server.is_empty() {
            anyhow::bail!("empty 'SwapServer'");
        }
        if !self.call_by_contract.is_empty() && !is_hex_address(&self.call_by_contract) {
            anyhow::bail!("wrong 'CallByContract' {}", self.call_by_contract);
        }
        for addr in &self.whitelist {
            if !is_hex_address(addr) {
                anyhow::bail!("wrong 'Whitelist' address {}", addr);
            }
        }
        if self.is_bridge_swap() {
            if self.pair_id.is_empty() {
                anyhow::bail!("empty 'PairID'");
            }
            if self.tx_type == TX_SWAPIN
                && !self.call_by_contract.is_empty()
                && self.token_address.is_empty()
            {
                // assign token address for swapin if empty
                self.token_address = self.call_by_contract.clone();
            }
            if !self.is_native_token() && !is_hex_address(&self.token_address) {
                anyhow::bail!("wrong 'TokenAddress' {}", self.token_address);
            }
            if !self.deposit_address.is_empty() && !is_hex_address(&self.deposit_address) {
                anyhow::bail!("wrong 'DepositAddress' {}", self.deposit_address);
            }
        } else {
            if !is_hex_address(&self.router_contract) {
                anyhow::bail!("wrong 'RouterContract' {}", self.router_contract);
            }
            self.chain_id
                .parse::<u128>()
                .with_context(|| format!("wrong chainID '{}'", self.chain_id))?;
        }
        Ok(())
    }
}

/// Validate the whole token table, including duplicate-key invariants.
pub fn check_token_rules(rules: &mut [TokenRule]) -> Result<()> {
    if rules.is_empty() {
        anyhow::bail!("no token config exist");
    }
    let mut pair_keys = std::collections::HashSet::new();
    let mut token_keys = std::collections::HashSet::new();
    let mut router_keys = std::collections::HashSet::new();
    for rule in rules.iter_mut() {
        rule.check()?;
        if rule.is_router_swap() {
            let key = format!("{}:{}:{}", rule.chain_id, rule.router_contract, rule.swap_server)
                .to_lowercase();
            if !router_keys.insert(key) {
                anyhow::bail!("duplicate router swap config {}", rule.router_contract);
            }
            continue;
        }
        if !rule.call_by_contract.is_empty() {
            continue;
        }
        let pair_key = format!(
            "{}:{}:{}:{}",
            rule.token_address, rule.pair_id, rule.tx_type, rule.swap_server
        )
        .to_lowercase();
        if !pair_keys.insert(pair_key.clone()) {
            anyhow::bail!("duplicate pairID config {}", pair_key);
        }
        if !rule.is_native_token() {
            let token_key =
                format!("{}:{}", rule.token_address, rule.deposit_address).to_lowercase();
            if !token_keys.insert(token_key.clone()) {
                anyhow::bail!("duplicate token config {}", token_key);
            }
        }
    }
    Ok(())
}

/// Load and validate the configuration file.
pub fn load_config(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("Failed to parse config file {:?}", path))?;
    check_token_rules(&mut config.tokens)
        .with_context(|| format!("Invalid token config in {:?}", path))?;
    Ok(config)
}

/// Immutable token-rule snapshots with a reload latch.
///
/// Publication of a new snapshot happens-before readers observe the
/// latch: `replace` stores the rules under the write lock before
/// setting the flag.
pub struct TokenRegistry {
    rules: RwLock<Arc<Vec<TokenRule>>>,
    reloaded: AtomicBool,
}

impl TokenRegistry {
    pub fn new(rules: Vec<TokenRule>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
            reloaded: AtomicBool::new(false),
        }
    }

    /// Current snapshot of the token table.
    pub fn snapshot(&self) -> Arc<Vec<TokenRule>> {
        self.rules.read().unwrap().clone()
    }

    /// Atomically publish a new token table and set the reload latch.
    pub fn replace(&self, rules: Vec<TokenRule>) {
        *self.rules.write().unwrap() = Arc::new(rules);
        self.reloaded.store(true, Ordering::SeqCst);
    }

    /// True when a reload was published since the last `clear_reload`.
    pub fn reload_pending(&self) -> bool {
        self.reloaded.load(Ordering::SeqCst)
    }

    pub fn clear_reload(&self) {
        self.reloaded.store(false, Ordering::SeqCst);
    }
}

/// Watch the config file and republish the token table when it changes.
///
/// Only the `Tokens` tables are reloaded; chain and store settings are
/// fixed at boot. A reload that fails to parse or validate is dropped
/// with an error log, never fatal.
pub async fn watch_and_reload(path: PathBuf, registry: Arc<TokenRegistry>) {
    let mut last_modified = file_mtime(&path);
    loop {
        tokio::time::sleep(RELOAD_POLL_INTERVAL).await;
        let modified = file_mtime(&path);
        if modified == last_modified {
            continue;
        }
        last_modified = modified;
        match reload_token_rules(&path) {
            Ok(rules) => {
                info!("reload config success, {} token rules", rules.len());
                registry.replace(rules);
            }
            Err(e) => error!("reload config failed: {:#}", e),
        }
    }
}

fn reload_token_rules(path: &Path) -> Result<Vec<TokenRule>> {
    let config = load_config(path)?;
    Ok(config.tokens)
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(t) => Some(t),
        Err(e) => {
            warn!("stat config file {:?} failed: {}", path, e);
            None
        }
    }
}

/// Check a string is a hex address (40 hex chars, 0x prefix optional).
pub fn is_hex_address(s: &str) -> bool {
    let s = s.strip_prefix("0x").unwrap_or(s);
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Parse a hex string into a 20-byte address.
pub fn parse_address(s: &str) -> Result<Address> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(s).with_context(|| format!("Invalid hex address: {}", s))?;
    if bytes.len() != 20 {
        anyhow::bail!("Address must be 20 bytes (40 hex chars), got {} bytes", bytes.len());
    }
    Ok(Address::from_slice(&bytes))
}
