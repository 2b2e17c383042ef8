//! Durable swap queue over MongoDB
//!
//! Three collections keyed by txid (`Swap` for settled registrations,
//! `SwapPending` for registrations awaiting a successful post,
//! `SwapDeleted` for tombstoned pending entries) plus the per-chain
//! `SyncedBlock` checkpoint. Inserts are idempotent: duplicate-key
//! errors are swallowed so reposting the same record is harmless.

use crate::config::MongoDbConfig;
use crate::dispatch::SwapPost;
use anyhow::{Context, Result};
use futures::TryStreamExt;
use mongodb::bson::doc;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, Credential, FindOptions, UpdateOptions};
use mongodb::{Client, Collection};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::info;

const TB_SWAP: &str = "Swap";
const TB_SWAP_PENDING: &str = "SwapPending";
const TB_SWAP_DELETED: &str = "SwapDeleted";
const TB_SYNCED_BLOCK: &str = "SyncedBlock";

/// Duplicate-key error code reported by the server.
const DUPLICATE_KEY_CODE: i32 = 11000;

/// Stored form of a swap record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwapDoc {
    #[serde(rename = "_id")]
    pub txid: String,

    #[serde(rename = "pairid", default)]
    pub pair_id: String,

    #[serde(rename = "rpcmethod", default)]
    pub rpc_method: String,

    #[serde(rename = "swapserver", default)]
    pub swap_server: String,

    #[serde(rename = "chainid", default)]
    pub chain_id: String,

    #[serde(rename = "logindex", default)]
    pub log_index: String,

    #[serde(rename = "chain", default)]
    pub chain: String,

    #[serde(rename = "timestamp", default)]
    pub timestamp: u64,
}

impl SwapDoc {
    pub fn from_post(swap: &SwapPost) -> Self {
        Self {
            txid: swap.txid.clone(),
            pair_id: swap.pair_id.clone(),
            rpc_method: swap.rpc_method.clone(),
            swap_server: swap.swap_server.clone(),
            chain_id: swap.chain_id.clone(),
            log_index: swap.log_index.clone(),
            chain: swap.chain.clone(),
            timestamp: unix_now(),
        }
    }

    pub fn to_post(&self) -> SwapPost {
        SwapPost {
            txid: self.txid.clone(),
            rpc_method: self.rpc_method.clone(),
            swap_server: self.swap_server.clone(),
            chain: self.chain.clone(),
            pair_id: self.pair_id.clone(),
            chain_id: self.chain_id.clone(),
            log_index: self.log_index.clone(),
        }
    }
}

/// Per-chain sync-height checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncedBlockDoc {
    #[serde(rename = "_id")]
    pub chain: String,

    #[serde(rename = "number", default)]
    pub number: u64,
}

/// Handle over the four scanner collections.
pub struct SwapStore {
    swaps: Collection<SwapDoc>,
    pending: Collection<SwapDoc>,
    deleted: Collection<SwapDoc>,
    synced: Collection<SyncedBlockDoc>,
}

impl SwapStore {
    /// Connect to the configured database and bind the collections.
    pub async fn connect(cfg: &MongoDbConfig) -> Result<Self> {
        let uri = if cfg.db_url.contains("://") {
            cfg.db_url.clone()
        } else {
            format!("mongodb://{}", cfg.db_url)
        };
        let mut options = ClientOptions::parse(&uri)
            .await
            .with_context(|| format!("Failed to parse mongodb url {}", cfg.db_url))?;
        if !cfg.user_name.is_empty() {
            options.credential = Some(
                Credential::builder()
                    .username(cfg.user_name.clone())
                    .password(cfg.password.clone())
                    .source(cfg.db_name.clone())
                    .build(),
            );
        }
        let client = Client::with_options(options).context("Failed to create mongodb client")?;
        let db = client.database(&cfg.db_name);
        info!("connect mongodb success, db {}", cfg.db_name);
        Ok(Self {
            swaps: db.collection(TB_SWAP),
            pending: db.collection(TB_SWAP_PENDING),
            deleted: db.collection(TB_SWAP_DELETED),
            synced: db.collection(TB_SYNCED_BLOCK),
        })
    }

    /// Record a settled registration (successful or terminal).
    pub async fn add_swap(&self, swap: &SwapPost) -> Result<()> {
        insert_ignore_duplicate(&self.swaps, SwapDoc::from_post(swap)).await
    }

    /// Queue a registration for the pending worker.
    pub async fn add_swap_pending(&self, swap: &SwapPost) -> Result<()> {
        insert_ignore_duplicate(&self.pending, SwapDoc::from_post(swap)).await
    }

    /// Tombstone a pending entry whose transaction is gone.
    pub async fn add_swap_deleted(&self, doc: &SwapDoc) -> Result<()> {
        insert_ignore_duplicate(&self.deleted, doc.clone()).await
    }

    /// Page through pending entries for one chain.
    pub async fn find_swap_pending(
        &self,
        chain: &str,
        offset: u64,
        limit: i64,
    ) -> Result<Vec<SwapDoc>> {
        let options = FindOptions::builder().skip(offset).limit(limit).build();
        let cursor = self
            .pending
            .find(doc! {"chain": chain}, options)
            .await
            .context("find pending swaps failed")?;
        cursor
            .try_collect()
            .await
            .context("read pending swaps failed")
    }

    pub async fn remove_swap_pending(&self, txid: &str) -> Result<()> {
        self.pending
            .delete_one(doc! {"_id": txid}, None)
            .await
            .context("remove pending swap failed")?;
        Ok(())
    }

    /// Read the checkpointed sync height for a chain.
    pub async fn find_synced_block(&self, chain: &str) -> Result<u64> {
        let found = self
            .synced
            .find_one(doc! {"_id": chain}, None)
            .await
            .context("find synced block failed")?;
        found
            .map(|d| d.number)
            .with_context(|| format!("no synced block record for chain {}", chain))
    }

    /// Write the checkpointed sync height for a chain (upsert).
    pub async fn update_synced_block(&self, chain: &str, number: u64) -> Result<()> {
        let options = UpdateOptions::builder().upsert(true).build();
        self.synced
            .update_one(
                doc! {"_id": chain},
                doc! {"$set": {"number": number as i64}},
                options,
            )
            .await
            .context("update synced block failed")?;
        Ok(())
    }
}

async fn insert_ignore_duplicate(col: &Collection<SwapDoc>, doc: SwapDoc) -> Result<()> {
    match col.insert_one(doc, None).await {
        Ok(_) => Ok(()),
        Err(e) if is_duplicate_key_error(&e) => Ok(()),
        Err(e) => Err(e).with_context(|| format!("insert into {} failed", col.name())),
    }
}

fn is_duplicate_key_error(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == DUPLICATE_KEY_CODE
    )
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc() -> SwapDoc {
        SwapDoc {
            txid: "0xabc".to_string(),
            pair_id: "usdt".to_string(),
            rpc_method: "swap.Swapin".to_string(),
            swap_server: "http://server".to_string(),
            chain_id: String::new(),
            log_index: String::new(),
            chain: "ETH".to_string(),
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn test_doc_post_roundtrip() {
        let doc = sample_doc();
        let post = doc.to_post();
        assert_eq!(post.txid, "0xabc");
        assert_eq!(post.pair_id, "usdt");

        let back = SwapDoc::from_post(&post);
        assert_eq!(back.txid, doc.txid);
        assert_eq!(back.rpc_method, doc.rpc_method);
        assert_eq!(back.chain, doc.chain);
    }

    #[test]
    fn test_doc_field_names() {
        let bson = mongodb::bson::to_document(&sample_doc()).unwrap();
        assert_eq!(bson.get_str("_id").unwrap(), "0xabc");
        assert_eq!(bson.get_str("pairid").unwrap(), "usdt");
        assert_eq!(bson.get_str("rpcmethod").unwrap(), "swap.Swapin");
        assert_eq!(bson.get_str("chain").unwrap(), "ETH");
    }

    #[test]
    fn test_synced_doc_field_names() {
        let doc = SyncedBlockDoc {
            chain: "ETH".to_string(),
            number: 1234,
        };
        let bson = mongodb::bson::to_document(&doc).unwrap();
        assert_eq!(bson.get_str("_id").unwrap(), "ETH");
        assert_eq!(bson.get_i64("number").unwrap(), 1234);
    }
}
