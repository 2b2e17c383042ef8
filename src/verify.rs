//! Transaction classification and verification
//!
//! Matches each transaction against the configured token rules and, on a
//! match, hands swap records to the registration dispatcher. Bridge
//! swaps are confirmed from call-data or receipt logs, router swaps
//! always from receipt logs.

use crate::config::{parse_address, TokenRegistry, TokenRule};
use crate::dispatch::Dispatcher;
use crate::rpc::RpcClient;
use crate::types::{Log, Receipt, Transaction};
use alloy_primitives::{b256, Address, B256};
use std::sync::Arc;
use tracing::{debug, warn};

pub const TRANSFER_SELECTOR: [u8; 4] = [0xa9, 0x05, 0x9c, 0xbb];
pub const TRANSFER_FROM_SELECTOR: [u8; 4] = [0x23, 0xb8, 0x72, 0xdd];
// for ETH like `address` type address
pub const ADDRESS_SWAPOUT_SELECTOR: [u8; 4] = [0x62, 0x8d, 0x6c, 0xba];
// for BTC like `string` type address
pub const STRING_SWAPOUT_SELECTOR: [u8; 4] = [0xad, 0x54, 0x05, 0x6d];

pub const TRANSFER_TOPIC: B256 =
    b256!("ddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef");
pub const ADDRESS_SWAPOUT_TOPIC: B256 =
    b256!("6b616089d04950dc06c45c6dd787d657980543f89651aec47924752c7d16c888");
pub const STRING_SWAPOUT_TOPIC: B256 =
    b256!("9c92ad817e5474d30a4378deface765150479363a897b0590fbb12ae9d89396b");

pub const ROUTER_ANY_SWAP_OUT_TOPIC: B256 =
    b256!("97116cf6cd4f6412bb47914d6db18da9e16ab2142f543b86e207c24fbd16b23a");
pub const ROUTER_ANY_SWAP_TRADE_TOKENS_FOR_TOKENS_TOPIC: B256 =
    b256!("fea6abdf4fd32f20966dff7619354cd82cd43dc78a3bee479f04c74dbfc585b3");
pub const ROUTER_ANY_SWAP_TRADE_TOKENS_FOR_NATIVE_TOPIC: B256 =
    b256!("278277e0209c347189add7bd92411973b5f6b8644f7ac62ea1be984ce993f8f4");

pub const NFT721_SWAP_OUT_TOPIC: B256 =
    b256!("0d45b0b9f5add3e1bb841982f1fa9303628b0b619b000cb1f9f1c3903329a4c7");
pub const NFT1155_SWAP_OUT_TOPIC: B256 =
    b256!("5058b8684cf36ffd9f66bc623fbc617a44dd65cf2273306d03d3104af0995cb0");
pub const NFT1155_SWAP_OUT_BATCH_TOPIC: B256 =
    b256!("aa428a5ab688b49b415401782c170d216b33b15711d30cf69482f570eca8db38");

pub const ANYCALL_SWAP_OUT_TOPIC: B256 =
    b256!("9ca1de98ebed0a9c38ace93d3ca529edacbbe199cf1b6f0f416ae9b724d4a81c");
pub const ANYCALL_TRANSFER_SWAP_OUT_TOPIC: B256 =
    b256!("caac11c45e5fdb5c513e20ac229a3f9f99143580b5eb08d0fecbdd5ae8c81ef5");

const ROUTER_ERC20_TOPICS: [B256; 3] = [
    ROUTER_ANY_SWAP_OUT_TOPIC,
    ROUTER_ANY_SWAP_TRADE_TOKENS_FOR_TOKENS_TOPIC,
    ROUTER_ANY_SWAP_TRADE_TOKENS_FOR_NATIVE_TOPIC,
];
const ROUTER_NFT_TOPICS: [B256; 3] = [
    NFT721_SWAP_OUT_TOPIC,
    NFT1155_SWAP_OUT_TOPIC,
    NFT1155_SWAP_OUT_BATCH_TOPIC,
];
const ROUTER_ANYCALL_TOPICS: [B256; 2] =
    [ANYCALL_SWAP_OUT_TOPIC, ANYCALL_TRANSFER_SWAP_OUT_TOPIC];

/// Classification errors, local to one (transaction, rule) pair.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    #[error("tx func hash mismatch")]
    FuncHashMismatch,

    #[error("tx with wrong receiver")]
    WrongReceiver,

    #[error("tx with wrong input")]
    WrongInput,

    #[error("deposit log not found or removed")]
    DepositLogNotFound,

    #[error("swapout log not found")]
    SwapoutLogNotFound,
}

/// Matches transactions against token rules and posts discovered swaps.
pub struct Verifier {
    rpc: Arc<RpcClient>,
    registry: Arc<TokenRegistry>,
    dispatcher: Arc<Dispatcher>,
    scan_receipt: bool,
}

impl Verifier {
    pub fn new(
        rpc: Arc<RpcClient>,
        registry: Arc<TokenRegistry>,
        dispatcher: Arc<Dispatcher>,
        scan_receipt: bool,
    ) -> Self {
        Self {
            rpc,
            registry,
            dispatcher,
            scan_receipt,
        }
    }

    /// Try every token rule against one transaction.
    ///
    /// Classification errors never abort scanning; they are logged and
    /// the next rule is tried.
    pub async fn scan_transaction(&self, tx: &Transaction) {
        if tx.to.is_none() {
            return;
        }
        let rules = self.registry.snapshot();
        for rule in rules.iter() {
            if let Err(e) = self.verify_transaction(tx, rule).await {
                debug!("verify tx {:#x} failed: {}", tx.hash, e);
            }
        }
    }

    /// Verify one transaction against one rule, posting on success.
    pub async fn verify_transaction(
        &self,
        tx: &Transaction,
        rule: &TokenRule,
    ) -> Result<(), VerifyError> {
        let Some(receipt) = self.check_tx_to_address(tx, rule).await else {
            return Ok(());
        };

        let txid = format!("{:#x}", tx.hash);

        if rule.is_router_swap() {
            self.verify_and_post_router_swap(&txid, receipt.as_ref(), rule).await;
            return Ok(());
        }

        if !rule.deposit_address.is_empty() {
            // bridge swapin
            if rule.is_native_token() {
                self.dispatcher.post_bridge_swap(&txid, rule).await;
                return Ok(());
            }
            let verified = match receipt.as_ref() {
                None => parse_erc20_swapin_input(&tx.input, &rule.deposit_address),
                Some(r) => parse_erc20_swapin_logs(&r.logs, rule),
            };
            return match verified {
                Ok(()) => {
                    self.dispatcher.post_bridge_swap(&txid, rule).await;
                    Ok(())
                }
                // the same tx may be the valid deposit of a different
                // bridge rule, so fall through silently
                Err(VerifyError::WrongReceiver) => Ok(()),
                Err(e) => Err(e),
            };
        }

        // bridge swapout
        let verified = match receipt.as_ref() {
            Some(r) => parse_swapout_logs(&r.logs, rule),
            None => parse_swapout_input(&tx.input, &rule.tx_type),
        };
        match verified {
            Ok(()) => {
                self.dispatcher.post_bridge_swap(&txid, rule).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Apply the `to`-address filter and fetch the receipt when the rule
    /// needs one.
    ///
    /// Returns None when the rule does not apply to this transaction or
    /// when a required receipt could not be fetched.
    async fn check_tx_to_address(
        &self,
        tx: &Transaction,
        rule: &TokenRule,
    ) -> Option<Option<Receipt>> {
        let to = tx.to?;
        let mut need_receipt = self.scan_receipt;

        let cmp_to = if rule.is_router_swap() {
            need_receipt = true;
            rule.router_contract.as_str()
        } else if rule.is_native_token() {
            rule.deposit_address.as_str()
        } else if !rule.call_by_contract.is_empty() {
            need_receipt = true;
            rule.call_by_contract.as_str()
        } else {
            rule.token_address.as_str()
        };

        let mut accept = matches_address(cmp_to, &to);
        if !accept && !rule.is_native_token() {
            for white_addr in &rule.whitelist {
                if matches_address(white_addr, &to) {
                    accept = true;
                    need_receipt = true;
                    break;
                }
            }
        }
        if !accept {
            return None;
        }

        if need_receipt {
            match self.rpc.loop_get_receipt(tx.hash).await {
                Ok(r) => Some(Some(r)),
                Err(e) => {
                    warn!("get tx receipt error for {:#x}: {:#}", tx.hash, e);
                    None
                }
            }
        } else {
            Some(None)
        }
    }

    /// Emit one router swap record per matching receipt log.
    async fn verify_and_post_router_swap(
        &self,
        txid: &str,
        receipt: Option<&Receipt>,
        rule: &TokenRule,
    ) {
        let Some(receipt) = receipt else {
            return;
        };
        for log_index in router_matching_log_indexes(receipt, rule) {
            self.dispatcher.post_router_swap(txid, log_index, rule).await;
        }
    }
}

/// Indexes of non-removed logs on the router contract whose first topic
/// belongs to the rule's topic set. The index is the position in the
/// receipt's log array.
pub fn router_matching_log_indexes(receipt: &Receipt, rule: &TokenRule) -> Vec<usize> {
    let mut matched = Vec::new();
    for (i, log) in receipt.logs.iter().enumerate() {
        if log.removed {
            continue;
        }
        if !matches_address(&rule.router_contract, &log.address) {
            continue;
        }
        let Some(topic0) = log.topics.first().and_then(|t| parse_topic(t)) else {
            continue;
        };
        let hit = if rule.is_router_erc20_swap() {
            ROUTER_ERC20_TOPICS.contains(&topic0)
        } else if rule.is_router_nft_swap() {
            ROUTER_NFT_TOPICS.contains(&topic0)
        } else if rule.is_router_anycall_swap() {
            ROUTER_ANYCALL_TOPICS.contains(&topic0)
        } else {
            false
        };
        if hit {
            matched.push(i);
        }
    }
    matched
}

/// Verify an erc20 swapin from call-data: the input must be a
/// `transfer` or `transferFrom` whose receiver is the deposit address.
pub fn parse_erc20_swapin_input(input: &[u8], deposit_address: &str) -> Result<(), VerifyError> {
    if input.len() < 4 {
        return Err(VerifyError::WrongInput);
    }
    let receiver = if input[..4] == TRANSFER_SELECTOR {
        if input.len() < 36 {
            return Err(VerifyError::WrongInput);
        }
        // receiver is the first call argument, bytes [4, 36)
        Address::from_slice(&input[16..36])
    } else if input[..4] == TRANSFER_FROM_SELECTOR {
        if input.len() < 68 {
            return Err(VerifyError::WrongInput);
        }
        // receiver is the second call argument, bytes [36, 68)
        Address::from_slice(&input[48..68])
    } else {
        return Err(VerifyError::FuncHashMismatch);
    };
    if matches_address(deposit_address, &receiver) {
        Ok(())
    } else {
        Err(VerifyError::WrongReceiver)
    }
}

/// Verify an erc20 swapin from receipt logs: at least one Transfer log
/// on the token contract must name the deposit address as receiver.
pub fn parse_erc20_swapin_logs(logs: &[Log], rule: &TokenRule) -> Result<(), VerifyError> {
    let Some((cmp_topic, topics_len)) = log_topic_by_tx_type(&rule.tx_type) else {
        return Err(VerifyError::DepositLogNotFound);
    };
    let mut transfer_log_exists = false;
    for log in logs {
        if log.removed {
            continue;
        }
        if !matches_address(&rule.token_address, &log.address) {
            continue;
        }
        if log.topics.len() != topics_len || log.data.is_empty() {
            continue;
        }
        let Some(topic0) = parse_topic(&log.topics[0]) else {
            continue;
        };
        if topic0 != cmp_topic {
            continue;
        }
        transfer_log_exists = true;
        let Some(receiver) = topic_address(&log.topics[2]) else {
            continue;
        };
        if matches_address(&rule.deposit_address, &receiver) {
            return Ok(());
        }
    }
    if transfer_log_exists {
        Err(VerifyError::WrongReceiver)
    } else {
        Err(VerifyError::DepositLogNotFound)
    }
}

/// Verify a swapout from call-data by its function selector.
pub fn parse_swapout_input(input: &[u8], tx_type: &str) -> Result<(), VerifyError> {
    if input.len() < 4 {
        return Err(VerifyError::WrongInput);
    }
    match swapout_selector_by_tx_type(tx_type) {
        Some(selector) if input[..4] == selector => Ok(()),
        _ => Err(VerifyError::FuncHashMismatch),
    }
}

/// Verify a swapout from receipt logs by its event topic.
pub fn parse_swapout_logs(logs: &[Log], rule: &TokenRule) -> Result<(), VerifyError> {
    let Some((cmp_topic, topics_len)) = log_topic_by_tx_type(&rule.tx_type) else {
        return Err(VerifyError::SwapoutLogNotFound);
    };
    for log in logs {
        if log.removed {
            continue;
        }
        if !matches_address(&rule.token_address, &log.address) {
            continue;
        }
        if log.topics.len() != topics_len || log.data.is_empty() {
            continue;
        }
        if parse_topic(&log.topics[0]) == Some(cmp_topic) {
            return Ok(());
        }
    }
    Err(VerifyError::SwapoutLogNotFound)
}

fn swapout_selector_by_tx_type(tx_type: &str) -> Option<[u8; 4]> {
    match tx_type {
        crate::config::TX_SWAPOUT => Some(ADDRESS_SWAPOUT_SELECTOR),
        crate::config::TX_SWAPOUT2 => Some(STRING_SWAPOUT_SELECTOR),
        _ => None,
    }
}

/// Expected log topic and topic count for a bridge tx type.
fn log_topic_by_tx_type(tx_type: &str) -> Option<(B256, usize)> {
    match tx_type {
        crate::config::TX_SWAPIN => Some((TRANSFER_TOPIC, 3)),
        crate::config::TX_SWAPOUT => Some((ADDRESS_SWAPOUT_TOPIC, 3)),
        crate::config::TX_SWAPOUT2 => Some((STRING_SWAPOUT_TOPIC, 2)),
        _ => None,
    }
}

/// Case-insensitive compare of a configured hex address against a
/// parsed one. Malformed configuration strings never match.
fn matches_address(configured: &str, addr: &Address) -> bool {
    parse_address(configured).map(|a| a == *addr).unwrap_or(false)
}

/// Parse a 32-byte hex topic string.
fn parse_topic(topic: &str) -> Option<B256> {
    let s = topic.strip_prefix("0x").unwrap_or(topic);
    let bytes = hex::decode(s).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    Some(B256::from_slice(&bytes))
}

/// Parse the address packed into a 32-byte topic (last 20 bytes).
fn topic_address(topic: &str) -> Option<Address> {
    let hash = parse_topic(topic)?;
    Some(Address::from_slice(&hash[12..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TX_ROUTER_ANYCALL_SWAP, TX_ROUTER_ERC20_SWAP, TX_ROUTER_NFT_SWAP};

    const TOKEN: &str = "0xdac17f958d2ee523a2206206994597c13d831ec7";
    const DEPOSIT: &str = "0x1111111254fb6c44bac0bed2854e76f90643097d";
    const OTHER: &str = "0x2222222254fb6c44bac0bed2854e76f90643097d";
    const ROUTER: &str = "0x6b7a87899490ece95443e979ca9485cbe7e71522";

    fn transfer_input(receiver: &str, amount: u64) -> Vec<u8> {
        let mut input = TRANSFER_SELECTOR.to_vec();
        input.extend_from_slice(&[0u8; 12]);
        input.extend_from_slice(&hex::decode(receiver.trim_start_matches("0x")).unwrap());
        let mut value = [0u8; 32];
        value[24..].copy_from_slice(&amount.to_be_bytes());
        input.extend_from_slice(&value);
        input
    }

    fn transfer_from_input(receiver: &str) -> Vec<u8> {
        let mut input = TRANSFER_FROM_SELECTOR.to_vec();
        // sender argument
        input.extend_from_slice(&[0u8; 12]);
        input.extend_from_slice(&hex::decode(OTHER.trim_start_matches("0x")).unwrap());
        // receiver argument
        input.extend_from_slice(&[0u8; 12]);
        input.extend_from_slice(&hex::decode(receiver.trim_start_matches("0x")).unwrap());
        input
    }

    fn topic_for_address(addr: &str) -> String {
        format!("0x{}{}", "0".repeat(24), addr.trim_start_matches("0x"))
    }

    fn log(address: &str, topics: Vec<String>, data: Vec<u8>) -> Log {
        Log {
            address: parse_address(address).unwrap(),
            topics,
            data,
            removed: false,
        }
    }

    fn router_rule(tx_type: &str) -> TokenRule {
        TokenRule {
            tx_type: tx_type.to_string(),
            swap_server: "http://server".to_string(),
            call_by_contract: String::new(),
            whitelist: Vec::new(),
            pair_id: String::new(),
            token_address: String::new(),
            deposit_address: String::new(),
            chain_id: "56".to_string(),
            router_contract: ROUTER.to_string(),
        }
    }

    fn swapin_rule() -> TokenRule {
        TokenRule {
            tx_type: crate::config::TX_SWAPIN.to_string(),
            swap_server: "http://server".to_string(),
            call_by_contract: String::new(),
            whitelist: Vec::new(),
            pair_id: "usdt".to_string(),
            token_address: TOKEN.to_string(),
            deposit_address: DEPOSIT.to_string(),
            chain_id: String::new(),
            router_contract: String::new(),
        }
    }

    #[test]
    fn test_swapin_input_transfer_to_deposit() {
        let input = transfer_input(DEPOSIT, 100);
        assert_eq!(parse_erc20_swapin_input(&input, DEPOSIT), Ok(()));
    }

    #[test]
    fn test_swapin_input_wrong_receiver() {
        let input = transfer_input(OTHER, 100);
        assert_eq!(
            parse_erc20_swapin_input(&input, DEPOSIT),
            Err(VerifyError::WrongReceiver)
        );
    }

    #[test]
    fn test_swapin_input_transfer_from() {
        let input = transfer_from_input(DEPOSIT);
        assert_eq!(parse_erc20_swapin_input(&input, DEPOSIT), Ok(()));
    }

    #[test]
    fn test_swapin_input_unknown_selector() {
        let input = vec![0xde, 0xad, 0xbe, 0xef, 0x00];
        assert_eq!(
            parse_erc20_swapin_input(&input, DEPOSIT),
            Err(VerifyError::FuncHashMismatch)
        );
    }

    #[test]
    fn test_swapin_input_too_short() {
        assert_eq!(
            parse_erc20_swapin_input(&[0xa9], DEPOSIT),
            Err(VerifyError::WrongInput)
        );
        // valid selector but truncated arguments
        assert_eq!(
            parse_erc20_swapin_input(&TRANSFER_SELECTOR, DEPOSIT),
            Err(VerifyError::WrongInput)
        );
    }

    #[test]
    fn test_swapin_logs_deposit_found() {
        let rule = swapin_rule();
        let logs = vec![log(
            TOKEN,
            vec![
                format!("{:#x}", TRANSFER_TOPIC),
                topic_for_address(OTHER),
                topic_for_address(DEPOSIT),
            ],
            vec![0u8; 32],
        )];
        assert_eq!(parse_erc20_swapin_logs(&logs, &rule), Ok(()));
    }

    #[test]
    fn test_swapin_logs_wrong_receiver() {
        let rule = swapin_rule();
        let logs = vec![log(
            TOKEN,
            vec![
                format!("{:#x}", TRANSFER_TOPIC),
                topic_for_address(DEPOSIT),
                topic_for_address(OTHER),
            ],
            vec![0u8; 32],
        )];
        assert_eq!(
            parse_erc20_swapin_logs(&logs, &rule),
            Err(VerifyError::WrongReceiver)
        );
    }

    #[test]
    fn test_swapin_logs_not_found() {
        let rule = swapin_rule();
        // log from a different contract is not a deposit log
        let logs = vec![log(
            OTHER,
            vec![
                format!("{:#x}", TRANSFER_TOPIC),
                topic_for_address(OTHER),
                topic_for_address(DEPOSIT),
            ],
            vec![0u8; 32],
        )];
        assert_eq!(
            parse_erc20_swapin_logs(&logs, &rule),
            Err(VerifyError::DepositLogNotFound)
        );
    }

    #[test]
    fn test_swapout_input_selectors() {
        assert_eq!(
            parse_swapout_input(&ADDRESS_SWAPOUT_SELECTOR, crate::config::TX_SWAPOUT),
            Ok(())
        );
        assert_eq!(
            parse_swapout_input(&STRING_SWAPOUT_SELECTOR, crate::config::TX_SWAPOUT2),
            Ok(())
        );
        assert_eq!(
            parse_swapout_input(&STRING_SWAPOUT_SELECTOR, crate::config::TX_SWAPOUT),
            Err(VerifyError::FuncHashMismatch)
        );
    }

    #[test]
    fn test_swapout_logs_topic_count() {
        let mut rule = swapin_rule();
        rule.tx_type = crate::config::TX_SWAPOUT2.to_string();
        rule.deposit_address = String::new();

        // string-type swapout carries two topics
        let logs = vec![log(
            TOKEN,
            vec![format!("{:#x}", STRING_SWAPOUT_TOPIC), topic_for_address(OTHER)],
            vec![0u8; 64],
        )];
        assert_eq!(parse_swapout_logs(&logs, &rule), Ok(()));

        // three topics do not match the string-type layout
        let logs = vec![log(
            TOKEN,
            vec![
                format!("{:#x}", STRING_SWAPOUT_TOPIC),
                topic_for_address(OTHER),
                topic_for_address(DEPOSIT),
            ],
            vec![0u8; 64],
        )];
        assert_eq!(
            parse_swapout_logs(&logs, &rule),
            Err(VerifyError::SwapoutLogNotFound)
        );
    }

    #[test]
    fn test_router_two_matching_logs() {
        let rule = router_rule(TX_ROUTER_ERC20_SWAP);
        let filler = log(OTHER, vec![format!("{:#x}", TRANSFER_TOPIC)], vec![]);
        let hit = |topic: B256| log(ROUTER, vec![format!("{:#x}", topic)], vec![0u8; 32]);

        let receipt = Receipt {
            status: 1,
            logs: vec![
                filler.clone(),
                filler.clone(),
                filler.clone(),
                hit(ROUTER_ANY_SWAP_OUT_TOPIC),
                filler.clone(),
                filler.clone(),
                filler,
                hit(ROUTER_ANY_SWAP_TRADE_TOKENS_FOR_TOKENS_TOPIC),
            ],
        };
        assert_eq!(router_matching_log_indexes(&receipt, &rule), vec![3, 7]);
    }

    #[test]
    fn test_router_skips_removed_and_foreign_logs() {
        let rule = router_rule(TX_ROUTER_ERC20_SWAP);
        let mut removed = log(
            ROUTER,
            vec![format!("{:#x}", ROUTER_ANY_SWAP_OUT_TOPIC)],
            vec![0u8; 32],
        );
        removed.removed = true;
        let foreign = log(
            OTHER,
            vec![format!("{:#x}", ROUTER_ANY_SWAP_OUT_TOPIC)],
            vec![0u8; 32],
        );
        let receipt = Receipt {
            status: 1,
            logs: vec![removed, foreign],
        };
        assert!(router_matching_log_indexes(&receipt, &rule).is_empty());
    }

    #[test]
    fn test_router_topic_sets_by_kind() {
        let nft_log = log(
            ROUTER,
            vec![format!("{:#x}", NFT1155_SWAP_OUT_BATCH_TOPIC)],
            vec![0u8; 32],
        );
        let anycall_log = log(
            ROUTER,
            vec![format!("{:#x}", ANYCALL_TRANSFER_SWAP_OUT_TOPIC)],
            vec![0u8; 32],
        );
        let receipt = Receipt {
            status: 1,
            logs: vec![nft_log, anycall_log],
        };

        assert_eq!(
            router_matching_log_indexes(&receipt, &router_rule(TX_ROUTER_NFT_SWAP)),
            vec![0]
        );
        assert_eq!(
            router_matching_log_indexes(&receipt, &router_rule(TX_ROUTER_ANYCALL_SWAP)),
            vec![1]
        );
        assert!(router_matching_log_indexes(&receipt, &router_rule(TX_ROUTER_ERC20_SWAP))
            .is_empty());
    }

    #[test]
    fn test_topic_address_roundtrip() {
        let topic = topic_for_address(DEPOSIT);
        assert_eq!(topic_address(&topic), Some(parse_address(DEPOSIT).unwrap()));
        assert_eq!(topic_address("0x1234"), None);
    }
}
