//! In-memory rings
//!
//! Two fixed-capacity circular buffers: one deduplicating recently
//! scanned block hashes during tail-follow, one holding swap posts
//! awaiting a periodic repost. Both are approximate by design; the
//! durable pending queue is the source of truth for retries.

use crate::dispatch::SwapPost;
use alloy_primitives::B256;
use std::sync::Mutex;

/// Capacity shared by both rings.
pub const RING_CAPACITY: usize = 100;

/// Ring of recently scanned block hashes.
///
/// Used only from the tail-follower task for dedup; collisions after
/// wrap-around are accepted.
pub struct ScannedBlockRing {
    hashes: Vec<Option<B256>>,
    next: usize,
}

impl ScannedBlockRing {
    pub fn new() -> Self {
        Self {
            hashes: vec![None; RING_CAPACITY],
            next: 0,
        }
    }

    /// Record a block hash, overwriting the oldest entry once full.
    pub fn add_block(&mut self, hash: B256) {
        self.hashes[self.next] = Some(hash);
        self.next = (self.next + 1) % RING_CAPACITY;
    }

    /// Linear scan over the ring.
    pub fn is_scanned(&self, hash: B256) -> bool {
        self.hashes.iter().any(|h| *h == Some(hash))
    }
}

impl Default for ScannedBlockRing {
    fn default() -> Self {
        Self::new()
    }
}

struct SwapRingInner {
    slots: Vec<Option<SwapPost>>,
    next: usize,
}

/// Fixed-capacity ring of swap posts to re-post periodically.
///
/// `add` is called from dispatcher tasks while the poller snapshots and
/// evicts entries, so the slot array lives behind a mutex. The lock is
/// never held across an await: the poller takes a snapshot, reposts
/// outside the lock, and evicts only slots that still hold the same
/// entry.
pub struct SwapRing {
    inner: Mutex<SwapRingInner>,
}

impl SwapRing {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SwapRingInner {
                slots: vec![None; RING_CAPACITY],
                next: 0,
            }),
        }
    }

    /// Insert a swap post, overwriting the oldest entry once full.
    pub fn add(&self, swap: SwapPost) {
        let mut inner = self.inner.lock().unwrap();
        let next = inner.next;
        inner.slots[next] = Some(swap);
        inner.next = (next + 1) % RING_CAPACITY;
    }

    /// Snapshot the occupied slots as (slot index, entry) pairs.
    pub fn entries(&self) -> Vec<(usize, SwapPost)> {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|swap| (i, swap.clone())))
            .collect()
    }

    /// Clear a slot if it still holds the given entry.
    ///
    /// A slot overwritten between snapshot and eviction is left alone.
    pub fn evict(&self, index: usize, swap: &SwapPost) {
        let mut inner = self.inner.lock().unwrap();
        if inner.slots[index].as_ref() == Some(swap) {
            inner.slots[index] = None;
        }
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SwapRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::b256;

    fn post(txid: &str) -> SwapPost {
        SwapPost {
            txid: txid.to_string(),
            rpc_method: "swap.Swapin".to_string(),
            swap_server: "http://server".to_string(),
            chain: "ETH".to_string(),
            pair_id: "usdt".to_string(),
            chain_id: String::new(),
            log_index: String::new(),
        }
    }

    #[test]
    fn test_scanned_ring_dedup() {
        let mut ring = ScannedBlockRing::new();
        let h1 = b256!("1111111111111111111111111111111111111111111111111111111111111111");
        let h2 = b256!("2222222222222222222222222222222222222222222222222222222222222222");

        assert!(!ring.is_scanned(h1));
        ring.add_block(h1);
        assert!(ring.is_scanned(h1));
        assert!(!ring.is_scanned(h2));
    }

    #[test]
    fn test_scanned_ring_wraps() {
        let mut ring = ScannedBlockRing::new();
        let first = b256!("1111111111111111111111111111111111111111111111111111111111111111");
        ring.add_block(first);
        for i in 0..RING_CAPACITY as u64 {
            let mut bytes = [0u8; 32];
            bytes[24..].copy_from_slice(&i.to_be_bytes());
            ring.add_block(B256::from(bytes));
        }
        // The first hash was overwritten after a full wrap.
        assert!(!ring.is_scanned(first));
    }

    #[test]
    fn test_swap_ring_add_and_evict() {
        let ring = SwapRing::new();
        ring.add(post("0xaa"));
        ring.add(post("0xbb"));
        assert_eq!(ring.len(), 2);

        let entries = ring.entries();
        assert_eq!(entries.len(), 2);

        let (idx, swap) = entries[0].clone();
        ring.evict(idx, &swap);
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_swap_ring_evict_skips_overwritten_slot() {
        let ring = SwapRing::new();
        ring.add(post("0xaa"));
        let entries = ring.entries();
        let (idx, old) = entries[0].clone();

        // Wrap all the way around so slot 0 holds a different entry.
        for i in 0..RING_CAPACITY {
            ring.add(post(&format!("0x{:02x}", i)));
        }
        ring.evict(idx, &old);
        assert_eq!(ring.len(), RING_CAPACITY);
    }

    #[test]
    fn test_swap_ring_overwrites_oldest() {
        let ring = SwapRing::new();
        for i in 0..RING_CAPACITY + 5 {
            ring.add(post(&format!("0x{:03x}", i)));
        }
        assert_eq!(ring.len(), RING_CAPACITY);
        let txids: Vec<String> = ring.entries().into_iter().map(|(_, s)| s.txid).collect();
        // The first five entries were overwritten.
        assert!(!txids.contains(&"0x000".to_string()));
        assert!(txids.contains(&"0x068".to_string()));
    }
}
