/// Shared data model for the ingestion pipeline.
///
/// Heights travel through the pipeline as native `u64`; they are rendered to
/// canonical decimal text only at the `Store` boundary (see `store.rs`), so the
/// core never risks silent 64-bit truncation while still doing its arithmetic in
/// native width.
use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use alloy_primitives::{Address, B256};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

/// The fixed Keccak-256 topic hash of `Transfer(address,address,uint256)`.
///
/// Per SPEC_FULL.md §9 Open Question 1: the canonical value ends in `0afda6`.
/// A second value ending in `b3ef` appeared in the source repository and is a
/// typo; it is never defined here.
pub const TRANSFER_EVENT_TOPIC: B256 = B256::new([
    0xdd, 0xf2, 0x52, 0xad, 0x1b, 0xe2, 0xc8, 0x9b, 0x69, 0xc2, 0xb0, 0x68, 0xfc, 0x37, 0x8d, 0xaa,
    0x95, 0x2b, 0xa7, 0xf1, 0x63, 0xc4, 0xa1, 0x16, 0x28, 0xf5, 0x51, 0x4c, 0xfc, 0x0a, 0xfd, 0xa6,
]);

/// Synthetic activities (DEPLOY, ETH_TRANSFER) use log-indices at or above this
/// value so they never collide with a real log's index within the same block.
pub const SYNTHETIC_LOG_INDEX_BASE: u64 = 20_000;

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A persisted block header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub height: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub base_fee: Option<u128>,
    pub tx_count: u32,
}

impl BlockRecord {
    /// `hash != parent_hash`, and a zero parent hash is only valid at genesis.
    pub fn sanity_check(&self, start_anchor: u64) -> Result<(), crate::error::IndexerError> {
        if self.hash == self.parent_hash {
            return Err(crate::error::IndexerError::InvalidBlock {
                height: self.height,
                reason: "hash equals parent_hash".into(),
            });
        }
        if self.parent_hash == B256::ZERO && self.height != start_anchor {
            return Err(crate::error::IndexerError::InvalidBlock {
                height: self.height,
                reason: "zero parent_hash outside genesis".into(),
            });
        }
        Ok(())
    }
}

/// The kind of activity a transfer row represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityType {
    Transfer,
    Deploy,
    EthTransfer,
    Approve,
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActivityType::Transfer => "TRANSFER",
            ActivityType::Deploy => "DEPLOY",
            ActivityType::EthTransfer => "ETH_TRANSFER",
            ActivityType::Approve => "APPROVE",
        };
        write!(f, "{s}")
    }
}

/// One indexed ERC-20-style transfer, or a synthesized activity (deploy /
/// plain-ETH transfer) that the Processor derives from the transaction list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    pub height: u64,
    pub tx_hash: B256,
    pub log_index: u64,
    pub from: Address,
    pub to: Address,
    #[serde(with = "biguint_decimal")]
    pub amount: BigUint,
    pub token_address: Address,
    pub symbol: Option<String>,
    pub activity_type: ActivityType,
}

/// (De)serialize `BigUint` as decimal text, matching the canonical-decimal-text
/// storage rule for 256-bit amounts at the store boundary.
mod biguint_decimal {
    use num_bigint::BigUint;
    use num_traits::Num;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &BigUint, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_str_radix(10))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<BigUint, D::Error> {
        let text = String::deserialize(d)?;
        BigUint::from_str_radix(&text, 10).map_err(serde::de::Error::custom)
    }
}

/// Monotonic sync-progress marker for one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCheckpoint {
    pub chain_id: u64,
    pub last_synced_block: u64,
    pub updated_at: u64,
}

/// Row the AsyncWriter upserts alongside the checkpoint on every flush: a
/// point-in-time read of how far behind the chain head the store is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub chain_id: u64,
    pub last_synced_block: u64,
    pub latest_block: u64,
    pub sync_lag: u64,
    pub status: SystemState,
    pub timestamp: u64,
}

/// Lifecycle states of the Orchestrator's `CoordinatorState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemState {
    Unknown,
    Idle,
    Running,
    CatchingUp,
    Optimizing,
    Throttled,
    Degraded,
    Healing,
    Stalled,
}

impl Default for SystemState {
    fn default() -> Self {
        SystemState::Unknown
    }
}

/// The canonical, single-writer global state. Only the Orchestrator actor ever
/// mutates a live value of this type; everyone else sees a `CoordinatorSnapshot`.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorState {
    pub latest_height: u64,
    pub target_height: u64,
    pub fetched_height: u64,
    pub synced_cursor: u64,
    pub safety_buffer: u32,
    pub success_count: u64,
    pub transfers: u64,
    pub system_state: SystemState,
    pub is_eco_mode: bool,
    pub progress_pct: f64,
    pub jobs_depth: usize,
    pub results_depth: usize,
    pub updated_at: u64,
    pub last_user_activity: u64,
    pub log_entry: Option<String>,
}

impl CoordinatorState {
    pub const SAFETY_BUFFER_MIN: u32 = 1;
    pub const SAFETY_BUFFER_MAX: u32 = 20;

    /// Recompute `progress_pct`, clamped to `[0, 100]`.
    pub fn recompute_progress(&mut self) {
        self.progress_pct = if self.latest_height == 0 {
            0.0
        } else {
            (self.synced_cursor as f64 / self.latest_height as f64 * 100.0).clamp(0.0, 100.0)
        };
    }

    /// The reported gap between chain head and the durable cursor.
    pub fn sync_lag(&self) -> u64 {
        self.latest_height.saturating_sub(self.synced_cursor)
    }

    /// §8 invariant 1: `SyncedCursor <= FetchedHeight <= LatestHeight`.
    pub fn ordering_invariant_holds(&self) -> bool {
        self.synced_cursor <= self.fetched_height && self.fetched_height <= self.latest_height
    }

    pub fn to_snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            latest_height: self.latest_height,
            target_height: self.target_height,
            fetched_height: self.fetched_height,
            synced_cursor: self.synced_cursor,
            safety_buffer: self.safety_buffer,
            transfers: self.transfers,
            system_state: self.system_state,
            is_eco_mode: self.is_eco_mode,
            progress_pct: self.progress_pct,
            sync_lag: self.sync_lag(),
            jobs_depth: self.jobs_depth,
            results_depth: self.results_depth,
            updated_at: self.updated_at,
        }
    }
}

/// Read-only view of `CoordinatorState` published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorSnapshot {
    pub latest_height: u64,
    pub target_height: u64,
    pub fetched_height: u64,
    pub synced_cursor: u64,
    pub safety_buffer: u32,
    pub transfers: u64,
    pub system_state: SystemState,
    pub is_eco_mode: bool,
    pub progress_pct: f64,
    pub sync_lag: u64,
    pub jobs_depth: usize,
    pub results_depth: usize,
    pub updated_at: u64,
}

/// One decoded RPC log entry, pre-filtering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Vec<u8>,
    pub log_index: u64,
    pub tx_hash: B256,
}

/// A transaction as needed for synthetic-activity derivation (§4.3 step 5).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransaction {
    pub tx_hash: B256,
    pub to: Option<Address>,
    pub from: Address,
    pub value: BigUint,
}

/// A fetched block: header, transactions, and the logs matching the Transfer
/// topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBlock {
    pub header: BlockRecord,
    pub transactions: Vec<RawTransaction>,
    pub logs: Vec<RawLog>,
}

/// In-flight unit produced by a Fetcher worker and consumed exactly once by
/// the Sequencer. Carries either a concrete block, a pure range-progress
/// marker, or an error.
#[derive(Debug, Clone)]
pub enum BlockData {
    Block {
        height: u64,
        block: FetchedBlock,
    },
    /// A range-progress marker: no block, just "we've scanned up through here".
    RangeProgress { range_end: u64 },
    Error {
        height: u64,
        error: crate::error::IndexerError,
    },
}

impl BlockData {
    pub fn height(&self) -> Option<u64> {
        match self {
            BlockData::Block { height, .. } => Some(*height),
            BlockData::Error { height, .. } => Some(*height),
            BlockData::RangeProgress { .. } => None,
        }
    }
}

/// In-flight unit produced by the Processor and consumed by the AsyncWriter.
#[derive(Debug, Clone)]
pub struct PersistTask {
    pub height: u64,
    pub block: BlockRecord,
    pub transfers: Vec<TransferRecord>,
    pub sequence: u64,
}

/// Post-commit event published by the Processor for observers. The
/// HTTP/WebSocket surface that would relay this externally is out of scope;
/// this type is the internal publish-side contract only.
#[derive(Debug, Clone)]
pub enum IndexEvent {
    Block(BlockRecord),
    Transfers { height: u64, count: usize },
}

/// Emitted once per watchdog heal attempt.
#[derive(Debug, Clone)]
pub struct HealingEvent {
    pub trigger_reason: String,
    pub db_watermark: u64,
    pub rpc_height: u64,
    pub gap_size: u64,
    pub success: bool,
    pub error: Option<String>,
}

/// Emitted once per detected reorg, consumed by the external deep-reorg
/// resolver and by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReorgEvent {
    pub at: u64,
}

/// Bundles named topic hashes a component might need to look up by name.
pub type Topics = HashMap<&'static str, B256>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_event_topic_is_canonical() {
        let hex = format!("{:#x}", TRANSFER_EVENT_TOPIC);
        assert!(hex.ends_with("0afda6"));
    }

    #[test]
    fn progress_clamped_to_100() {
        let mut s = CoordinatorState {
            latest_height: 100,
            synced_cursor: 150, // shouldn't happen, but clamp must hold anyway
            ..Default::default()
        };
        s.recompute_progress();
        assert!(s.progress_pct <= 100.0);
    }

    #[test]
    fn progress_zero_when_no_chain_head() {
        let mut s = CoordinatorState::default();
        s.recompute_progress();
        assert_eq!(s.progress_pct, 0.0);
    }

    #[test]
    fn sync_lag_is_gap_to_head() {
        let s = CoordinatorState {
            latest_height: 100,
            synced_cursor: 80,
            ..Default::default()
        };
        assert_eq!(s.sync_lag(), 20);
    }

    #[test]
    fn ordering_invariant_detects_violation() {
        let s = CoordinatorState {
            latest_height: 100,
            fetched_height: 50,
            synced_cursor: 60,
            ..Default::default()
        };
        assert!(!s.ordering_invariant_holds());
    }

    #[test]
    fn block_sanity_rejects_self_parent() {
        let b = BlockRecord {
            height: 5,
            hash: B256::repeat_byte(1),
            parent_hash: B256::repeat_byte(1),
            timestamp: 0,
            gas_limit: 0,
            gas_used: 0,
            base_fee: None,
            tx_count: 0,
        };
        assert!(b.sanity_check(0).is_err());
    }

    #[test]
    fn block_sanity_allows_zero_parent_at_genesis() {
        let b = BlockRecord {
            height: 0,
            hash: B256::repeat_byte(1),
            parent_hash: B256::ZERO,
            timestamp: 0,
            gas_limit: 0,
            gas_used: 0,
            base_fee: None,
            tx_count: 0,
        };
        assert!(b.sanity_check(0).is_ok());
    }

    #[test]
    fn block_sanity_rejects_zero_parent_off_genesis() {
        let b = BlockRecord {
            height: 5,
            hash: B256::repeat_byte(1),
            parent_hash: B256::ZERO,
            timestamp: 0,
            gas_limit: 0,
            gas_used: 0,
            base_fee: None,
            tx_count: 0,
        };
        assert!(b.sanity_check(0).is_err());
    }
}
