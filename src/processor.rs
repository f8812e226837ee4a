/// Processor (SPEC_FULL.md §4.3) — atomically persists one block (and its
/// extracted transfers) behind a reorg guard, entirely through the `Store`
/// port. Carries no SQL of its own: schema and transport belong to the
/// out-of-scope production adapter.
use std::time::Duration;

use alloy_primitives::{Address, B256};
use num_bigint::BigUint;
use num_traits::Zero;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::IndexerError;
use crate::metrics;
use crate::store::Store;
use crate::types::{
    now_unix, ActivityType, BlockRecord, FetchedBlock, IndexEvent, RawLog, SyncCheckpoint,
    TransferRecord, SYNTHETIC_LOG_INDEX_BASE, TRANSFER_EVENT_TOPIC,
};

const REORG_RETRY_LADDER: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

pub struct ProcessorConfig {
    pub chain_id: u64,
    pub start_anchor: u64,
    pub checkpoint_batch: u64,
}

/// Tracks blocks processed since the last checkpoint upsert, owned
/// exclusively by the Processor loop (there is exactly one Processor
/// instance per chain, driven serially by the Sequencer's output).
pub struct CheckpointCounter {
    since_last: u64,
    batch: u64,
}

impl CheckpointCounter {
    pub fn new(batch: u64) -> Self {
        Self {
            since_last: 0,
            batch,
        }
    }

    /// Returns true if a checkpoint upsert is due: either the batch size was
    /// reached, or the caller declares this the end of a scheduled range.
    fn tick(&mut self, end_of_range: bool) -> bool {
        self.since_last += 1;
        if self.since_last >= self.batch || end_of_range {
            self.since_last = 0;
            true
        } else {
            false
        }
    }
}

pub struct Processor<S: Store> {
    store: S,
    config: ProcessorConfig,
    events: broadcast::Sender<IndexEvent>,
    checkpoints: CheckpointCounter,
}

impl<S: Store> Processor<S> {
    pub fn new(store: S, config: ProcessorConfig, events: broadcast::Sender<IndexEvent>) -> Self {
        let batch = config.checkpoint_batch;
        Self {
            store,
            config,
            events,
            checkpoints: CheckpointCounter::new(batch),
        }
    }

    /// One block, one transaction. `end_of_range` is set by the caller (the
    /// Fetcher's sub-batch scheduler) when this height closes a scheduled
    /// fetch range, forcing an early checkpoint regardless of batch count.
    pub async fn process_block(
        &mut self,
        block: &FetchedBlock,
        end_of_range: bool,
    ) -> Result<usize, IndexerError> {
        let start = std::time::Instant::now();
        let height = block.header.height;

        block.header.sanity_check(self.config.start_anchor)?;

        let mut tx = self.store.begin().await?;

        if height > 0 {
            if let Some(prev) = tx.get_block(height - 1).await? {
                if prev.hash != block.header.parent_hash {
                    return Err(IndexerError::Reorg { at: height });
                }
            }
            // Absent prior block and height > start_anchor: accepted as a
            // boundary case (e.g. a resumed sync with no local history yet).
        }

        tx.upsert_block(&block.header).await?;

        let mut transfers = extract_transfers(block);
        let synthesized = synthesize_activities(block, &transfers);
        transfers.extend(synthesized);

        for transfer in &transfers {
            tx.upsert_transfer(transfer).await?;
        }

        if self.checkpoints.tick(end_of_range) {
            let checkpoint = SyncCheckpoint {
                chain_id: self.config.chain_id,
                last_synced_block: height,
                updated_at: now_unix(),
            };
            tx.upsert_checkpoint(&checkpoint).await?;
        }

        tx.commit().await?;

        let transfer_count = transfers.len();
        let _ = self.events.send(IndexEvent::Block(block.header.clone()));
        if transfer_count > 0 {
            let _ = self.events.send(IndexEvent::Transfers {
                height,
                count: transfer_count,
            });
        }

        metrics::PROCESS_BLOCK_DURATION.observe(start.elapsed().as_secs_f64());
        let e2e = now_unix().saturating_sub(block.header.timestamp) as f64;
        metrics::PROCESS_E2E_LATENCY.observe(e2e.max(0.0));
        metrics::PROCESS_TRANSFERS_TOTAL.inc_by(transfer_count as u64);

        Ok(transfer_count)
    }

    /// Wraps `process_block` with the 1s/2s/4s retry ladder. `Reorg` and
    /// `Cancelled` are fatal and never retried.
    pub async fn process_block_with_retry(
        &mut self,
        block: &FetchedBlock,
        end_of_range: bool,
        max_retries: usize,
    ) -> Result<usize, IndexerError> {
        let mut attempt = 0;
        loop {
            match self.process_block(block, end_of_range).await {
                Ok(n) => return Ok(n),
                Err(err) if err.is_fatal_for_retry() => return Err(err),
                Err(err) if attempt < max_retries => {
                    let delay = REORG_RETRY_LADDER
                        .get(attempt)
                        .copied()
                        .unwrap_or(*REORG_RETRY_LADDER.last().unwrap());
                    warn!(height = block.header.height, attempt, %err, "process_block failed, retrying");
                    attempt += 1;
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Processes a contiguous run of blocks inside one transaction, verifying
    /// the parent-hash chain against the previous element in the slice (not
    /// just against the store). Any reorg aborts the whole batch.
    pub async fn process_batch(&mut self, blocks: &[FetchedBlock]) -> Result<usize, IndexerError> {
        let mut total_transfers = 0;
        for (i, block) in blocks.iter().enumerate() {
            if i > 0 {
                let prev = &blocks[i - 1];
                if block.header.parent_hash != prev.header.hash {
                    return Err(IndexerError::Reorg {
                        at: block.header.height,
                    });
                }
            }
            let end_of_range = i == blocks.len() - 1;
            total_transfers += self.process_block(block, end_of_range).await?;
        }
        info!(count = blocks.len(), total_transfers, "batch processed");
        Ok(total_transfers)
    }
}

/// Step 4: scan logs for `Transfer(address,address,uint256)` entries.
/// `topics[0]` must match the canonical hash and the log must carry at least
/// 3 topics (`from`, `to`); the amount is the 32-byte big-endian `data` word.
fn extract_transfers(block: &FetchedBlock) -> Vec<TransferRecord> {
    let mut out = Vec::new();
    for log in &block.logs {
        if log.topics.first() != Some(&TRANSFER_EVENT_TOPIC) || log.topics.len() < 3 {
            continue;
        }
        let from = topic_to_address(&log.topics[1]);
        let to = topic_to_address(&log.topics[2]);
        let amount = BigUint::from_bytes_be(&log.data);
        out.push(TransferRecord {
            height: block.header.height,
            tx_hash: log.tx_hash,
            log_index: log.log_index,
            from,
            to,
            amount,
            token_address: log.address,
            symbol: None,
            activity_type: ActivityType::Transfer,
        });
    }
    out
}

/// An address-as-topic is a 32-byte word with the address right-aligned in
/// the low 20 bytes.
fn topic_to_address(topic: &B256) -> Address {
    Address::from_slice(&topic.as_slice()[12..32])
}

/// Step 5: synthesize `DEPLOY` (contract creation: `to == None`) and
/// `ETH_TRANSFER` (plain value transfer whose tx-hash produced no log
/// transfer) activities. Synthetic log-indices start at
/// `SYNTHETIC_LOG_INDEX_BASE` and increment per block, so they never collide
/// with a real log's index within the same block.
fn synthesize_activities(block: &FetchedBlock, real_transfers: &[TransferRecord]) -> Vec<TransferRecord> {
    let seen_tx_hashes: std::collections::HashSet<B256> =
        real_transfers.iter().map(|t| t.tx_hash).collect();
    let mut out = Vec::new();
    let mut next_log_index = SYNTHETIC_LOG_INDEX_BASE;

    for txn in &block.transactions {
        let activity_type = if txn.to.is_none() {
            Some(ActivityType::Deploy)
        } else if !txn.value.is_zero() && !seen_tx_hashes.contains(&txn.tx_hash) {
            Some(ActivityType::EthTransfer)
        } else {
            None
        };

        if let Some(activity_type) = activity_type {
            out.push(TransferRecord {
                height: block.header.height,
                tx_hash: txn.tx_hash,
                log_index: next_log_index,
                from: txn.from,
                to: txn.to.unwrap_or(Address::ZERO),
                amount: txn.value.clone(),
                token_address: Address::ZERO,
                symbol: None,
                activity_type,
            });
            next_log_index += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::types::RawTransaction;

    fn header(height: u64, hash: u8, parent: u8) -> BlockRecord {
        BlockRecord {
            height,
            hash: B256::repeat_byte(hash),
            parent_hash: B256::repeat_byte(parent),
            timestamp: now_unix(),
            gas_limit: 0,
            gas_used: 0,
            base_fee: None,
            tx_count: 0,
        }
    }

    fn transfer_log(height: u64, log_index: u64, from: u8, to: u8, amount: u32) -> RawLog {
        let mut from_topic = [0u8; 32];
        from_topic[31] = from;
        let mut to_topic = [0u8; 32];
        to_topic[31] = to;
        RawLog {
            address: Address::repeat_byte(0xAA),
            topics: vec![TRANSFER_EVENT_TOPIC, B256::from(from_topic), B256::from(to_topic)],
            data: amount.to_be_bytes().to_vec(),
            log_index,
            tx_hash: B256::repeat_byte(height as u8),
        }
    }

    fn new_processor() -> Processor<InMemoryStore> {
        let (tx, _rx) = broadcast::channel(16);
        Processor::new(
            InMemoryStore::new(),
            ProcessorConfig {
                chain_id: 1,
                start_anchor: 0,
                checkpoint_batch: 100,
            },
            tx,
        )
    }

    #[tokio::test]
    async fn genesis_block_is_accepted_with_zero_parent() {
        let mut p = new_processor();
        let block = FetchedBlock {
            header: header(0, 1, 0),
            transactions: vec![],
            logs: vec![],
        };
        let result = p.process_block(&block, false).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn reorg_detected_when_parent_hash_mismatches_stored_block() {
        let mut p = new_processor();
        let b0 = FetchedBlock {
            header: BlockRecord {
                height: 0,
                hash: B256::repeat_byte(0xAA),
                parent_hash: B256::ZERO,
                timestamp: now_unix(),
                gas_limit: 0,
                gas_used: 0,
                base_fee: None,
                tx_count: 0,
            },
            transactions: vec![],
            logs: vec![],
        };
        p.process_block(&b0, false).await.unwrap();

        let b1 = FetchedBlock {
            header: BlockRecord {
                height: 1,
                hash: B256::repeat_byte(0xBB),
                parent_hash: B256::repeat_byte(0xCC), // does not match b0.hash
                timestamp: now_unix(),
                gas_limit: 0,
                gas_used: 0,
                base_fee: None,
                tx_count: 0,
            },
            transactions: vec![],
            logs: vec![],
        };
        let err = p.process_block(&b1, false).await.unwrap_err();
        assert!(matches!(err, IndexerError::Reorg { at: 1 }));
    }

    #[tokio::test]
    async fn extracts_transfer_from_matching_log() {
        let mut p = new_processor();
        let block = FetchedBlock {
            header: header(0, 1, 0),
            transactions: vec![],
            logs: vec![transfer_log(0, 0, 1, 2, 100)],
        };
        let count = p.process_block(&block, false).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn synthesizes_deploy_for_contract_creation() {
        let mut p = new_processor();
        let block = FetchedBlock {
            header: header(0, 1, 0),
            transactions: vec![RawTransaction {
                tx_hash: B256::repeat_byte(5),
                to: None,
                from: Address::repeat_byte(1),
                value: BigUint::from(0u32),
            }],
            logs: vec![],
        };
        let count = p.process_block(&block, false).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn synthesizes_eth_transfer_only_when_not_already_a_log_transfer() {
        let mut p = new_processor();
        let tx_hash = B256::repeat_byte(7);
        let block = FetchedBlock {
            header: header(0, 1, 0),
            transactions: vec![RawTransaction {
                tx_hash,
                to: Some(Address::repeat_byte(2)),
                from: Address::repeat_byte(1),
                value: BigUint::from(50u32),
            }],
            logs: vec![RawLog {
                address: Address::repeat_byte(0xAA),
                topics: vec![TRANSFER_EVENT_TOPIC, B256::repeat_byte(1), B256::repeat_byte(2)],
                data: 50u32.to_be_bytes().to_vec(),
                log_index: 0,
                tx_hash,
            }],
        };
        // tx_hash already produced a log transfer, so no ETH_TRANSFER should
        // be synthesized for it — only the one real transfer.
        let count = p.process_block(&block, false).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn checkpoint_upserts_every_batch() {
        let (tx, _rx) = broadcast::channel(16);
        let mut p = Processor::new(
            InMemoryStore::new(),
            ProcessorConfig {
                chain_id: 1,
                start_anchor: 0,
                checkpoint_batch: 2,
            },
            tx,
        );
        for h in 0..2u64 {
            let block = FetchedBlock {
                header: header(h, h as u8 + 1, h as u8),
                transactions: vec![],
                logs: vec![],
            };
            p.process_block(&block, false).await.unwrap();
        }
        let cp = p.store.get_checkpoint(1).await.unwrap().unwrap();
        assert_eq!(cp.last_synced_block, 1);
    }

    #[tokio::test]
    async fn process_batch_rejects_broken_parent_chain() {
        let mut p = new_processor();
        let b0 = FetchedBlock {
            header: header(0, 1, 0),
            transactions: vec![],
            logs: vec![],
        };
        let b1 = FetchedBlock {
            header: header(1, 2, 0xFF), // wrong parent
            transactions: vec![],
            logs: vec![],
        };
        let err = p.process_batch(&[b0, b1]).await.unwrap_err();
        assert!(matches!(err, IndexerError::Reorg { at: 1 }));
    }
}
