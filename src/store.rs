/// Store port (SPEC_FULL.md §6) — an external collaborator boundary.
///
/// Schema, migrations, and the connection pool belong to the production SQL
/// adapter, which is out of scope and not shipped. The core only ever depends
/// on the `Store`/`StoreTransaction` traits below, in the same
/// port-not-adapter style as `examples/other_examples/..ports-store.rs.rs`.
/// `InMemoryStore` is the in-memory adapter the integration tests drive
/// directly, and doubles as the `ephemeral`/local-dev fallback.
use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::types::{BlockRecord, SyncCheckpoint, SyncStatus, TransferRecord};

/// A single store transaction at read-committed isolation. Writes made
/// through a transaction are invisible to other readers until `commit` is
/// called; dropping without committing discards them.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Read the stored block at `height`, for the reorg check in Processor
    /// step 1. Sees the transaction's own uncommitted writes.
    async fn get_block(&mut self, height: u64) -> Result<Option<BlockRecord>, StoreError>;

    /// Upsert a block keyed by height; on conflict, overwrite all fields.
    async fn upsert_block(&mut self, block: &BlockRecord) -> Result<(), StoreError>;

    /// Insert a transfer; `ON CONFLICT (height, log_index) DO NOTHING`.
    async fn upsert_transfer(&mut self, transfer: &TransferRecord) -> Result<(), StoreError>;

    /// Delete all blocks (and cascade-delete their transfers) at `height >= from`.
    async fn delete_from_height(&mut self, from: u64) -> Result<(), StoreError>;

    /// Upsert the sync checkpoint to `max(current, checkpoint.last_synced_block)`.
    async fn upsert_checkpoint(&mut self, checkpoint: &SyncCheckpoint) -> Result<(), StoreError>;

    /// Force-write the checkpoint verbatim (watchdog heal / reorg rewrite),
    /// bypassing the monotonic `max(current, new)` upsert policy.
    async fn force_checkpoint(&mut self, checkpoint: &SyncCheckpoint) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;

    async fn get_checkpoint(&self, chain_id: u64) -> Result<Option<SyncCheckpoint>, StoreError>;

    async fn get_block(&self, height: u64) -> Result<Option<BlockRecord>, StoreError>;

    /// Bulk-insert path used by the AsyncWriter's batched flush.
    async fn bulk_insert(
        &self,
        blocks: &[BlockRecord],
        transfers: &[TransferRecord],
        checkpoint: &SyncCheckpoint,
    ) -> Result<(), StoreError>;

    /// Upsert the `sync_status` row for `status.chain_id`, overwriting it
    /// verbatim (unlike the checkpoint, this is a point-in-time snapshot, not
    /// a monotonic counter).
    async fn upsert_sync_status(&self, status: &SyncStatus) -> Result<(), StoreError>;
}

#[derive(Default)]
struct Tables {
    blocks: BTreeMap<u64, BlockRecord>,
    transfers: BTreeMap<(u64, u64), TransferRecord>,
    checkpoints: BTreeMap<u64, SyncCheckpoint>,
    sync_status: BTreeMap<u64, SyncStatus>,
}

fn apply_checkpoint_monotonic(tables: &mut Tables, checkpoint: &SyncCheckpoint) {
    let entry = tables
        .checkpoints
        .entry(checkpoint.chain_id)
        .or_insert_with(|| SyncCheckpoint {
            chain_id: checkpoint.chain_id,
            last_synced_block: 0,
            updated_at: checkpoint.updated_at,
        });
    if checkpoint.last_synced_block > entry.last_synced_block {
        entry.last_synced_block = checkpoint.last_synced_block;
        entry.updated_at = checkpoint.updated_at;
    }
}

/// Cheap to clone: clones share the same underlying table set, so the
/// Processor (which owns a `Store` by value) and the AsyncWriter/Watchdog
/// (which share one behind an `Arc`) can both hold a handle to one store.
#[derive(Clone)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
        }
    }

    pub async fn block_count(&self) -> usize {
        self.tables.lock().await.blocks.len()
    }

    pub async fn transfer_count(&self) -> usize {
        self.tables.lock().await.transfers.len()
    }

    pub async fn get_sync_status(&self, chain_id: u64) -> Option<SyncStatus> {
        self.tables.lock().await.sync_status.get(&chain_id).cloned()
    }
}

/// A pending set of writes against a cloned snapshot, applied to the shared
/// table set only on commit — this realizes "all-or-nothing" transactionality
/// the way `AtomicBatchWriter` does with one `WriteBatch`, adapted from
/// RocksDB column families to logical SQL tables guarded by a single async
/// mutex. Holds an `Arc` clone rather than a borrow so it satisfies
/// `Box<dyn StoreTransaction>`'s lack of a lifetime parameter.
struct InMemoryTransaction {
    tables: Arc<Mutex<Tables>>,
    snapshot_blocks: BTreeMap<u64, BlockRecord>,
    new_blocks: BTreeMap<u64, BlockRecord>,
    new_transfers: BTreeMap<(u64, u64), TransferRecord>,
    delete_from: Option<u64>,
    new_checkpoint: Option<SyncCheckpoint>,
    forced_checkpoint: Option<SyncCheckpoint>,
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn get_block(&mut self, height: u64) -> Result<Option<BlockRecord>, StoreError> {
        if let Some(b) = self.new_blocks.get(&height) {
            return Ok(Some(b.clone()));
        }
        if let Some(from) = self.delete_from {
            if height >= from {
                return Ok(None);
            }
        }
        Ok(self.snapshot_blocks.get(&height).cloned())
    }

    async fn upsert_block(&mut self, block: &BlockRecord) -> Result<(), StoreError> {
        self.new_blocks.insert(block.height, block.clone());
        Ok(())
    }

    async fn upsert_transfer(&mut self, transfer: &TransferRecord) -> Result<(), StoreError> {
        self.new_transfers
            .entry((transfer.height, transfer.log_index))
            .or_insert_with(|| transfer.clone());
        Ok(())
    }

    async fn delete_from_height(&mut self, from: u64) -> Result<(), StoreError> {
        self.delete_from = Some(match self.delete_from {
            Some(existing) => existing.min(from),
            None => from,
        });
        Ok(())
    }

    async fn upsert_checkpoint(&mut self, checkpoint: &SyncCheckpoint) -> Result<(), StoreError> {
        self.new_checkpoint = Some(checkpoint.clone());
        Ok(())
    }

    async fn force_checkpoint(&mut self, checkpoint: &SyncCheckpoint) -> Result<(), StoreError> {
        self.forced_checkpoint = Some(checkpoint.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(from) = self.delete_from {
            tables.blocks.retain(|&h, _| h < from);
            tables.transfers.retain(|&(h, _), _| h < from);
        }
        for (height, block) in self.new_blocks {
            tables.blocks.insert(height, block);
        }
        for (key, transfer) in self.new_transfers {
            tables.transfers.entry(key).or_insert(transfer);
        }
        if let Some(checkpoint) = self.new_checkpoint {
            apply_checkpoint_monotonic(&mut tables, &checkpoint);
        }
        if let Some(checkpoint) = self.forced_checkpoint {
            tables.checkpoints.insert(checkpoint.chain_id, checkpoint);
        }
        Ok(())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let snapshot_blocks = self.tables.lock().await.blocks.clone();
        Ok(Box::new(InMemoryTransaction {
            tables: Arc::clone(&self.tables),
            snapshot_blocks,
            new_blocks: BTreeMap::new(),
            new_transfers: BTreeMap::new(),
            delete_from: None,
            new_checkpoint: None,
            forced_checkpoint: None,
        }))
    }

    async fn get_checkpoint(&self, chain_id: u64) -> Result<Option<SyncCheckpoint>, StoreError> {
        Ok(self.tables.lock().await.checkpoints.get(&chain_id).cloned())
    }

    async fn get_block(&self, height: u64) -> Result<Option<BlockRecord>, StoreError> {
        Ok(self.tables.lock().await.blocks.get(&height).cloned())
    }

    async fn bulk_insert(
        &self,
        blocks: &[BlockRecord],
        transfers: &[TransferRecord],
        checkpoint: &SyncCheckpoint,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        for block in blocks {
            tables.blocks.insert(block.height, block.clone());
        }
        for transfer in transfers {
            tables
                .transfers
                .entry((transfer.height, transfer.log_index))
                .or_insert_with(|| transfer.clone());
        }
        apply_checkpoint_monotonic(&mut tables, checkpoint);
        Ok(())
    }

    async fn upsert_sync_status(&self, status: &SyncStatus) -> Result<(), StoreError> {
        self.tables
            .lock()
            .await
            .sync_status
            .insert(status.chain_id, status.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, B256};
    use num_bigint::BigUint;

    fn block(height: u64) -> BlockRecord {
        BlockRecord {
            height,
            hash: B256::repeat_byte(height as u8 + 1),
            parent_hash: if height == 0 {
                B256::ZERO
            } else {
                B256::repeat_byte(height as u8)
            },
            timestamp: 0,
            gas_limit: 0,
            gas_used: 0,
            base_fee: None,
            tx_count: 0,
        }
    }

    fn transfer(height: u64, log_index: u64) -> TransferRecord {
        TransferRecord {
            height,
            tx_hash: B256::repeat_byte(9),
            log_index,
            from: Address::repeat_byte(1),
            to: Address::repeat_byte(2),
            amount: BigUint::from(100u32),
            token_address: Address::repeat_byte(3),
            symbol: None,
            activity_type: crate::types::ActivityType::Transfer,
        }
    }

    fn checkpoint(height: u64) -> SyncCheckpoint {
        SyncCheckpoint {
            chain_id: 1,
            last_synced_block: height,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn bulk_insert_is_idempotent_for_checkpoint() {
        let store = InMemoryStore::new();
        store.bulk_insert(&[block(10)], &[], &checkpoint(10)).await.unwrap();
        store.bulk_insert(&[block(10)], &[], &checkpoint(10)).await.unwrap();
        assert_eq!(store.get_checkpoint(1).await.unwrap().unwrap().last_synced_block, 10);
        assert_eq!(store.block_count().await, 1);
    }

    #[tokio::test]
    async fn bulk_insert_checkpoint_never_decreases() {
        let store = InMemoryStore::new();
        store.bulk_insert(&[], &[], &checkpoint(100)).await.unwrap();
        store.bulk_insert(&[], &[], &checkpoint(50)).await.unwrap();
        assert_eq!(store.get_checkpoint(1).await.unwrap().unwrap().last_synced_block, 100);
    }

    #[tokio::test]
    async fn transfer_upsert_ignores_duplicate_key() {
        let store = InMemoryStore::new();
        let t = transfer(5, 0);
        let mut other = t.clone();
        other.amount = BigUint::from(999u32);
        store
            .bulk_insert(&[], &[t.clone(), other], &checkpoint(0))
            .await
            .unwrap();
        assert_eq!(store.transfer_count().await, 1);
    }

    #[tokio::test]
    async fn transaction_writes_are_invisible_until_commit() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.upsert_block(&block(3)).await.unwrap();
        assert_eq!(store.block_count().await, 0);
        tx.commit().await.unwrap();
        assert_eq!(store.block_count().await, 1);
    }

    #[tokio::test]
    async fn dropped_transaction_discards_writes() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.upsert_block(&block(3)).await.unwrap();
        drop(tx);
        assert_eq!(store.block_count().await, 0);
    }

    #[tokio::test]
    async fn delete_from_height_cascades_to_transfers() {
        let store = InMemoryStore::new();
        store
            .bulk_insert(&[block(1), block(2), block(3)], &[transfer(2, 0), transfer(3, 0)], &checkpoint(3))
            .await
            .unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.delete_from_height(2).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.block_count().await, 1);
        assert_eq!(store.transfer_count().await, 0);
    }

    #[tokio::test]
    async fn get_block_within_transaction_sees_own_writes() {
        let store = InMemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.upsert_block(&block(7)).await.unwrap();
        let seen = tx.get_block(7).await.unwrap();
        assert_eq!(seen.unwrap().height, 7);
    }

    #[tokio::test]
    async fn force_checkpoint_overrides_monotonic_policy() {
        let store = InMemoryStore::new();
        store.bulk_insert(&[], &[], &checkpoint(100)).await.unwrap();
        let mut tx = store.begin().await.unwrap();
        tx.force_checkpoint(&checkpoint(40)).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.get_checkpoint(1).await.unwrap().unwrap().last_synced_block, 40);
    }

    #[tokio::test]
    async fn upsert_sync_status_overwrites_by_chain_id() {
        let store = InMemoryStore::new();
        let status = SyncStatus {
            chain_id: 1,
            last_synced_block: 10,
            latest_block: 10,
            sync_lag: 0,
            status: crate::types::SystemState::Running,
            timestamp: 100,
        };
        store.upsert_sync_status(&status).await.unwrap();
        assert_eq!(store.get_sync_status(1).await.unwrap().last_synced_block, 10);

        let later = SyncStatus {
            last_synced_block: 20,
            timestamp: 200,
            ..status
        };
        store.upsert_sync_status(&later).await.unwrap();
        assert_eq!(store.get_sync_status(1).await.unwrap().last_synced_block, 20);
    }
}
