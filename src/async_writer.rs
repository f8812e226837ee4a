/// AsyncWriter (SPEC_FULL.md §4.4) — the optional high-throughput path:
/// batches `PersistTask`s and flushes them to the store by size or by timer,
/// whichever comes first.
///
/// Buffer-then-flush shape is grounded in `atomic_writer.rs`'s
/// `AtomicBatchWriter` (`should_flush`/`flush`/`clear`), generalized from an
/// explicit caller-driven `flush()` call to a `tokio::select!` loop that
/// fires on a timer as well as on size, and from one RocksDB `WriteBatch`
/// to `Store::bulk_insert`.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics;
use crate::orchestrator::OrchestratorCmd;
use crate::store::Store;
use crate::types::{
    now_unix, BlockRecord, PersistTask, SyncCheckpoint, SyncStatus, SystemState, TransferRecord,
};

pub struct AsyncWriterConfig {
    pub chain_id: u64,
    pub capacity: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub shed_high_water_pct: f64,
    pub shed_low_water_pct: f64,
    pub shed_cooldown: Duration,
    /// Local-dev/`ephemeral` profile: skip the store write entirely, only
    /// advance the watermark and the Orchestrator's cursor.
    pub ephemeral: bool,
}

impl Default for AsyncWriterConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            capacity: 15_000,
            batch_size: 200,
            flush_interval: Duration::from_millis(500),
            shed_high_water_pct: 0.75,
            shed_low_water_pct: 0.50,
            shed_cooldown: Duration::from_secs(45),
            ephemeral: false,
        }
    }
}

/// A height range whose payload was discarded by emergency shedding. Exposed
/// to the Watchdog (§9 Open Question 2 decision): a shed range still missing
/// from the store is just an ordinary space-time-tear candidate, re-fetched
/// through the same healing path as any other gap.
#[derive(Debug, Clone, Copy)]
pub struct ShedRange {
    pub from: u64,
    pub to: u64,
}

const SHED_RING_CAPACITY: usize = 64;

pub struct AsyncWriter<S: Store> {
    store: Arc<S>,
    config: AsyncWriterConfig,
    orchestrator_tx: mpsc::Sender<OrchestratorCmd>,
    disk_watermark: Arc<AtomicU64>,
    shed_ring: VecDeque<ShedRange>,
    /// Mirrors the Orchestrator's own state transitions around a shed, so the
    /// `sync_status` row reflects `Degraded` while emergency shedding runs.
    current_state: SystemState,
}

impl<S: Store> AsyncWriter<S> {
    pub fn new(
        store: Arc<S>,
        config: AsyncWriterConfig,
        orchestrator_tx: mpsc::Sender<OrchestratorCmd>,
    ) -> Self {
        Self {
            store,
            config,
            orchestrator_tx,
            disk_watermark: Arc::new(AtomicU64::new(0)),
            shed_ring: VecDeque::with_capacity(SHED_RING_CAPACITY),
            current_state: SystemState::Running,
        }
    }

    pub fn disk_watermark_handle(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.disk_watermark)
    }

    pub fn shed_ranges(&self) -> Vec<ShedRange> {
        self.shed_ring.iter().copied().collect()
    }

    pub async fn run(
        mut self,
        mut task_rx: mpsc::Receiver<PersistTask>,
        cancel: CancellationToken,
    ) {
        let mut buffer: Vec<PersistTask> = Vec::with_capacity(self.config.batch_size);
        let mut ticker = interval(self.config.flush_interval);
        let mut cooldown_until: Option<Instant> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    if !buffer.is_empty() {
                        self.flush(std::mem::take(&mut buffer)).await;
                    }
                    info!("async writer cancelled, flushed remaining buffer");
                    break;
                }
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        self.flush(std::mem::take(&mut buffer)).await;
                    }
                }
                item = task_rx.recv() => {
                    match item {
                        None => {
                            if !buffer.is_empty() {
                                self.flush(std::mem::take(&mut buffer)).await;
                            }
                            info!("task channel closed, async writer draining");
                            break;
                        }
                        Some(task) => {
                            let high_water = (self.config.capacity as f64 * self.config.shed_high_water_pct) as usize;
                            let in_cooldown = cooldown_until.map(|t| Instant::now() < t).unwrap_or(false);
                            if !in_cooldown && task_rx.len() + 1 > high_water {
                                self.emergency_drain(task, &mut task_rx).await;
                                cooldown_until = Some(Instant::now() + self.config.shed_cooldown);
                                continue;
                            }
                            buffer.push(task);
                            if buffer.len() >= self.config.batch_size {
                                self.flush(std::mem::take(&mut buffer)).await;
                            }
                        }
                    }
                }
            }
            metrics::ASYNC_WRITER_QUEUE_DEPTH.set(task_rx.len() as i64);
        }
    }

    async fn flush(&mut self, batch: Vec<PersistTask>) {
        let Some(max_height) = batch.iter().map(|t| t.height).max() else {
            return;
        };
        let mut blocks: Vec<BlockRecord> = Vec::with_capacity(batch.len());
        let mut transfers: Vec<TransferRecord> = Vec::new();
        for task in batch {
            blocks.push(task.block);
            transfers.extend(task.transfers);
        }

        if !self.config.ephemeral {
            let checkpoint = SyncCheckpoint {
                chain_id: self.config.chain_id,
                last_synced_block: max_height,
                updated_at: now_unix(),
            };
            if let Err(err) = self.store.bulk_insert(&blocks, &transfers, &checkpoint).await {
                warn!(%err, "async writer flush failed, batch dropped");
                metrics::ASYNC_WRITER_FLUSH_ERRORS_TOTAL.inc();
                return;
            }

            // The AsyncWriter has no independent view of the chain head, so
            // `latest_block` tracks what it just persisted and `sync_lag` is
            // 0 here; the Watchdog is the component that actually knows how
            // far behind the head the store is.
            let status = SyncStatus {
                chain_id: self.config.chain_id,
                last_synced_block: max_height,
                latest_block: max_height,
                sync_lag: 0,
                status: self.current_state,
                timestamp: now_unix(),
            };
            if let Err(err) = self.store.upsert_sync_status(&status).await {
                warn!(%err, "async writer failed to upsert sync status");
                metrics::ASYNC_WRITER_FLUSH_ERRORS_TOTAL.inc();
            }
        }

        self.disk_watermark.fetch_max(max_height, Ordering::AcqRel);
        metrics::ASYNC_WRITER_FLUSHES_TOTAL.inc();
        let _ = self
            .orchestrator_tx
            .send(OrchestratorCmd::CommitDisk(max_height))
            .await;
    }

    /// Emergency shedding: drain the channel (recording height activity but
    /// discarding payloads) until depth falls to the low-water mark, then
    /// publish the highest observed height so the Orchestrator's cursor
    /// still advances.
    async fn emergency_drain(&mut self, first: PersistTask, task_rx: &mut mpsc::Receiver<PersistTask>) {
        let low_water = (self.config.capacity as f64 * self.config.shed_low_water_pct) as usize;
        let from = first.height;
        let mut highest = first.height;
        warn!(depth = task_rx.len(), "entering emergency shed");
        self.current_state = SystemState::Degraded;
        let _ = self
            .orchestrator_tx
            .send(OrchestratorCmd::SetSystemState(SystemState::Degraded))
            .await;

        while task_rx.len() > low_water {
            match task_rx.recv().await {
                Some(task) => highest = highest.max(task.height),
                None => break,
            }
        }

        if self.shed_ring.len() >= SHED_RING_CAPACITY {
            self.shed_ring.pop_front();
        }
        self.shed_ring.push_back(ShedRange { from, to: highest });
        metrics::ASYNC_WRITER_SHEDS_TOTAL.inc();

        self.disk_watermark.fetch_max(highest, Ordering::AcqRel);
        let _ = self
            .orchestrator_tx
            .send(OrchestratorCmd::CommitDisk(highest))
            .await;
        self.current_state = SystemState::Running;
        let _ = self
            .orchestrator_tx
            .send(OrchestratorCmd::SetSystemState(SystemState::Running))
            .await;
        warn!(from, to = highest, "emergency shed complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use alloy_primitives::B256;

    fn task(height: u64) -> PersistTask {
        PersistTask {
            height,
            block: BlockRecord {
                height,
                hash: B256::repeat_byte(height as u8 + 1),
                parent_hash: B256::repeat_byte(height as u8),
                timestamp: now_unix(),
                gas_limit: 0,
                gas_used: 0,
                base_fee: None,
                tx_count: 0,
            },
            transfers: vec![],
            sequence: height,
        }
    }

    #[tokio::test]
    async fn flush_on_batch_size_persists_and_advances_watermark() {
        let store = Arc::new(InMemoryStore::new());
        let (orch_tx, mut orch_rx) = mpsc::channel(16);
        let config = AsyncWriterConfig {
            chain_id: 1,
            batch_size: 2,
            flush_interval: Duration::from_secs(3600),
            ..AsyncWriterConfig::default()
        };
        let writer = AsyncWriter::new(Arc::clone(&store), config, orch_tx);
        let watermark = writer.disk_watermark_handle();
        let (task_tx, task_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(writer.run(task_rx, cancel.clone()));

        task_tx.send(task(1)).await.unwrap();
        task_tx.send(task(2)).await.unwrap();

        let cmd = orch_rx.recv().await.unwrap();
        assert!(matches!(cmd, OrchestratorCmd::CommitDisk(2)));
        assert_eq!(watermark.load(Ordering::Acquire), 2);
        assert_eq!(store.block_count().await, 2);

        let status = store.get_sync_status(1).await.unwrap();
        assert_eq!(status.last_synced_block, 2);
        assert_eq!(status.latest_block, 2);
        assert_eq!(status.status, SystemState::Running);

        cancel.cancel();
        drop(task_tx);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn ephemeral_mode_skips_store_write() {
        let store = Arc::new(InMemoryStore::new());
        let (orch_tx, mut orch_rx) = mpsc::channel(16);
        let config = AsyncWriterConfig {
            chain_id: 1,
            batch_size: 1,
            flush_interval: Duration::from_secs(3600),
            ephemeral: true,
            ..AsyncWriterConfig::default()
        };
        let writer = AsyncWriter::new(Arc::clone(&store), config, orch_tx);
        let (task_tx, task_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(writer.run(task_rx, cancel.clone()));

        task_tx.send(task(5)).await.unwrap();
        let cmd = orch_rx.recv().await.unwrap();
        assert!(matches!(cmd, OrchestratorCmd::CommitDisk(5)));
        assert_eq!(store.block_count().await, 0);

        cancel.cancel();
        drop(task_tx);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn flush_on_timer_when_batch_below_size() {
        let store = Arc::new(InMemoryStore::new());
        let (orch_tx, mut orch_rx) = mpsc::channel(16);
        let config = AsyncWriterConfig {
            chain_id: 1,
            batch_size: 100,
            flush_interval: Duration::from_millis(20),
            ..AsyncWriterConfig::default()
        };
        let writer = AsyncWriter::new(Arc::clone(&store), config, orch_tx);
        let (task_tx, task_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(writer.run(task_rx, cancel.clone()));

        task_tx.send(task(9)).await.unwrap();
        let cmd = orch_rx.recv().await.unwrap();
        assert!(matches!(cmd, OrchestratorCmd::CommitDisk(9)));

        cancel.cancel();
        drop(task_tx);
        let _ = handle.await;
    }
}
