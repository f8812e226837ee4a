/// RPC client port (SPEC_FULL.md §6) — an external collaborator boundary.
///
/// Rate limiting, node-pool failover, and health checks belong to the
/// production adapter, which is out of scope and not shipped. The core only
/// ever depends on the `RpcClient` trait below; `MockRpcClient` is the
/// in-memory adapter the integration tests in `sequencer.rs`/`fetcher.rs`/
/// `watchdog.rs` drive directly.
use std::collections::BTreeMap;
use std::sync::Mutex;

use alloy_primitives::{Address, B256};
use async_trait::async_trait;

use crate::error::RpcError;
use crate::types::{FetchedBlock, RawLog};

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
    pub topics: Vec<B256>,
    pub addresses: Vec<Address>,
}

#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn block_by_number(&self, height: u64) -> Result<FetchedBlock, RpcError>;
    async fn header_by_number(&self, height: u64) -> Result<crate::types::BlockRecord, RpcError>;
    async fn filter_logs(&self, filter: LogFilter) -> Result<Vec<RawLog>, RpcError>;
    async fn latest_block_number(&self) -> Result<u64, RpcError>;
    async fn healthy_node_count(&self) -> u32;
    async fn total_node_count(&self) -> u32;
}

/// Broad classification of RPC failures, mirroring the error-kind split a
/// Fetcher worker needs to pick its backoff ladder (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorKind {
    Transient,
    RateLimited,
    NotFound,
}

pub fn classify_rpc_error(err: &RpcError) -> RpcErrorKind {
    match err {
        RpcError::Transient(_) => RpcErrorKind::Transient,
        RpcError::RateLimited(_) => RpcErrorKind::RateLimited,
        RpcError::NotFound(_) => RpcErrorKind::NotFound,
    }
}

/// In-memory RPC adapter for tests and the `ephemeral`/local-dev profile.
/// Blocks are pre-seeded by height; missing heights are reported as
/// `NotFound` so Fetcher's ghost-chase defense and retry ladder can be
/// exercised deterministically.
#[derive(Default)]
pub struct MockRpcClient {
    blocks: Mutex<BTreeMap<u64, FetchedBlock>>,
    latest: Mutex<u64>,
    /// Heights that should fail with a transient error on the next call only.
    fail_once: Mutex<BTreeMap<u64, RpcErrorKind>>,
}

impl MockRpcClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_block(&self, block: FetchedBlock) {
        let height = block.header.height;
        self.blocks.lock().unwrap().insert(height, block);
        let mut latest = self.latest.lock().unwrap();
        *latest = (*latest).max(height);
    }

    pub fn set_latest(&self, height: u64) {
        *self.latest.lock().unwrap() = height;
    }

    pub fn fail_once_at(&self, height: u64, kind: RpcErrorKind) {
        self.fail_once.lock().unwrap().insert(height, kind);
    }

    fn take_scheduled_failure(&self, height: u64) -> Option<RpcErrorKind> {
        self.fail_once.lock().unwrap().remove(&height)
    }
}

#[async_trait]
impl RpcClient for MockRpcClient {
    async fn block_by_number(&self, height: u64) -> Result<FetchedBlock, RpcError> {
        if let Some(kind) = self.take_scheduled_failure(height) {
            return Err(match kind {
                RpcErrorKind::Transient => RpcError::Transient("mock transient".into()),
                RpcErrorKind::RateLimited => RpcError::RateLimited("mock rate limit".into()),
                RpcErrorKind::NotFound => RpcError::NotFound(height),
            });
        }
        self.blocks
            .lock()
            .unwrap()
            .get(&height)
            .cloned()
            .ok_or(RpcError::NotFound(height))
    }

    async fn header_by_number(&self, height: u64) -> Result<crate::types::BlockRecord, RpcError> {
        self.block_by_number(height).await.map(|b| b.header)
    }

    async fn filter_logs(&self, filter: LogFilter) -> Result<Vec<RawLog>, RpcError> {
        let blocks = self.blocks.lock().unwrap();
        let mut out = Vec::new();
        for (&height, block) in blocks.range(filter.from_block..=filter.to_block) {
            let _ = height;
            for log in &block.logs {
                if filter.topics.is_empty() || filter.topics.contains(&log.topics[0]) {
                    if filter.addresses.is_empty() || filter.addresses.contains(&log.address) {
                        out.push(log.clone());
                    }
                }
            }
        }
        Ok(out)
    }

    async fn latest_block_number(&self) -> Result<u64, RpcError> {
        Ok(*self.latest.lock().unwrap())
    }

    async fn healthy_node_count(&self) -> u32 {
        1
    }

    async fn total_node_count(&self) -> u32 {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BlockRecord;

    fn header(height: u64) -> BlockRecord {
        BlockRecord {
            height,
            hash: B256::repeat_byte(height as u8 + 1),
            parent_hash: B256::repeat_byte(height as u8),
            timestamp: 0,
            gas_limit: 0,
            gas_used: 0,
            base_fee: None,
            tx_count: 0,
        }
    }

    #[tokio::test]
    async fn not_found_for_unseeded_height() {
        let client = MockRpcClient::new();
        let err = client.block_by_number(5).await.unwrap_err();
        assert!(matches!(err, RpcError::NotFound(5)));
    }

    #[tokio::test]
    async fn seeded_block_is_returned() {
        let client = MockRpcClient::new();
        client.seed_block(FetchedBlock {
            header: header(5),
            transactions: vec![],
            logs: vec![],
        });
        let b = client.block_by_number(5).await.unwrap();
        assert_eq!(b.header.height, 5);
    }

    #[tokio::test]
    async fn scheduled_failure_fires_once() {
        let client = MockRpcClient::new();
        client.seed_block(FetchedBlock {
            header: header(5),
            transactions: vec![],
            logs: vec![],
        });
        client.fail_once_at(5, RpcErrorKind::Transient);
        assert!(client.block_by_number(5).await.is_err());
        assert!(client.block_by_number(5).await.is_ok());
    }

    #[test]
    fn classify_maps_kinds() {
        assert_eq!(
            classify_rpc_error(&RpcError::Transient("x".into())),
            RpcErrorKind::Transient
        );
        assert_eq!(
            classify_rpc_error(&RpcError::RateLimited("x".into())),
            RpcErrorKind::RateLimited
        );
        assert_eq!(classify_rpc_error(&RpcError::NotFound(1)), RpcErrorKind::NotFound);
    }
}
