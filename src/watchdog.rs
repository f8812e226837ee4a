/// Deadlock Watchdog (SPEC_FULL.md §4.6) — the periodic auditor that detects
/// a space-time tear (checkpoint, expected height, and chain head diverging
/// beyond recovery) and self-heals by force-repositioning the pipeline.
///
/// Audit-loop shape is grounded in `monitor.rs`'s `tokio::time::interval`
/// ticker, generalized from a single health check to a compare-three-sources
/// classifier with a multi-step heal.
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::fetcher::Fetcher;
use crate::metrics;
use crate::orchestrator::OrchestratorCmd;
use crate::rpc::RpcClient;
use crate::sequencer::{SequencerControl, SequencerReport};
use crate::store::Store;
use crate::types::{HealingEvent, SyncCheckpoint, SystemState};

pub struct WatchdogConfig {
    pub chain_id: u64,
    pub gap_threshold: u64,
    pub stall_threshold: Duration,
    pub audit_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            chain_id: 1,
            gap_threshold: 1_000,
            stall_threshold: Duration::from_secs(120),
            audit_interval: Duration::from_secs(30),
        }
    }
}

/// Runs the audit loop until `cancel` fires. Holds no mutable pipeline state
/// of its own; every action against the Sequencer/Orchestrator/Fetcher goes
/// through their own handles, matching §9's "model as injected interfaces"
/// note.
pub async fn run<S: Store, R: RpcClient>(
    config: WatchdogConfig,
    store: std::sync::Arc<S>,
    rpc: std::sync::Arc<R>,
    fetcher: std::sync::Arc<Fetcher<R>>,
    sequencer_control_tx: mpsc::Sender<SequencerControl>,
    mut sequencer_report_rx: watch::Receiver<SequencerReport>,
    orchestrator_tx: mpsc::Sender<OrchestratorCmd>,
    events_tx: Option<broadcast::Sender<HealingEvent>>,
    cancel: CancellationToken,
) {
    let mut audit = tokio::time::interval(config.audit_interval);
    audit.tick().await; // first tick fires immediately; consume it
    let mut last_expected = sequencer_report_rx.borrow().expected_height;
    let mut last_change = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("watchdog cancelled");
                break;
            }
            _ = audit.tick() => {
                let expected_height = sequencer_report_rx.borrow().expected_height;
                if expected_height != last_expected {
                    last_expected = expected_height;
                    last_change = Instant::now();
                    continue;
                }
                let stalled = last_change.elapsed() >= config.stall_threshold;
                if !stalled {
                    continue;
                }
                audit_and_heal(
                    &config,
                    store.as_ref(),
                    rpc.as_ref(),
                    fetcher.as_ref(),
                    &sequencer_control_tx,
                    expected_height,
                    &orchestrator_tx,
                    &events_tx,
                )
                .await;
                // A successful heal moves expected_height; re-baseline so we
                // don't immediately re-trigger on the next tick.
                last_expected = sequencer_report_rx.borrow().expected_height;
                last_change = Instant::now();
            }
        }
    }
}

/// One audit pass: gather the three positions, classify, and heal if torn.
async fn audit_and_heal<S: Store, R: RpcClient>(
    config: &WatchdogConfig,
    store: &S,
    rpc: &R,
    fetcher: &Fetcher<R>,
    sequencer_control_tx: &mpsc::Sender<SequencerControl>,
    expected_height: u64,
    orchestrator_tx: &mpsc::Sender<OrchestratorCmd>,
    events_tx: &Option<broadcast::Sender<HealingEvent>>,
) {
    let chain_head = match rpc.latest_block_number().await {
        Ok(h) => h,
        Err(err) => {
            warn!(%err, "watchdog audit could not reach chain head, skipping pass");
            return;
        }
    };
    let checkpoint = match store.get_checkpoint(config.chain_id).await {
        Ok(c) => c.map(|c| c.last_synced_block).unwrap_or(0),
        Err(err) => {
            warn!(%err, "watchdog audit could not read checkpoint, skipping pass");
            return;
        }
    };

    let gap = chain_head.saturating_sub(checkpoint);
    let is_tear = gap > config.gap_threshold
        && expected_height < chain_head.saturating_sub(config.gap_threshold);

    if !is_tear {
        return;
    }

    warn!(
        chain_head,
        checkpoint,
        expected_height,
        gap,
        "space-time tear detected, healing"
    );

    let old_checkpoint = checkpoint;
    let result = heal(
        config,
        store,
        fetcher,
        sequencer_control_tx,
        chain_head,
        old_checkpoint,
        orchestrator_tx,
    )
    .await;

    let event = HealingEvent {
        trigger_reason: "space_time_tear".into(),
        db_watermark: old_checkpoint,
        rpc_height: chain_head,
        gap_size: gap,
        success: result.is_ok(),
        error: result.as_ref().err().cloned(),
    };
    metrics::WATCHDOG_HEALS_TOTAL.inc();
    metrics::WATCHDOG_GAP_SIZE.set(gap as i64);
    if let Err(err) = &result {
        error!(%err, "watchdog heal failed");
    } else {
        info!(chain_head, old_checkpoint, "watchdog heal complete");
    }
    if let Some(tx) = events_tx {
        let _ = tx.send(event);
    }
}

async fn heal<S: Store, R: RpcClient>(
    config: &WatchdogConfig,
    store: &S,
    fetcher: &Fetcher<R>,
    sequencer_control_tx: &mpsc::Sender<SequencerControl>,
    chain_head: u64,
    old_checkpoint: u64,
    orchestrator_tx: &mpsc::Sender<OrchestratorCmd>,
) -> Result<(), String> {
    // (a) force-write checkpoint = chainHead - 1
    let forced = SyncCheckpoint {
        chain_id: config.chain_id,
        last_synced_block: chain_head.saturating_sub(1),
        updated_at: crate::types::now_unix(),
    };
    let mut tx = store.begin().await.map_err(|e| e.to_string())?;
    tx.force_checkpoint(&forced).await.map_err(|e| e.to_string())?;
    tx.commit().await.map_err(|e| e.to_string())?;

    // (b) reset expected height, (c) clear buffer
    let _ = sequencer_control_tx
        .send(SequencerControl::ResetExpectedBlock(chain_head))
        .await;
    let _ = sequencer_control_tx.send(SequencerControl::ClearBuffer).await;

    // (d) tell the Orchestrator
    let _ = orchestrator_tx
        .send(OrchestratorCmd::SetSystemState(SystemState::Healing))
        .await;
    let _ = orchestrator_tx
        .send(OrchestratorCmd::ForceSetCursors(chain_head.saturating_sub(1)))
        .await;

    // (e) reschedule the skipped range for re-fetch
    fetcher.schedule(old_checkpoint + 1, chain_head);

    Ok(())
}
