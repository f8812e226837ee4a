/// Sequencer (SPEC_FULL.md §4.2) — the single task that owns the reorder
/// buffer and enforces strict height ordering downstream.
///
/// Exclusive task ownership of the `BTreeMap` realizes "guarded by its own
/// mutex" without an actual `Mutex`: nothing outside this task ever touches
/// the buffer, the same single-owner discipline `caching_request.rs`'s inner
/// loop uses for its `cache`/`in_flight` maps, adapted from a request-cache
/// actor to an out-of-order reassembly buffer.
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::types::BlockData;

/// Cap on how many times the stall detector will batch-refetch the same gap
/// before giving up and leaving it to the Watchdog's own healing pass.
const MAX_GAP_RESCHEDULES: u32 = 10;

pub struct SequencerConfig {
    pub start_height: u64,
    pub buffer_cap: usize,
    pub stall_audit_interval: Duration,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            start_height: 0,
            buffer_cap: 2_000,
            stall_audit_interval: Duration::from_secs(30),
        }
    }
}

/// Published on every state change so observers (the Orchestrator, the
/// Watchdog) can read the Sequencer's current position without reaching into
/// its owned buffer. A `watch` channel rather than a queue: readers only ever
/// care about the latest value, e.g. the Watchdog's audit pass reads
/// `expected_height` directly instead of draining history.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequencerReport {
    pub expected_height: u64,
    pub buffer_depth: usize,
    pub highest_buffered: Option<u64>,
}

/// Out-of-band control the Watchdog issues during a healing pass (§4.6).
/// Kept on a dedicated channel, separate from the `BlockData` flow, so a
/// heal can interrupt reassembly without racing ordinary traffic.
#[derive(Debug)]
pub enum SequencerControl {
    ResetExpectedBlock(u64),
    ClearBuffer,
}

/// Runs until `jobs_rx` closes or `cancel` fires. Consumes out-of-order
/// `BlockData` from `jobs_rx`, buffers it by height, and emits strictly
/// increasing, contiguous `BlockData` on `ordered_tx`.
pub async fn run(
    config: SequencerConfig,
    mut jobs_rx: mpsc::Receiver<BlockData>,
    ordered_tx: mpsc::Sender<BlockData>,
    report_tx: Option<watch::Sender<SequencerReport>>,
    reschedule_tx: Option<mpsc::Sender<u64>>,
    mut control_rx: mpsc::Receiver<SequencerControl>,
    cancel: CancellationToken,
) {
    let mut buffer: BTreeMap<u64, BlockData> = BTreeMap::new();
    let mut expected_height = config.start_height;
    let mut audit = interval(config.stall_audit_interval);
    audit.tick().await; // first tick fires immediately; consume it
    let mut last_progress_at = Instant::now();
    let mut gap_reschedule_count: u32 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("sequencer cancelled");
                break;
            }
            control = control_rx.recv() => {
                match control {
                    None => {}
                    Some(SequencerControl::ResetExpectedBlock(h)) => {
                        info!(new_expected = h, "sequencer expected height reset by watchdog");
                        expected_height = h;
                        last_progress_at = Instant::now();
                        gap_reschedule_count = 0;
                    }
                    Some(SequencerControl::ClearBuffer) => {
                        info!(dropped = buffer.len(), "sequencer buffer cleared by watchdog");
                        buffer.clear();
                    }
                }
                report(&report_tx, expected_height, &buffer);
            }
            item = jobs_rx.recv() => {
                match item {
                    None => {
                        info!("jobs channel closed, sequencer draining");
                        break;
                    }
                    Some(data) => {
                        if let Some(height) = data.height() {
                            buffer.insert(height, data);
                        } else {
                            // RangeProgress carries no height slot, so it never
                            // participates in reordering, but it still teleports
                            // the cursor forward when it matches or exceeds what
                            // we're waiting on.
                            if let BlockData::RangeProgress { range_end } = &data {
                                let teleport = range_end.saturating_add(1);
                                if teleport >= expected_height {
                                    expected_height = teleport;
                                    last_progress_at = Instant::now();
                                    gap_reschedule_count = 0;
                                }
                            }
                            if ordered_tx.send(data).await.is_err() {
                                break;
                            }
                        }
                        let before = expected_height;
                        if buffer.len() > config.buffer_cap {
                            handle_overflow(&mut buffer, &mut expected_height, &reschedule_tx).await;
                        }
                        if drain_contiguous(&mut buffer, &mut expected_height, &ordered_tx).await.is_err() {
                            break;
                        }
                        if expected_height != before {
                            last_progress_at = Instant::now();
                            gap_reschedule_count = 0;
                        }
                        report(&report_tx, expected_height, &buffer);
                    }
                }
            }
            _ = audit.tick() => {
                if let Some(&lowest) = buffer.keys().next() {
                    if lowest > expected_height
                        && last_progress_at.elapsed() > config.stall_audit_interval
                        && gap_reschedule_count < MAX_GAP_RESCHEDULES
                    {
                        warn!(
                            expected_height,
                            lowest_buffered = lowest,
                            gap = lowest - expected_height,
                            attempt = gap_reschedule_count + 1,
                            "CRITICAL_GAP_DETECTED: sequencer stalled on a gap, batch-refetching"
                        );
                        if let Some(tx) = &reschedule_tx {
                            for missing in expected_height..lowest {
                                let _ = tx.send(missing).await;
                            }
                        }
                        gap_reschedule_count += 1;
                        last_progress_at = Instant::now();
                    }
                }
            }
        }
    }
}

/// Emit every contiguous run starting at `expected_height` found at the
/// front of the buffer.
async fn drain_contiguous(
    buffer: &mut BTreeMap<u64, BlockData>,
    expected_height: &mut u64,
    ordered_tx: &mpsc::Sender<BlockData>,
) -> Result<(), ()> {
    while let Some(data) = buffer.remove(expected_height) {
        *expected_height += 1;
        if ordered_tx.send(data).await.is_err() {
            return Err(());
        }
    }
    Ok(())
}

/// `BUFFER_OVERFLOW_SKIP`: the buffer exceeded its hard cap because
/// `expected_height` is stuck behind a hole the Fetcher never filled.
/// Per decision, the missing heights are resubmitted to the Fetcher via
/// `reschedule_tx` *before* the expected cursor is skipped forward past them,
/// so the gap has a chance to heal out-of-band instead of being silently lost.
async fn handle_overflow(
    buffer: &mut BTreeMap<u64, BlockData>,
    expected_height: &mut u64,
    reschedule_tx: &Option<mpsc::Sender<u64>>,
) {
    let Some(&target) = buffer.keys().next() else {
        return;
    };
    if target <= *expected_height {
        return;
    }
    warn!(
        from = *expected_height,
        to = target,
        "buffer overflow, skipping gap"
    );
    if let Some(tx) = reschedule_tx {
        for missing in *expected_height..target {
            let _ = tx.send(missing).await;
        }
    }
    *expected_height = target;
}

fn report(
    report_tx: &Option<watch::Sender<SequencerReport>>,
    expected_height: u64,
    buffer: &BTreeMap<u64, BlockData>,
) {
    if let Some(tx) = report_tx {
        let _ = tx.send(SequencerReport {
            expected_height,
            buffer_depth: buffer.len(),
            highest_buffered: buffer.keys().next_back().copied(),
        });
    }
}
