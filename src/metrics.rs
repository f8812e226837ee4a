/// Metrics module — Prometheus instrumentation for the ingestion pipeline.
///
/// Registry/`lazy_static!` shape grounded in the teacher's `metrics.rs`
/// (`REGISTRY`, `init_metrics`, `gather_metrics`), scoped down from its
/// ~45-metric catalog to the instruments this pipeline's components actually
/// emit. Exporting the registry over HTTP is out of scope; `gather_metrics`
/// exists for local inspection and tests only.
use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};

const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0];

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Processor (§4.3)
    pub static ref PROCESS_BLOCK_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("indexer_process_block_duration_seconds", "Per-block processing latency")
            .buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();
    pub static ref PROCESS_E2E_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new("indexer_process_e2e_latency_seconds", "now - block timestamp at commit, clamped >= 0")
            .buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();
    pub static ref PROCESS_TRANSFERS_TOTAL: IntCounter = IntCounter::new(
        "indexer_process_transfers_total", "Transfer/synthetic activity rows persisted"
    ).unwrap();

    // AsyncWriter (§4.4)
    pub static ref ASYNC_WRITER_QUEUE_DEPTH: IntGauge = IntGauge::new(
        "indexer_async_writer_queue_depth", "Current depth of the AsyncWriter's task channel"
    ).unwrap();
    pub static ref ASYNC_WRITER_FLUSH_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "indexer_async_writer_flush_errors_total", "Flushes that failed and were dropped"
    ).unwrap();
    pub static ref ASYNC_WRITER_FLUSHES_TOTAL: IntCounter = IntCounter::new(
        "indexer_async_writer_flushes_total", "Successful flush operations"
    ).unwrap();
    pub static ref ASYNC_WRITER_SHEDS_TOTAL: IntCounter = IntCounter::new(
        "indexer_async_writer_sheds_total", "Emergency-shed episodes triggered by channel saturation"
    ).unwrap();

    // Orchestrator (§4.5)
    pub static ref ORCHESTRATOR_DROPPED_COMMANDS_TOTAL: IntCounter = IntCounter::new(
        "indexer_orchestrator_dropped_commands_total", "Commands dropped because the command channel was full"
    ).unwrap();
    pub static ref SYNCED_CURSOR: IntGauge = IntGauge::new(
        "indexer_synced_cursor", "CoordinatorState.SyncedCursor"
    ).unwrap();
    pub static ref FETCHED_HEIGHT: IntGauge = IntGauge::new(
        "indexer_fetched_height", "CoordinatorState.FetchedHeight"
    ).unwrap();
    pub static ref LATEST_HEIGHT: IntGauge = IntGauge::new(
        "indexer_latest_height", "CoordinatorState.LatestHeight"
    ).unwrap();
    pub static ref SAFETY_BUFFER: IntGauge = IntGauge::new(
        "indexer_safety_buffer", "CoordinatorState.SafetyBuffer"
    ).unwrap();
    pub static ref PROGRESS_PCT: prometheus::Gauge = prometheus::Gauge::new(
        "indexer_progress_pct", "CoordinatorState.Progress, clamped to [0, 100]"
    ).unwrap();

    // Fetcher (§4.1)
    pub static ref FETCH_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new("indexer_fetch_latency_seconds", "BlockByNumber + FilterLogs round-trip latency")
            .buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();
    pub static ref FETCH_RETRIES_TOTAL: IntCounter = IntCounter::new(
        "indexer_fetch_retries_total", "Retried fetch attempts across all workers"
    ).unwrap();
    pub static ref FETCHER_JOBS_INFLIGHT: IntGauge = IntGauge::new(
        "indexer_fetcher_jobs_inflight", "Worker slots currently fetching a height"
    ).unwrap();

    // Watchdog (§4.6)
    pub static ref WATCHDOG_HEALS_TOTAL: IntCounter = IntCounter::new(
        "indexer_watchdog_heals_total", "Space-time tear heal attempts"
    ).unwrap();
    pub static ref WATCHDOG_GAP_SIZE: IntGauge = IntGauge::new(
        "indexer_watchdog_gap_size", "chainHead - checkpoint at the most recent audit pass"
    ).unwrap();

    // Sequencer (§4.2)
    pub static ref SEQUENCER_BUFFER_DEPTH: IntGauge = IntGauge::new(
        "indexer_sequencer_buffer_depth", "Out-of-order reassembly buffer depth"
    ).unwrap();
    pub static ref SEQUENCER_OVERFLOW_SKIPS_TOTAL: IntCounter = IntCounter::new(
        "indexer_sequencer_overflow_skips_total", "BUFFER_OVERFLOW_SKIP occurrences"
    ).unwrap();
    pub static ref REORG_EVENTS_TOTAL: IntCounter = IntCounter::new(
        "indexer_reorg_events_total", "Detected reorgs handed off to the deep-reorg resolver"
    ).unwrap();
}

/// Register every metric with the global registry. Call once at process
/// startup.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(PROCESS_BLOCK_DURATION.clone()))?;
    REGISTRY.register(Box::new(PROCESS_E2E_LATENCY.clone()))?;
    REGISTRY.register(Box::new(PROCESS_TRANSFERS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ASYNC_WRITER_QUEUE_DEPTH.clone()))?;
    REGISTRY.register(Box::new(ASYNC_WRITER_FLUSH_ERRORS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ASYNC_WRITER_FLUSHES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ASYNC_WRITER_SHEDS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(ORCHESTRATOR_DROPPED_COMMANDS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(SYNCED_CURSOR.clone()))?;
    REGISTRY.register(Box::new(FETCHED_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(LATEST_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(SAFETY_BUFFER.clone()))?;
    REGISTRY.register(Box::new(PROGRESS_PCT.clone()))?;
    REGISTRY.register(Box::new(FETCH_LATENCY.clone()))?;
    REGISTRY.register(Box::new(FETCH_RETRIES_TOTAL.clone()))?;
    REGISTRY.register(Box::new(FETCHER_JOBS_INFLIGHT.clone()))?;
    REGISTRY.register(Box::new(WATCHDOG_HEALS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(WATCHDOG_GAP_SIZE.clone()))?;
    REGISTRY.register(Box::new(SEQUENCER_BUFFER_DEPTH.clone()))?;
    REGISTRY.register(Box::new(SEQUENCER_OVERFLOW_SKIPS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REORG_EVENTS_TOTAL.clone()))?;
    Ok(())
}

/// `init_metrics`, but an `AlreadyReg` error (a second call in the same
/// process, e.g. from multiple test binaries) is swallowed rather than
/// propagated.
pub fn try_init() {
    if let Err(err) = init_metrics() {
        if !matches!(err, prometheus::Error::AlreadyReg) {
            tracing::warn!(%err, "metrics registration failed");
        }
    }
}

/// Gather metrics in Prometheus text exposition format, for local inspection
/// or a test assertion. Serving this over HTTP is out of scope.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_init_is_idempotent() {
        try_init();
        try_init();
    }

    #[test]
    fn gather_includes_registered_metric_names() {
        try_init();
        PROCESS_TRANSFERS_TOTAL.inc();
        let text = gather_metrics();
        assert!(text.contains("indexer_process_transfers_total"));
        assert!(text.contains("indexer_synced_cursor"));
    }
}
