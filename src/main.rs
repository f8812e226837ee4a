/// Entry point (SPEC_FULL.md §2.1) — a thin wiring layer. Loads configuration,
/// constructs the shared `RpcClient`/`Store` adapters, spawns the five
/// cooperating component tasks, and waits on `ctrl_c` before cancelling them.
///
/// Mirrors the teacher's `run_sync_service`/`run_block_monitor` task-spawning
/// style in `sync.rs`/`monitor.rs`, generalized from one background task to
/// five tasks joined by channels instead of direct function calls.
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use indexer_core::async_writer::{AsyncWriter, AsyncWriterConfig};
use indexer_core::config::{self, IndexerConfig};
use indexer_core::error::IndexerError;
use indexer_core::fetcher::{Fetcher, FetcherConfig};
use indexer_core::metrics;
use indexer_core::orchestrator::{Orchestrator, OrchestratorCmd, OrchestratorConfig};
use indexer_core::processor::{Processor, ProcessorConfig};
use indexer_core::rpc::MockRpcClient;
use indexer_core::sequencer::{self, SequencerConfig, SequencerControl};
use indexer_core::store::InMemoryStore;
use indexer_core::telemetry::{init_tracing, TelemetryConfig};
use indexer_core::types::{BlockData, IndexEvent, PersistTask, ReorgEvent, SystemState};
use indexer_core::watchdog::{self, WatchdogConfig};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "indexer-core")]
struct Cli {
    /// Path to the settings file. Missing is not an error: every key falls
    /// back to the code-level default in `IndexerConfig`.
    #[arg(long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(TelemetryConfig::default())?;
    metrics::try_init();

    let cli = Cli::parse();
    let raw_config = match config::load_config_from(std::path::Path::new(&cli.config)) {
        Ok(c) => c,
        Err(err) => {
            warn!(%err, path = %cli.config, "no config file found, running with built-in defaults");
            config::Config::builder().build()?
        }
    };
    let indexer_config = IndexerConfig::from_config(&raw_config);

    info!(
        chain_id = indexer_config.chain_id,
        profile = ?indexer_config.profile,
        ephemeral = indexer_config.ephemeral,
        "indexer-core starting"
    );

    let cancel = CancellationToken::new();
    let store = Arc::new(InMemoryStore::new());
    let rpc = Arc::new(MockRpcClient::new());

    // Orchestrator + AsyncWriter
    let (persist_tx, persist_rx) = mpsc::channel::<PersistTask>(indexer_config.async_writer_capacity);
    let (orch_handle, orch_join) = Orchestrator::spawn(
        OrchestratorConfig::default(),
        persist_tx.clone(),
        256,
        cancel.clone(),
    );

    let async_writer = AsyncWriter::new(
        Arc::clone(&store),
        AsyncWriterConfig {
            chain_id: indexer_config.chain_id,
            capacity: indexer_config.async_writer_capacity,
            batch_size: indexer_config.async_writer_batch_size,
            flush_interval: indexer_config.async_writer_flush_interval,
            ephemeral: indexer_config.ephemeral,
            ..AsyncWriterConfig::default()
        },
        orch_handle.sender(),
    );
    let async_writer_join = tokio::spawn(async_writer.run(persist_rx, cancel.clone()));

    // Fetcher -> Sequencer -> driver(Processor) pipeline
    let (jobs_tx, jobs_rx) = mpsc::channel::<BlockData>(1_024);
    let (ordered_tx, mut ordered_rx) = mpsc::channel::<BlockData>(1_024);
    let (reschedule_tx, mut reschedule_rx) = mpsc::channel::<u64>(256);
    let (control_tx, control_rx) = mpsc::channel::<SequencerControl>(16);
    let (report_tx, report_rx) = watch::channel(Default::default());
    let (healing_tx, _healing_rx) = broadcast::channel(64);
    let (reorg_tx, _reorg_rx) = broadcast::channel::<ReorgEvent>(64);
    let (events_tx, _events_rx) = broadcast::channel::<IndexEvent>(256);

    let fetcher = Arc::new(Fetcher::new(
        Arc::clone(&rpc),
        FetcherConfig {
            worker_count: indexer_config.fetcher_concurrency,
            start_height: indexer_config.start_anchor,
            header_only: indexer_config.header_only,
            ..FetcherConfig::default()
        },
        jobs_tx,
        cancel.clone(),
    ));
    let mut fetcher_workers = fetcher.spawn(indexer_config.fetcher_concurrency);

    let sequencer_join = tokio::spawn(sequencer::run(
        SequencerConfig {
            start_height: indexer_config.start_anchor,
            buffer_cap: indexer_config.sequencer_buffer_cap,
            ..SequencerConfig::default()
        },
        jobs_rx,
        ordered_tx,
        Some(report_tx),
        Some(reschedule_tx),
        control_rx,
        cancel.clone(),
    ));

    // The Sequencer's overflow-skip hands single missing heights back here;
    // resubmit each as its own one-height range.
    let reschedule_fetcher = Arc::clone(&fetcher);
    let reschedule_cancel = cancel.clone();
    let reschedule_join = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = reschedule_cancel.cancelled() => break,
                height = reschedule_rx.recv() => {
                    match height {
                        Some(h) => {
                            if let Err(err) = reschedule_fetcher.schedule(h, h) {
                                warn!(%err, height = h, "failed to reschedule height");
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    let watchdog_join = tokio::spawn(watchdog::run(
        WatchdogConfig {
            chain_id: indexer_config.chain_id,
            gap_threshold: indexer_config.watchdog_gap_threshold,
            stall_threshold: indexer_config.watchdog_stall_threshold,
            ..WatchdogConfig::default()
        },
        Arc::clone(&store),
        Arc::clone(&rpc),
        Arc::clone(&fetcher),
        control_tx.clone(),
        report_rx,
        orch_handle.sender(),
        Some(healing_tx),
        cancel.clone(),
    ));

    // Driver: the one task that owns the Processor, since only it learns the
    // reorg/commit verdict for each ordered block. On a reorg it reuses the
    // Watchdog's own SequencerControl messages to evict the buffer and rewind
    // expectedBlock, and the Fetcher's `schedule` to rewind the claim cursor —
    // there is no separate pause/resume primitive, since these two already
    // cover "stop handing out the torn range and start over from H".
    let driver_store = (*store).clone();
    let driver_orch = orch_handle.sender();
    let driver_fetcher = Arc::clone(&fetcher);
    let driver_control_tx = control_tx;
    let driver_reorg_tx = reorg_tx;
    let driver_chain_id = indexer_config.chain_id;
    let driver_start_anchor = indexer_config.start_anchor;
    let driver_checkpoint_batch = indexer_config.checkpoint_batch;
    let driver_batch_cap = indexer_config.sequencer_batch_size.max(1);
    let driver_cancel = cancel.clone();
    let driver_join = tokio::spawn(async move {
        let mut processor = Processor::new(
            driver_store,
            ProcessorConfig {
                chain_id: driver_chain_id,
                start_anchor: driver_start_anchor,
                checkpoint_batch: driver_checkpoint_batch,
            },
            events_tx,
        );
        // A non-`Block` item pulled while opportunistically draining a run is
        // stashed here and handled first on the next iteration, so nothing is
        // ever dropped by the lookahead.
        let mut pending: Option<BlockData> = None;
        loop {
            let next = async {
                if let Some(p) = pending.take() {
                    Some(p)
                } else {
                    ordered_rx.recv().await
                }
            };
            tokio::select! {
                biased;
                _ = driver_cancel.cancelled() => {
                    info!("pipeline driver cancelled");
                    break;
                }
                item = next => {
                    match item {
                        None => break,
                        Some(BlockData::RangeProgress { range_end }) => {
                            driver_orch.try_send(OrchestratorCmd::NotifyFetchProgress(range_end)).ok();
                        }
                        Some(BlockData::Error { height, error }) => {
                            warn!(height, %error, "fetcher gave up on height");
                            driver_orch.try_send(OrchestratorCmd::FetchFailedNotFound).ok();
                        }
                        Some(BlockData::Block { height, block }) => {
                            driver_orch.try_send(OrchestratorCmd::NotifyFetched(height)).ok();

                            // Opportunistically collect a contiguous run of
                            // already-buffered blocks so it can be committed
                            // through a single store transaction.
                            let mut run = vec![block];
                            while run.len() < driver_batch_cap {
                                match ordered_rx.try_recv() {
                                    Ok(BlockData::Block { block, .. }) => run.push(block),
                                    Ok(other) => {
                                        pending = Some(other);
                                        break;
                                    }
                                    Err(_) => break,
                                }
                            }
                            let last_height = run.last().unwrap().header.height;

                            let outcome = if run.len() >= 2 {
                                processor.process_batch(&run).await
                            } else {
                                processor.process_block_with_retry(&run[0], false, 2).await
                            };

                            match outcome {
                                Ok(transfer_count) => {
                                    driver_orch.try_send(OrchestratorCmd::FetchSuccess).ok();
                                    driver_orch.try_send(OrchestratorCmd::CommitDisk(last_height)).ok();
                                    if transfer_count > 0 {
                                        driver_orch
                                            .try_send(OrchestratorCmd::IncrementTransfers(transfer_count as u64))
                                            .ok();
                                    }
                                    for block in &run {
                                        let _ = driver_orch.try_send(OrchestratorCmd::CommitBatch(PersistTask {
                                            height: block.header.height,
                                            block: block.header.clone(),
                                            transfers: Vec::new(),
                                            sequence: block.header.height,
                                        }));
                                    }
                                }
                                Err(IndexerError::Reorg { at }) => {
                                    error!(at, "reorg detected, rewinding pipeline");
                                    let _ = driver_control_tx.send(SequencerControl::ClearBuffer).await;
                                    let _ = driver_control_tx
                                        .send(SequencerControl::ResetExpectedBlock(at))
                                        .await;
                                    driver_orch.try_send(OrchestratorCmd::SetSystemState(SystemState::Degraded)).ok();
                                    if let Err(err) = driver_fetcher.schedule(at, last_height) {
                                        warn!(%err, at, "failed to reschedule after reorg");
                                    }
                                    let _ = driver_reorg_tx.send(ReorgEvent { at });
                                    driver_orch.try_send(OrchestratorCmd::SetSystemState(SystemState::Running)).ok();
                                }
                                Err(err) => {
                                    error!(height, %err, "block processing failed");
                                }
                            }
                        }
                    }
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, cancelling");
    cancel.cancel();

    let shutdown = async {
        while fetcher_workers.join_next().await.is_some() {}
        let _ = sequencer_join.await;
        let _ = reschedule_join.await;
        let _ = watchdog_join.await;
        let _ = driver_join.await;
        let _ = async_writer_join.await;
        let _ = orch_join.await;
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await.is_err() {
        return Err(Box::new(indexer_core::error::ShutdownError::Deadline(SHUTDOWN_TIMEOUT)));
    }

    info!("indexer-core stopped");
    Ok(())
}
