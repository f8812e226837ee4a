/// Orchestrator (SPEC_FULL.md §4.5) — the single source of truth for global
/// sync progress. All state mutation happens on one task; everyone else only
/// ever sees a published `CoordinatorSnapshot`.
///
/// Per REDESIGN FLAGS, the dynamic `Data interface{}` command payload is
/// replaced by the exhaustive `OrchestratorCmd` sum type below, carried over
/// an `mpsc::Sender`; `GetSnapshot` embeds a `oneshot::Sender` reply field,
/// the same request/oneshot-reply shape `caching_request.rs`'s inner loop
/// uses for `get_or_fetch`, generalized from a single-purpose cache lookup to
/// a full command-and-query actor.
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics;
use crate::types::{CoordinatorSnapshot, CoordinatorState, PersistTask, SystemState};

#[derive(Debug)]
pub enum OrchestratorCmd {
    UpdateChainHeight(u64),
    FetchFailedNotFound,
    FetchSuccess,
    NotifyFetched(u64),
    NotifyFetchProgress(u64),
    /// Non-blocking hand-off to the AsyncWriter's channel.
    CommitBatch(PersistTask),
    CommitDisk(u64),
    ResetCursor(u64),
    ForceSetCursors(u64),
    IncrementTransfers(u64),
    ToggleEcoMode(bool),
    SetSystemState(SystemState),
    RecordUserActivity,
    LogEvent(String),
    GetSnapshot(oneshot::Sender<CoordinatorSnapshot>),
}

pub struct OrchestratorConfig {
    pub eco_idle_threshold: Duration,
    pub eco_sync_gap: u64,
    pub results_depth_throttle_pct: f64,
    pub pipeline_depth: usize,
    pub height_commit_interval: Duration,
    pub control_tick_interval: Duration,
    pub telemetry_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            eco_idle_threshold: Duration::from_secs(120),
            eco_sync_gap: 10,
            results_depth_throttle_pct: 0.8,
            pipeline_depth: 2_000,
            height_commit_interval: Duration::from_millis(100),
            control_tick_interval: Duration::from_secs(5),
            telemetry_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Clone)]
pub struct OrchestratorHandle {
    cmd_tx: mpsc::Sender<OrchestratorCmd>,
    snapshots: broadcast::Sender<CoordinatorSnapshot>,
}

impl OrchestratorHandle {
    /// Fire-and-forget send; drops (with a log line) on a full command
    /// channel rather than blocking the caller, per the "drop with log on
    /// overflow" command-channel policy.
    pub fn send(&self, cmd: OrchestratorCmd) {
        if let Err(err) = self.cmd_tx.try_send(cmd) {
            warn!(%err, "orchestrator command channel full, dropping command");
            metrics::ORCHESTRATOR_DROPPED_COMMANDS_TOTAL.inc();
        }
    }

    pub fn sender(&self) -> mpsc::Sender<OrchestratorCmd> {
        self.cmd_tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorSnapshot> {
        self.snapshots.subscribe()
    }

    pub async fn get_snapshot(&self) -> Option<CoordinatorSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(OrchestratorCmd::GetSnapshot(tx))
            .await
            .ok()?;
        rx.await.ok()
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    state: CoordinatorState,
    pending_height_update: Option<u64>,
    persist_tx: mpsc::Sender<PersistTask>,
    cmd_rx: mpsc::Receiver<OrchestratorCmd>,
    snapshots: broadcast::Sender<CoordinatorSnapshot>,
}

impl Orchestrator {
    pub fn spawn(
        config: OrchestratorConfig,
        persist_tx: mpsc::Sender<PersistTask>,
        command_channel_capacity: usize,
        cancel: CancellationToken,
    ) -> (OrchestratorHandle, tokio::task::JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(command_channel_capacity);
        let (snapshots, _) = broadcast::channel(100);
        let handle = OrchestratorHandle {
            cmd_tx,
            snapshots: snapshots.clone(),
        };
        let actor = Orchestrator {
            config,
            state: CoordinatorState::default(),
            pending_height_update: None,
            persist_tx,
            cmd_rx,
            snapshots,
        };
        let join = tokio::spawn(actor.run(cancel));
        (handle, join)
    }

    async fn run(mut self, cancel: CancellationToken) {
        let mut height_ticker = interval(self.config.height_commit_interval);
        let mut control_ticker = interval(self.config.control_tick_interval);
        let mut telemetry_ticker = interval(self.config.telemetry_interval);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("orchestrator cancelled");
                    break;
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        None => break,
                        Some(cmd) => {
                            self.handle_cmd(cmd).await;
                            self.publish_snapshot();
                        }
                    }
                }
                _ = height_ticker.tick() => {
                    self.commit_pending_height();
                    self.publish_snapshot();
                }
                _ = control_ticker.tick() => {
                    self.evaluate_eco_mode();
                    self.evaluate_system_state();
                    self.publish_snapshot();
                }
                _ = telemetry_ticker.tick() => {
                    self.emit_telemetry();
                }
            }
        }
    }

    async fn handle_cmd(&mut self, cmd: OrchestratorCmd) {
        match cmd {
            OrchestratorCmd::UpdateChainHeight(h) => {
                self.pending_height_update = Some(
                    self.pending_height_update.map_or(h, |existing| existing.max(h)),
                );
            }
            OrchestratorCmd::FetchFailedNotFound => {
                self.state.success_count = 0;
                self.state.safety_buffer =
                    (self.state.safety_buffer + 1).min(CoordinatorState::SAFETY_BUFFER_MAX);
            }
            OrchestratorCmd::FetchSuccess => {
                self.state.success_count += 1;
                if self.state.success_count % 50 == 0 {
                    self.state.safety_buffer =
                        self.state.safety_buffer.saturating_sub(1).max(CoordinatorState::SAFETY_BUFFER_MIN);
                }
            }
            OrchestratorCmd::NotifyFetched(h) | OrchestratorCmd::NotifyFetchProgress(h) => {
                self.state.fetched_height = self.state.fetched_height.max(h);
            }
            OrchestratorCmd::CommitBatch(task) => {
                if self.persist_tx.try_send(task).is_err() {
                    warn!("async writer channel full, commit batch dropped");
                }
            }
            OrchestratorCmd::CommitDisk(h) => {
                self.state.synced_cursor = self.state.synced_cursor.max(h);
            }
            OrchestratorCmd::ResetCursor(h) | OrchestratorCmd::ForceSetCursors(h) => {
                self.state.synced_cursor = h;
                self.state.fetched_height = self.state.fetched_height.max(h);
            }
            OrchestratorCmd::IncrementTransfers(n) => {
                self.state.transfers += n;
            }
            OrchestratorCmd::ToggleEcoMode(b) => {
                self.state.is_eco_mode = b;
            }
            OrchestratorCmd::SetSystemState(s) => {
                self.state.system_state = s;
            }
            OrchestratorCmd::RecordUserActivity => {
                self.state.last_user_activity = crate::types::now_unix();
            }
            OrchestratorCmd::LogEvent(msg) => {
                self.state.log_entry = Some(msg);
            }
            OrchestratorCmd::GetSnapshot(reply) => {
                self.state.recompute_progress();
                let _ = reply.send(self.state.to_snapshot());
            }
        }
        self.state.updated_at = crate::types::now_unix();
        self.state.recompute_progress();
    }

    fn commit_pending_height(&mut self) {
        if let Some(h) = self.pending_height_update.take() {
            self.state.latest_height = h;
            self.state.target_height = h.saturating_sub(self.state.safety_buffer as u64);
            self.state.recompute_progress();
        }
    }

    /// `IsEcoMode = (LatestHeight − SyncedCursor ≤ gap) AND idle ≥ threshold`.
    fn evaluate_eco_mode(&mut self) {
        let caught_up = self.state.sync_lag() <= self.config.eco_sync_gap;
        let idle_secs = crate::types::now_unix().saturating_sub(self.state.last_user_activity);
        let idle_enough = idle_secs >= self.config.eco_idle_threshold.as_secs();
        self.state.is_eco_mode = caught_up && idle_enough;
    }

    /// Throttled if results backlog exceeds the configured fraction of
    /// pipeline depth; else Optimizing while the safety buffer is elevated;
    /// else Running.
    fn evaluate_system_state(&mut self) {
        if matches!(self.state.system_state, SystemState::Degraded | SystemState::Healing | SystemState::Stalled) {
            // A more severe externally-driven state takes precedence over
            // this tick's routine classification.
            return;
        }
        let throttle_threshold =
            (self.config.pipeline_depth as f64 * self.config.results_depth_throttle_pct) as usize;
        self.state.system_state = if self.state.results_depth > throttle_threshold {
            SystemState::Throttled
        } else if self.state.safety_buffer > CoordinatorState::SAFETY_BUFFER_MIN {
            SystemState::Optimizing
        } else {
            SystemState::Running
        };
    }

    fn emit_telemetry(&self) {
        info!(
            latest_height = self.state.latest_height,
            fetched_height = self.state.fetched_height,
            synced_cursor = self.state.synced_cursor,
            safety_buffer = self.state.safety_buffer,
            progress_pct = self.state.progress_pct,
            system_state = ?self.state.system_state,
            "telemetry pulse"
        );
        metrics::SYNCED_CURSOR.set(self.state.synced_cursor as i64);
        metrics::FETCHED_HEIGHT.set(self.state.fetched_height as i64);
        metrics::LATEST_HEIGHT.set(self.state.latest_height as i64);
        metrics::SAFETY_BUFFER.set(self.state.safety_buffer as i64);
        metrics::PROGRESS_PCT.set(self.state.progress_pct);
    }

    fn publish_snapshot(&self) {
        if self.snapshots.send(self.state.to_snapshot()).is_err() {
            // No active subscribers; not an error condition.
        }
    }
}
