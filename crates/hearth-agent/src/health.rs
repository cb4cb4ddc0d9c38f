//! Periodic liveness sweep plus crash-driven recovery.
//!
//! The monitor never restarts a server unconditionally: every recovery
//! first runs the diagnosis engine over the recent log window, and a fatal
//! finding (EULA, missing executable, bound port, Java mismatch, corrupted
//! properties) vetoes the restart so the agent doesn't crash-loop a server
//! that can never come up.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use hearth_process::{ServerId, ServerState};
use tokio::sync::{Mutex, broadcast::error::RecvError};

use crate::config::{self, ConfigStore, ServerConfig};
use crate::diagnosis::{self, EnvInfo};
use crate::events::AgentEvent;
use crate::orchestrator::{self, StartupOrchestrator};
use crate::supervisor::{ProcessSupervisor, now_unix_ms};

const MAX_RECOVERY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryReason {
    /// Expected running but no live handle and nothing answers the port.
    Zombie,
    /// Live handle, snapshot Online, but the port stopped answering.
    Hung,
    /// The supervisor reported an unexpected exit.
    Crashed,
}

impl fmt::Display for RecoveryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryReason::Zombie => f.write_str("zombie"),
            RecoveryReason::Hung => f.write_str("hung"),
            RecoveryReason::Crashed => f.write_str("crashed"),
        }
    }
}

/// Bounded retry budget. One attempt slot is returned for every full decay
/// window that passes without a new attempt.
#[derive(Debug, Default, Clone, Copy)]
struct RecoveryCounter {
    attempts: u32,
    last_attempt_ms: u64,
}

impl RecoveryCounter {
    /// Some(attempt number) when the budget allows another try.
    fn register_attempt(&mut self, now_ms: u64, decay_window_ms: u64) -> Option<u32> {
        if self.attempts > 0 && decay_window_ms > 0 {
            let lapsed = now_ms.saturating_sub(self.last_attempt_ms) / decay_window_ms;
            self.attempts = self.attempts.saturating_sub(lapsed as u32);
        }
        if self.attempts >= MAX_RECOVERY_ATTEMPTS {
            return None;
        }
        self.attempts += 1;
        self.last_attempt_ms = now_ms;
        Some(self.attempts)
    }
}

pub struct HealthMonitor {
    supervisor: ProcessSupervisor,
    store: Arc<dyn ConfigStore>,
    orchestrator: Arc<StartupOrchestrator>,
    counters: Mutex<HashMap<String, RecoveryCounter>>,
    last_checked_ms: Mutex<HashMap<String, u64>>,
    /// Ids whose Crashed transition the monitor itself issued. Those events
    /// echo back through the crash subscription and must not be mistaken
    /// for a fresh process exit.
    own_verdicts: Mutex<HashSet<String>>,
}

impl HealthMonitor {
    pub fn new(
        supervisor: ProcessSupervisor,
        store: Arc<dyn ConfigStore>,
        orchestrator: Arc<StartupOrchestrator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            store,
            orchestrator,
            counters: Mutex::new(HashMap::new()),
            last_checked_ms: Mutex::new(HashMap::new()),
            own_verdicts: Mutex::new(HashSet::new()),
        })
    }

    /// Runs until the process exits: one task reacting to crash events,
    /// plus the fixed-interval sweep.
    pub async fn run(self: Arc<Self>) {
        let crash_watcher = Arc::clone(&self);
        tokio::spawn(async move { crash_watcher.watch_crashes().await });

        let mut tick = tokio::time::interval(config::monitor_tick());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            self.sweep().await;
        }
    }

    async fn watch_crashes(self: Arc<Self>) {
        let mut rx = self.supervisor.subscribe();
        loop {
            match rx.recv().await {
                Ok(AgentEvent::Status {
                    id,
                    state: ServerState::Crashed,
                }) => {
                    if self.own_verdicts.lock().await.remove(&id.0) {
                        continue;
                    }
                    self.recover(&id, RecoveryReason::Crashed).await;
                }
                Ok(_) => {}
                // Lagging only drops events we would re-derive on the next
                // sweep anyway.
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn sweep(&self) {
        let configs = match self.store.all().await {
            Ok(c) => c,
            Err(err) => {
                tracing::warn!(error = %err, "health sweep could not list servers");
                return;
            }
        };
        for cfg in configs.into_iter().filter(|c| c.auto_start) {
            if !self.due_for_check(&cfg).await {
                continue;
            }
            self.check_one(&cfg).await;
        }
    }

    /// Each server honors its own check interval on top of the global tick.
    async fn due_for_check(&self, cfg: &ServerConfig) -> bool {
        let interval_ms = cfg.check_interval_secs.max(1) * 1000;
        let now = now_unix_ms();
        let mut last = self.last_checked_ms.lock().await;
        let entry = last.entry(cfg.id.0.clone()).or_insert(0);
        if now.saturating_sub(*entry) < interval_ms {
            return false;
        }
        *entry = now;
        true
    }

    async fn check_one(&self, cfg: &ServerConfig) {
        let snapshot = self.supervisor.status(&cfg.id).await;
        let live = self.supervisor.is_live(&cfg.id).await;

        // Starting has its own watchdog; Stopping and Recovering are
        // transitions the monitor must not fight.
        let expected_online = match snapshot.as_ref().map(|s| s.state) {
            Some(ServerState::Online) => true,
            Some(_) => return,
            // No snapshot at all: trust the persisted record (agent
            // restarted underneath a running server).
            None => cfg.status == ServerState::Online,
        };
        if !expected_online {
            return;
        }

        match orchestrator::probe_tcp(cfg.port, config::probe_timeout()).await {
            Some(latency) => {
                if live {
                    self.supervisor.mark_reachable(&cfg.id, latency).await;
                } else {
                    // Adopted or externally managed process; keep the
                    // snapshot fresh without claiming a handle.
                    self.supervisor.mark_adopted(&cfg.id, Some(latency)).await;
                }
            }
            None => {
                let reason = if live {
                    RecoveryReason::Hung
                } else {
                    RecoveryReason::Zombie
                };
                self.recover(&cfg.id, reason).await;
            }
        }
    }

    /// Marks the server Crashed as a monitor decision (veto, exhausted
    /// budget, failed restart). Registered before the transition so the
    /// echoed Status event is ignored by `watch_crashes` instead of being
    /// fed back into recovery.
    async fn issue_crash_verdict(&self, id: &ServerId) {
        // An already-Crashed entry emits nothing (status events dedup), so
        // registering a verdict for it would swallow the next real crash.
        let already_crashed = self
            .supervisor
            .status(id)
            .await
            .is_some_and(|s| s.state == ServerState::Crashed);
        if !already_crashed {
            self.own_verdicts.lock().await.insert(id.0.clone());
        }
        self.supervisor.mark_crashed(id).await;
    }

    pub async fn recover(&self, id: &ServerId, reason: RecoveryReason) {
        let config = match self.store.find(id).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                tracing::warn!(server_id = %id, "recovery requested for unknown server");
                return;
            }
            Err(err) => {
                tracing::warn!(server_id = %id, error = %err, "recovery aborted: config unavailable");
                return;
            }
        };
        if !config.auto_start {
            tracing::debug!(server_id = %id, "server opted out of supervision; not recovering");
            return;
        }

        let decay_ms = config::recovery_decay_window().as_millis() as u64;
        let attempt = {
            let mut counters = self.counters.lock().await;
            counters
                .entry(id.0.clone())
                .or_default()
                .register_attempt(now_unix_ms(), decay_ms)
        };
        let Some(attempt) = attempt else {
            tracing::error!(
                server_id = %id,
                %reason,
                max_attempts = MAX_RECOVERY_ATTEMPTS,
                "recovery budget exhausted; leaving server down"
            );
            self.issue_crash_verdict(id).await;
            return;
        };
        tracing::warn!(server_id = %id, %reason, attempt, "attempting recovery");

        self.supervisor.mark_recovering(id).await;

        let logs = self.supervisor.logs(id).await;
        let env = EnvInfo {
            executable_exists: config.executable_path().is_file(),
            total_ram_mb: orchestrator::read_meminfo().await.map(|(total, _)| total),
            port: config.port,
        };
        let findings = diagnosis::diagnose(&config, &logs, &env);
        if diagnosis::has_fatal(&findings) {
            for f in findings.iter().filter(|f| f.fatal) {
                tracing::error!(
                    server_id = %id,
                    rule_id = f.rule_id,
                    title = %f.title,
                    recommendation = %f.recommendation,
                    "fatal diagnosis; restart would not help"
                );
            }
            self.issue_crash_verdict(id).await;
            return;
        }

        if self.supervisor.is_live(id).await {
            if let Err(err) = self.supervisor.force_kill(id).await {
                tracing::warn!(server_id = %id, error = %err, "force kill before restart failed");
            }
            tokio::time::sleep(config::recovery_settle_period()).await;
        }

        match self.orchestrator.start(&config, false).await {
            Ok(outcome) => {
                tracing::info!(server_id = %id, ?outcome, attempt, "recovery restart issued");
            }
            Err(err) => {
                tracing::error!(
                    server_id = %id,
                    code = err.code(),
                    error = %err,
                    "recovery restart failed"
                );
                self.issue_crash_verdict(id).await;
            }
        }
    }
}
