//! Per-server process ownership: handles, log ring buffers, the derived
//! status cache and the player roster. One entry per server id; watchdogs
//! are bound to the entry's generation so a timer armed for one run can
//! never touch a later one.

use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use hearth_process::{ResourceUsage, ServerId, ServerState, StatusSnapshot};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{ChildStdin, Command},
    sync::{Mutex, broadcast},
};

use crate::config::{self, ConfigStore};
use crate::console::{self, ConsoleEvent};
use crate::error::SupervisorError;
use crate::events::AgentEvent;

pub(crate) fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the agent dies (crash/kill), ensure the child is terminated.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn signal_group(pgid: i32, signal: libc::c_int) {
    unsafe {
        libc::kill(-pgid, signal);
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: i32, _signal: i32) {}

#[derive(Debug)]
pub struct LogBuffer {
    next_seq: u64,
    max_lines: usize,
    lines: VecDeque<(u64, String)>,
}

impl LogBuffer {
    fn new(max_lines: usize) -> Self {
        Self {
            next_seq: 1,
            max_lines,
            lines: VecDeque::new(),
        }
    }

    fn push_line(&mut self, line: String) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back((seq, line));
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    fn all(&self) -> Vec<String> {
        self.lines.iter().map(|(_, l)| l.clone()).collect()
    }

    fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        // Convenience for UI polling: cursor 0 returns the most recent lines.
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let mut out = Vec::new();
            let mut last = 0;
            for (seq, line) in self.lines.iter().skip(start) {
                out.push(line.clone());
                last = *seq;
            }
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for (seq, line) in self.lines.iter() {
            if *seq > cursor {
                out.push(line.clone());
                last = *seq;
                if out.len() >= limit {
                    break;
                }
            }
        }
        (out, last)
    }
}

/// Fully resolved spawn instruction handed over by the orchestrator.
#[derive(Debug, Clone)]
pub struct LaunchCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub port: u16,
}

#[derive(Debug)]
struct ServerEntry {
    /// Bumped on every launch; tasks spawned for one run carry the value
    /// they were armed with and bail out if the entry has moved on.
    generation: u64,
    state: ServerState,
    last_emitted: Option<ServerState>,
    pid: Option<u32>,
    pgid: Option<i32>,
    stdin: Option<ChildStdin>,
    /// Set right before an operator-initiated shutdown so the exit handler
    /// can tell a stop from a crash.
    expected_stop: bool,
    ready: bool,
    port: u16,
    reachable: bool,
    latency_ms: Option<u32>,
    started_at_unix_ms: u64,
    players: BTreeSet<String>,
    resources: Option<ResourceUsage>,
    logs: Arc<Mutex<LogBuffer>>,
}

impl ServerEntry {
    fn new(generation: u64, port: u16, logs: Arc<Mutex<LogBuffer>>) -> Self {
        Self {
            generation,
            state: ServerState::Offline,
            last_emitted: None,
            pid: None,
            pgid: None,
            stdin: None,
            expected_stop: false,
            ready: false,
            port,
            reachable: false,
            latency_ms: None,
            started_at_unix_ms: 0,
            players: BTreeSet::new(),
            resources: None,
            logs,
        }
    }

    fn is_live(&self) -> bool {
        self.pid.is_some()
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state,
            reachable: self.reachable,
            player_count: self.players.len() as u32,
            players: self.players.iter().cloned().collect(),
            latency_ms: self.latency_ms,
            last_update_unix_ms: now_unix_ms(),
            resources: self.resources,
        }
    }
}

fn transition(
    events: &broadcast::Sender<AgentEvent>,
    id: &ServerId,
    entry: &mut ServerEntry,
    state: ServerState,
) {
    entry.state = state;
    // Emit only on change; repeated transitions to the same state (e.g.
    // watchdog abort followed by the exit handler) broadcast once.
    if entry.last_emitted != Some(state) {
        entry.last_emitted = Some(state);
        let _ = events.send(AgentEvent::Status {
            id: id.clone(),
            state,
        });
    }
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Mutex<HashMap<String, ServerEntry>>>,
    events: broadcast::Sender<AgentEvent>,
    store: Arc<dyn ConfigStore>,
}

impl ProcessSupervisor {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            events,
            store,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    /// Spawns the server process. Fails if a live handle already exists for
    /// this id; a handle is never silently replaced.
    pub async fn launch(&self, id: &ServerId, cmd: LaunchCommand) -> Result<(), SupervisorError> {
        let logs = Arc::new(Mutex::new(LogBuffer::new(config::log_max_lines())));
        let generation;
        {
            let mut map = self.inner.lock().await;
            if map.get(&id.0).is_some_and(|e| e.is_live()) {
                return Err(SupervisorError::HandleExists { id: id.clone() });
            }
            let prev = map.remove(&id.0);
            generation = prev.as_ref().map_or(1, |e| e.generation + 1);
            let mut entry = ServerEntry::new(generation, cmd.port, logs.clone());
            entry.last_emitted = prev.and_then(|e| e.last_emitted);
            transition(&self.events, id, &mut entry, ServerState::Starting);
            map.insert(id.0.clone(), entry);
        }

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .current_dir(&cmd.working_dir)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                command.pre_exec(|| {
                    // New session so the whole process tree can be signaled.
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = match command.spawn() {
            Ok(c) => c,
            Err(e) => {
                let mut map = self.inner.lock().await;
                if let Some(entry) = map.get_mut(&id.0)
                    && entry.generation == generation
                {
                    transition(&self.events, id, entry, ServerState::Offline);
                }
                return Err(SupervisorError::Spawn { source: e });
            }
        };

        let pid = child.id();
        let pgid = pid.map(|p| p as i32);
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        {
            let mut map = self.inner.lock().await;
            if let Some(entry) = map.get_mut(&id.0) {
                entry.pid = pid;
                entry.pgid = pgid;
                entry.stdin = stdin;
                entry.started_at_unix_ms = now_unix_ms();
            }
        }

        self.emit_log(
            id,
            format!(
                "[hearth] exec: {} {} (cwd {})",
                cmd.program.display(),
                cmd.args.join(" "),
                cmd.working_dir.display()
            ),
        )
        .await;

        if let Some(out) = stdout {
            let sup = self.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sup.ingest_line(&id, generation, line).await;
                }
            });
        }
        if let Some(err) = stderr {
            let sup = self.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    sup.ingest_line(&id, generation, line).await;
                }
            });
        }

        // Startup watchdog, disarmed by the first readiness signal.
        {
            let sup = self.clone();
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(config::startup_watchdog_timeout()).await;
                sup.watchdog_fire(&id, generation).await;
            });
        }

        if let Some(pid) = pid {
            self.spawn_resource_sampler(id.clone(), generation, pid);
        }

        {
            let sup = self.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let res = child.wait().await;
                sup.handle_exit(&id, generation, res).await;
            });
        }

        Ok(())
    }

    /// Writes one line to the server's stdin.
    pub async fn send_command(&self, id: &ServerId, text: &str) -> Result<(), SupervisorError> {
        let mut map = self.inner.lock().await;
        let entry = map
            .get_mut(&id.0)
            .filter(|e| e.is_live())
            .ok_or_else(|| SupervisorError::NotRunning { id: id.clone() })?;
        let stdin = entry
            .stdin
            .as_mut()
            .ok_or_else(|| SupervisorError::NotRunning { id: id.clone() })?;

        let mut line = text.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| SupervisorError::Stdin { source: e })?;
        stdin
            .flush()
            .await
            .map_err(|e| SupervisorError::Stdin { source: e })?;
        Ok(())
    }

    /// Graceful shutdown: writes the `stop` console command and arms a kill
    /// timeout that escalates to SIGKILL on the process group.
    ///
    /// Refused while the server is still inside its startup window unless
    /// `force` is set; stopping mid-boot risks corrupting on-disk state.
    pub async fn request_stop(&self, id: &ServerId, force: bool) -> Result<(), SupervisorError> {
        let (generation, has_stdin, pgid) = {
            let mut map = self.inner.lock().await;
            let entry = map
                .get_mut(&id.0)
                .filter(|e| e.is_live())
                .ok_or_else(|| SupervisorError::NotRunning { id: id.clone() })?;
            if matches!(entry.state, ServerState::Starting) && !entry.ready && !force {
                return Err(SupervisorError::StartupProtected { id: id.clone() });
            }
            entry.expected_stop = true;
            transition(&self.events, id, entry, ServerState::Stopping);
            (entry.generation, entry.stdin.is_some(), entry.pgid)
        };

        self.emit_log(
            id,
            format!(
                "[hearth] stop requested (kill timeout {}s)",
                config::stop_timeout().as_secs()
            ),
        )
        .await;

        let mut graceful_sent = false;
        if has_stdin && self.send_command(id, "stop").await.is_ok() {
            graceful_sent = true;
        }
        if !graceful_sent && let Some(pgid) = pgid {
            signal_group(pgid, libc::SIGTERM);
        }

        let sup = self.clone();
        let id = id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(config::stop_timeout()).await;
            sup.escalate_kill(&id, generation).await;
        });
        Ok(())
    }

    /// Unconditional SIGKILL of the process group. Always permitted.
    pub async fn force_kill(&self, id: &ServerId) -> Result<(), SupervisorError> {
        let pgid = {
            let mut map = self.inner.lock().await;
            let entry = map
                .get_mut(&id.0)
                .filter(|e| e.is_live())
                .ok_or_else(|| SupervisorError::NotRunning { id: id.clone() })?;
            entry.expected_stop = true;
            entry.pgid
        };
        self.emit_log(id, "[hearth] force kill requested".to_string())
            .await;
        if let Some(pgid) = pgid {
            signal_group(pgid, libc::SIGKILL);
        }
        Ok(())
    }

    pub async fn status(&self, id: &ServerId) -> Option<StatusSnapshot> {
        let map = self.inner.lock().await;
        map.get(&id.0).map(|e| e.snapshot())
    }

    pub async fn logs(&self, id: &ServerId) -> Vec<String> {
        let logs = {
            let map = self.inner.lock().await;
            match map.get(&id.0) {
                Some(e) => e.logs.clone(),
                None => return Vec::new(),
            }
        };
        let guard = logs.lock().await;
        guard.all()
    }

    /// Cursor-based tail for pollers; cursor 0 means "most recent `limit`".
    pub async fn tail_logs(&self, id: &ServerId, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        let logs = {
            let map = self.inner.lock().await;
            match map.get(&id.0) {
                Some(e) => e.logs.clone(),
                None => return (Vec::new(), cursor),
            }
        };
        let guard = logs.lock().await;
        guard.tail_after(cursor, limit)
    }

    pub async fn is_live(&self, id: &ServerId) -> bool {
        let map = self.inner.lock().await;
        map.get(&id.0).is_some_and(|e| e.is_live())
    }

    /// External reachability update (health probe). Refreshes the cache,
    /// and doubles as a readiness signal while the server is Starting.
    pub async fn mark_reachable(&self, id: &ServerId, latency_ms: u32) {
        let became_online = {
            let mut map = self.inner.lock().await;
            let Some(entry) = map.get_mut(&id.0) else {
                return;
            };
            entry.reachable = true;
            entry.latency_ms = Some(latency_ms);
            if matches!(entry.state, ServerState::Starting) {
                entry.ready = true;
                transition(&self.events, id, entry, ServerState::Online);
                true
            } else {
                false
            }
        };
        if became_online {
            self.persist_state(id, ServerState::Online, false).await;
        }
    }

    /// Adoption: the configured port is already served, so treat the server
    /// as running without spawning. No handle exists afterwards and the
    /// generation is untouched.
    pub async fn mark_adopted(&self, id: &ServerId, latency_ms: Option<u32>) {
        let mut map = self.inner.lock().await;
        let entry = map.entry(id.0.clone()).or_insert_with(|| {
            ServerEntry::new(
                0,
                0,
                Arc::new(Mutex::new(LogBuffer::new(config::log_max_lines()))),
            )
        });
        entry.reachable = true;
        entry.latency_ms = latency_ms;
        entry.ready = true;
        transition(&self.events, id, entry, ServerState::Online);
    }

    /// Health monitor bookkeeping: surface the recovery attempt in the cache.
    pub async fn mark_recovering(&self, id: &ServerId) {
        let mut map = self.inner.lock().await;
        let entry = map.entry(id.0.clone()).or_insert_with(|| {
            ServerEntry::new(
                0,
                0,
                Arc::new(Mutex::new(LogBuffer::new(config::log_max_lines()))),
            )
        });
        entry.reachable = false;
        transition(&self.events, id, entry, ServerState::Recovering);
    }

    /// Terminal verdict when recovery is vetoed (fatal, non-transient cause).
    pub async fn mark_crashed(&self, id: &ServerId) {
        {
            let mut map = self.inner.lock().await;
            let entry = map.entry(id.0.clone()).or_insert_with(|| {
                ServerEntry::new(
                    0,
                    0,
                    Arc::new(Mutex::new(LogBuffer::new(config::log_max_lines()))),
                )
            });
            entry.reachable = false;
            transition(&self.events, id, entry, ServerState::Crashed);
        }
        self.persist_state(id, ServerState::Crashed, true).await;
    }

    async fn emit_log(&self, id: &ServerId, line: String) {
        let logs = {
            let map = self.inner.lock().await;
            match map.get(&id.0) {
                Some(e) => e.logs.clone(),
                None => return,
            }
        };
        logs.lock().await.push_line(line.clone());
        let _ = self.events.send(AgentEvent::Log {
            id: id.clone(),
            line,
        });
    }

    async fn ingest_line(&self, id: &ServerId, generation: u64, line: String) {
        {
            let map = self.inner.lock().await;
            let Some(entry) = map.get(&id.0) else {
                return;
            };
            if entry.generation != generation {
                return;
            }
            entry.logs.lock().await.push_line(line.clone());
        }
        let _ = self.events.send(AgentEvent::Log {
            id: id.clone(),
            line: line.clone(),
        });

        match console::classify(&line) {
            Some(ConsoleEvent::Ready { startup_ms }) => {
                self.observe_ready(id, generation, startup_ms).await
            }
            Some(ConsoleEvent::BindFailure) => {
                self.abort_startup(id, generation, "bind failure").await
            }
            Some(ConsoleEvent::Joined(name)) => {
                let joined = {
                    let mut map = self.inner.lock().await;
                    map.get_mut(&id.0)
                        .filter(|e| e.generation == generation)
                        .is_some_and(|e| e.players.insert(name.clone()))
                };
                if joined {
                    let _ = self.events.send(AgentEvent::PlayerJoined {
                        id: id.clone(),
                        name,
                    });
                }
            }
            Some(ConsoleEvent::Left(name)) => {
                let left = {
                    let mut map = self.inner.lock().await;
                    map.get_mut(&id.0)
                        .filter(|e| e.generation == generation)
                        .is_some_and(|e| e.players.remove(&name))
                };
                if left {
                    let _ = self.events.send(AgentEvent::PlayerLeft {
                        id: id.clone(),
                        name,
                    });
                }
            }
            None => {}
        }
    }

    async fn observe_ready(&self, id: &ServerId, generation: u64, startup_ms: Option<u64>) {
        let became_online = {
            let mut map = self.inner.lock().await;
            let Some(entry) = map.get_mut(&id.0) else {
                return;
            };
            if entry.generation != generation || !matches!(entry.state, ServerState::Starting) {
                return;
            }
            entry.ready = true;
            transition(&self.events, id, entry, ServerState::Online);
            true
        };
        if became_online {
            tracing::info!(server_id = %id, startup_ms, "server is ready");
            self.persist_state(id, ServerState::Online, false).await;
        }
    }

    /// Bind failure while Starting: the boot is doomed, so fail now instead
    /// of waiting out the watchdog.
    async fn abort_startup(&self, id: &ServerId, generation: u64, reason: &str) {
        let pgid = {
            let mut map = self.inner.lock().await;
            let Some(entry) = map.get_mut(&id.0) else {
                return;
            };
            if entry.generation != generation
                || entry.ready
                || !matches!(entry.state, ServerState::Starting)
            {
                return;
            }
            entry.expected_stop = true;
            transition(&self.events, id, entry, ServerState::Offline);
            entry.pgid
        };
        tracing::warn!(server_id = %id, reason, "aborting startup");
        self.emit_log(id, format!("[hearth] startup aborted: {reason}"))
            .await;
        if let Some(pgid) = pgid {
            signal_group(pgid, libc::SIGTERM);
        }
        self.persist_state(id, ServerState::Offline, true).await;
    }

    async fn watchdog_fire(&self, id: &ServerId, generation: u64) {
        let pgid = {
            let mut map = self.inner.lock().await;
            let Some(entry) = map.get_mut(&id.0) else {
                return;
            };
            // Disarmed: readiness observed, a different run, or past Starting.
            if entry.generation != generation
                || entry.ready
                || !matches!(entry.state, ServerState::Starting)
            {
                return;
            }
            entry.expected_stop = true;
            transition(&self.events, id, entry, ServerState::Offline);
            entry.pgid
        };
        tracing::warn!(server_id = %id, "startup watchdog fired; no readiness signal in time");
        self.emit_log(
            id,
            "[hearth] startup watchdog fired: no readiness signal in time".to_string(),
        )
        .await;
        if let Some(pgid) = pgid {
            signal_group(pgid, libc::SIGTERM);
        }
        self.persist_state(id, ServerState::Offline, true).await;
    }

    async fn escalate_kill(&self, id: &ServerId, generation: u64) {
        let pgid = {
            let map = self.inner.lock().await;
            let Some(entry) = map.get(&id.0) else {
                return;
            };
            if entry.generation != generation || !entry.is_live() {
                return;
            }
            entry.pgid
        };
        tracing::warn!(server_id = %id, "graceful stop timed out; escalating to SIGKILL");
        self.emit_log(
            id,
            "[hearth] stop: kill timeout elapsed, sending SIGKILL".to_string(),
        )
        .await;
        if let Some(pgid) = pgid {
            signal_group(pgid, libc::SIGKILL);
        }
    }

    async fn handle_exit(
        &self,
        id: &ServerId,
        generation: u64,
        res: std::io::Result<std::process::ExitStatus>,
    ) {
        let (final_state, code) = {
            let mut map = self.inner.lock().await;
            let Some(entry) = map.get_mut(&id.0) else {
                return;
            };
            if entry.generation != generation {
                return;
            }

            entry.stdin = None;
            entry.pid = None;
            entry.pgid = None;
            entry.players.clear();
            entry.reachable = false;
            entry.latency_ms = None;
            entry.resources = None;

            let code = res.as_ref().ok().and_then(|s| s.code());
            let state = if entry.expected_stop || code == Some(0) {
                ServerState::Offline
            } else {
                ServerState::Crashed
            };
            transition(&self.events, id, entry, state);
            (state, code)
        };

        tracing::info!(server_id = %id, exit_code = ?code, state = ?final_state, "server process exited");
        self.emit_log(
            id,
            format!("[hearth] process exited: state={final_state:?} exit_code={code:?}"),
        )
        .await;
        // A stale startTime after abnormal termination confuses uptime
        // displays and the zombie check; clear it.
        self.persist_state(id, final_state, final_state == ServerState::Crashed)
            .await;
    }

    async fn persist_state(&self, id: &ServerId, state: ServerState, clear_start_time: bool) {
        let res = async {
            let Some(mut cfg) = self.store.find(id).await? else {
                return Ok(());
            };
            cfg.status = state;
            if clear_start_time {
                cfg.start_time_unix_ms = None;
            }
            self.store.save(&cfg).await
        }
        .await;
        if let Err(err) = res {
            tracing::warn!(server_id = %id, error = %err, "failed to persist status transition");
        }
    }

    fn spawn_resource_sampler(&self, id: ServerId, generation: u64, pid: u32) {
        let sup = self.clone();
        tokio::spawn(async move {
            let mut last: Option<(u64, tokio::time::Instant)> = None;
            let interval = config::resource_sample_interval();

            loop {
                let now = tokio::time::Instant::now();
                let Some(ticks) = read_proc_cpu_ticks(pid).await else {
                    break;
                };
                let rss_bytes = read_proc_rss_bytes(pid).await.unwrap_or(0);
                let cpu_percent_x100 = last
                    .map(|(prev_ticks, prev_at)| cpu_percent_x100(prev_ticks, prev_at, ticks, now))
                    .unwrap_or(0);
                last = Some((ticks, now));

                let usage = ResourceUsage {
                    cpu_percent_x100,
                    rss_bytes,
                };
                {
                    let mut map = sup.inner.lock().await;
                    let Some(entry) = map.get_mut(&id.0) else {
                        break;
                    };
                    if entry.generation != generation || entry.pid != Some(pid) {
                        break;
                    }
                    entry.resources = Some(usage);
                }
                let _ = sup.events.send(AgentEvent::Stats {
                    id: id.clone(),
                    usage,
                });

                tokio::time::sleep(interval).await;
            }
        });
    }
}

#[cfg(target_os = "linux")]
fn ticks_per_sec() -> u64 {
    static TICKS: std::sync::OnceLock<u64> = std::sync::OnceLock::new();
    *TICKS.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_CLK_TCK);
        if v <= 0 { 100 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
fn ticks_per_sec() -> u64 {
    100
}

#[cfg(target_os = "linux")]
fn page_size() -> u64 {
    static PAGE: std::sync::OnceLock<u64> = std::sync::OnceLock::new();
    *PAGE.get_or_init(|| unsafe {
        let v = libc::sysconf(libc::_SC_PAGESIZE);
        if v <= 0 { 4096 } else { v as u64 }
    })
}

#[cfg(not(target_os = "linux"))]
fn page_size() -> u64 {
    4096
}

#[cfg(target_os = "linux")]
async fn read_proc_cpu_ticks(pid: u32) -> Option<u64> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/stat"))
        .await
        .ok()?;
    let end = s.rfind(')')?;
    let rest = s.get((end + 2)..)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = parts.get(11)?.parse().ok()?;
    let stime: u64 = parts.get(12)?.parse().ok()?;
    Some(utime.saturating_add(stime))
}

#[cfg(not(target_os = "linux"))]
async fn read_proc_cpu_ticks(_pid: u32) -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
async fn read_proc_rss_bytes(pid: u32) -> Option<u64> {
    let s = tokio::fs::read_to_string(format!("/proc/{pid}/statm"))
        .await
        .ok()?;
    let mut it = s.split_whitespace();
    let _size_pages = it.next()?;
    let resident_pages: u64 = it.next()?.parse().ok()?;
    Some(resident_pages.saturating_mul(page_size()))
}

#[cfg(not(target_os = "linux"))]
async fn read_proc_rss_bytes(_pid: u32) -> Option<u64> {
    None
}

fn cpu_percent_x100(
    prev_ticks: u64,
    prev_at: tokio::time::Instant,
    ticks: u64,
    now: tokio::time::Instant,
) -> u32 {
    let dt = now.duration_since(prev_at).as_secs_f64();
    if dt <= 0.0 {
        return 0;
    }
    let delta_ticks = ticks.saturating_sub(prev_ticks) as f64;
    let cpu = (delta_ticks / ticks_per_sec() as f64) / dt * 100.0;
    // 1/100 of a percent.
    let x100 = (cpu * 100.0).round();
    if x100.is_finite() {
        x100.clamp(0.0, u32::MAX as f64) as u32
    } else {
        0
    }
}

#[cfg(all(test, unix))]
mod tests {
    use hearth_process::ServerState;

    use super::*;
    use crate::config::JsonConfigStore;

    fn sh(script: &str) -> LaunchCommand {
        LaunchCommand {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: PathBuf::from("/tmp"),
            env: Vec::new(),
            port: 0,
        }
    }

    async fn test_supervisor() -> (ProcessSupervisor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonConfigStore::open(dir.path().join("servers.json"))
            .await
            .unwrap();
        (ProcessSupervisor::new(Arc::new(store)), dir)
    }

    async fn wait_for_state(sup: &ProcessSupervisor, id: &ServerId, state: ServerState) {
        for _ in 0..100 {
            if sup.status(id).await.map(|s| s.state) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!(
            "timed out waiting for {state:?}, last = {:?}",
            sup.status(id).await.map(|s| s.state)
        );
    }

    #[tokio::test]
    async fn second_launch_with_live_handle_fails() {
        let (sup, _dir) = test_supervisor().await;
        let id = ServerId("dup".to_string());

        sup.launch(&id, sh("sleep 10")).await.unwrap();
        let err = sup.launch(&id, sh("sleep 10")).await.unwrap_err();
        assert_eq!(err.code(), "handle_exists");

        sup.force_kill(&id).await.unwrap();
        wait_for_state(&sup, &id, ServerState::Offline).await;
    }

    #[tokio::test]
    async fn stop_while_starting_is_refused_without_force() {
        let (sup, _dir) = test_supervisor().await;
        let id = ServerId("boot".to_string());

        sup.launch(&id, sh("sleep 10")).await.unwrap();
        let err = sup.request_stop(&id, false).await.unwrap_err();
        assert_eq!(err.code(), "startup_protected");
        // Still starting; the stop command was never sent.
        assert_eq!(
            sup.status(&id).await.unwrap().state,
            ServerState::Starting
        );

        sup.force_kill(&id).await.unwrap();
        wait_for_state(&sup, &id, ServerState::Offline).await;
    }

    #[tokio::test]
    async fn unexpected_nonzero_exit_marks_crashed() {
        let (sup, _dir) = test_supervisor().await;
        let id = ServerId("crash".to_string());

        sup.launch(&id, sh("exit 3")).await.unwrap();
        wait_for_state(&sup, &id, ServerState::Crashed).await;
        assert!(!sup.is_live(&id).await);
        let snap = sup.status(&id).await.unwrap();
        assert!(!snap.reachable);
        assert_eq!(snap.player_count, 0);
    }

    #[tokio::test]
    async fn operator_stop_ends_offline() {
        let (sup, _dir) = test_supervisor().await;
        let id = ServerId("stop".to_string());

        // `read` blocks until the graceful stop line arrives on stdin.
        sup.launch(&id, sh("read line; exit 0")).await.unwrap();
        // Simulate the external reachability probe confirming readiness.
        sup.mark_reachable(&id, 3).await;
        assert_eq!(sup.status(&id).await.unwrap().state, ServerState::Online);

        sup.request_stop(&id, false).await.unwrap();
        wait_for_state(&sup, &id, ServerState::Offline).await;
    }

    #[tokio::test]
    async fn ready_console_line_transitions_online() {
        let (sup, _dir) = test_supervisor().await;
        let id = ServerId("ready".to_string());

        sup.launch(
            &id,
            sh(r#"echo 'Done (1.234s)! For help, type "help"'; sleep 10"#),
        )
        .await
        .unwrap();
        wait_for_state(&sup, &id, ServerState::Online).await;

        sup.force_kill(&id).await.unwrap();
        wait_for_state(&sup, &id, ServerState::Offline).await;
    }

    #[tokio::test]
    async fn roster_tracks_joins_and_leaves() {
        let (sup, _dir) = test_supervisor().await;
        let id = ServerId("roster".to_string());

        sup.launch(
            &id,
            sh("echo '[INFO]: Alice joined the game'; \
                echo '[INFO]: Bob joined the game'; \
                echo '[INFO]: Alice left the game'; \
                sleep 10"),
        )
        .await
        .unwrap();

        for _ in 0..100 {
            let snap = sup.status(&id).await.unwrap();
            if snap.players == vec!["Bob".to_string()] {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let snap = sup.status(&id).await.unwrap();
        assert_eq!(snap.players, vec!["Bob".to_string()]);
        assert_eq!(snap.player_count, 1);

        sup.force_kill(&id).await.unwrap();
        wait_for_state(&sup, &id, ServerState::Offline).await;
    }

    #[tokio::test]
    async fn bind_failure_short_circuits_to_offline_once() {
        let (sup, _dir) = test_supervisor().await;
        let id = ServerId("bind".to_string());
        let mut events = sup.subscribe();

        sup.launch(&id, sh("echo '**** FAILED TO BIND TO PORT!'; sleep 10"))
            .await
            .unwrap();
        wait_for_state(&sup, &id, ServerState::Offline).await;
        assert!(!sup.is_live(&id).await);

        // Drain events: the abort and the exit handler both land on Offline,
        // but the transition must have been broadcast exactly once.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let mut offline_events = 0;
        while let Ok(ev) = events.try_recv() {
            if let AgentEvent::Status { state, .. } = ev
                && state == ServerState::Offline
            {
                offline_events += 1;
            }
        }
        assert_eq!(offline_events, 1);
    }

    #[tokio::test]
    async fn watchdog_is_disarmed_by_readiness() {
        let (sup, _dir) = test_supervisor().await;
        let id = ServerId("wd".to_string());

        sup.launch(&id, sh("sleep 10")).await.unwrap();
        sup.mark_reachable(&id, 1).await;
        assert_eq!(sup.status(&id).await.unwrap().state, ServerState::Online);

        // A late watchdog for the same generation must be a no-op.
        sup.watchdog_fire(&id, 1).await;
        assert_eq!(sup.status(&id).await.unwrap().state, ServerState::Online);

        sup.force_kill(&id).await.unwrap();
        wait_for_state(&sup, &id, ServerState::Offline).await;
    }

    #[tokio::test]
    async fn stale_watchdog_from_previous_generation_is_ignored() {
        let (sup, _dir) = test_supervisor().await;
        let id = ServerId("gen".to_string());

        sup.launch(&id, sh("exit 0")).await.unwrap();
        wait_for_state(&sup, &id, ServerState::Offline).await;

        sup.launch(&id, sh("sleep 10")).await.unwrap();
        // Generation 1's watchdog firing late must not touch generation 2.
        sup.watchdog_fire(&id, 1).await;
        assert_eq!(
            sup.status(&id).await.unwrap().state,
            ServerState::Starting
        );

        sup.force_kill(&id).await.unwrap();
        wait_for_state(&sup, &id, ServerState::Offline).await;
    }

    #[tokio::test]
    async fn watchdog_forces_offline_when_never_ready() {
        let (sup, _dir) = test_supervisor().await;
        let id = ServerId("wd2".to_string());

        sup.launch(&id, sh("sleep 10")).await.unwrap();
        // Drive the watchdog directly instead of waiting out the timer.
        sup.watchdog_fire(&id, 1).await;
        wait_for_state(&sup, &id, ServerState::Offline).await;
        assert!(!sup.is_live(&id).await);
    }

    #[tokio::test]
    async fn send_command_to_dead_server_fails() {
        let (sup, _dir) = test_supervisor().await;
        let id = ServerId("dead".to_string());
        let err = sup.send_command(&id, "say hi").await.unwrap_err();
        assert_eq!(err.code(), "not_running");
    }

    #[tokio::test]
    async fn tail_logs_cursor_returns_only_new_lines() {
        let (sup, _dir) = test_supervisor().await;
        let id = ServerId("logs".to_string());

        sup.launch(&id, sh("echo one; echo two; sleep 10"))
            .await
            .unwrap();
        for _ in 0..100 {
            if sup.logs(&id).await.iter().any(|l| l == "two") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let (all, cursor) = sup.tail_logs(&id, 0, 100).await;
        assert!(all.iter().any(|l| l == "one"));
        let (rest, _) = sup.tail_logs(&id, cursor, 100).await;
        assert!(rest.is_empty());

        sup.force_kill(&id).await.unwrap();
        wait_for_state(&sup, &id, ServerState::Offline).await;
    }

    #[tokio::test]
    async fn adoption_does_not_advance_generation() {
        let (sup, _dir) = test_supervisor().await;
        let id = ServerId("adopt".to_string());

        sup.launch(&id, sh("sleep 10")).await.unwrap();
        sup.force_kill(&id).await.unwrap();
        wait_for_state(&sup, &id, ServerState::Offline).await;
        let before = sup.inner.lock().await.get(&id.0).unwrap().generation;

        // Re-attaching to an externally running instance must not look like
        // a new run: stale watchdogs stay disarmed by the generation check,
        // not by a bump.
        sup.mark_adopted(&id, Some(5)).await;
        {
            let map = sup.inner.lock().await;
            let entry = map.get(&id.0).unwrap();
            assert_eq!(entry.generation, before);
            assert_eq!(entry.state, ServerState::Online);
            assert!(entry.reachable);
        }

        // A fresh entry created purely by adoption carries generation 0.
        let other = ServerId("adopt2".to_string());
        sup.mark_adopted(&other, None).await;
        assert_eq!(sup.inner.lock().await.get(&other.0).unwrap().generation, 0);
    }

    #[test]
    fn log_buffer_overwrites_oldest() {
        let mut buf = LogBuffer::new(3);
        for i in 0..5 {
            buf.push_line(format!("line {i}"));
        }
        assert_eq!(buf.all(), vec!["line 2", "line 3", "line 4"]);
        let (lines, last) = buf.tail_after(0, 2);
        assert_eq!(lines, vec!["line 3", "line 4"]);
        assert_eq!(last, 5);
    }

    #[tokio::test]
    async fn crash_clears_persisted_start_time() {
        use crate::config::{ConfigStore, LoaderKind, ServerConfig};

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            JsonConfigStore::open(dir.path().join("servers.json"))
                .await
                .unwrap(),
        );
        let id = ServerId("persist".to_string());
        store
            .save(&ServerConfig {
                id: id.clone(),
                name: "p".to_string(),
                working_dir: PathBuf::from("/tmp"),
                port: 25565,
                ram_gb: 1,
                java_version: "21".to_string(),
                loader: LoaderKind::Vanilla,
                executable: PathBuf::from("server.jar"),
                performance_flags: false,
                niceness: None,
                status: ServerState::Starting,
                start_time_unix_ms: Some(123),
                auto_start: true,
                check_interval_secs: 30,
            })
            .await
            .unwrap();

        let sup = ProcessSupervisor::new(store.clone());
        sup.launch(&id, sh("exit 7")).await.unwrap();
        wait_for_state(&sup, &id, ServerState::Crashed).await;
        // persist_state runs after the transition; give it a beat.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let cfg = store.find(&id).await.unwrap().unwrap();
        assert_eq!(cfg.status, ServerState::Crashed);
        assert_eq!(cfg.start_time_unix_ms, None);
    }
}
