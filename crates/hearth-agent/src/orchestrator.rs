//! Entry point for "start this server": safety gate, port probe (adopt vs
//! spawn), environment validation, runtime resolution, launch-command
//! assembly and the hand-off to the supervisor.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use anyhow::Context;
use hearth_process::{ServerId, ServerState};
use tokio::net::TcpStream;

use crate::config::{self, ConfigStore, ServerConfig};
use crate::error::{SafetyError, StartError};
use crate::runtime::RuntimeResolver;
use crate::safety;
use crate::supervisor::{LaunchCommand, ProcessSupervisor, now_unix_ms};

/// Aikar's G1 tuning bundle, applied when a server opts into
/// performance flags.
const PERFORMANCE_FLAGS: &[&str] = &[
    "-XX:+UseG1GC",
    "-XX:+ParallelRefProcEnabled",
    "-XX:MaxGCPauseMillis=200",
    "-XX:+UnlockExperimentalVMOptions",
    "-XX:+DisableExplicitGC",
    "-XX:+AlwaysPreTouch",
    "-XX:G1NewSizePercent=30",
    "-XX:G1MaxNewSizePercent=40",
    "-XX:G1HeapRegionSize=8M",
    "-XX:G1ReservePercent=20",
    "-XX:InitiatingHeapOccupancyPercent=15",
    "-XX:+PerfDisableSharedMem",
    "-XX:MaxTenuringThreshold=1",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A fresh process was spawned and handed to the supervisor.
    Launched,
    /// The configured port was already served; the running instance was
    /// adopted instead of spawning a second one.
    Adopted,
}

/// Short-timeout TCP connect; Some(latency) when the port accepted.
pub(crate) async fn probe_tcp(port: u16, timeout: Duration) -> Option<u32> {
    let started = tokio::time::Instant::now();
    match tokio::time::timeout(timeout, TcpStream::connect(("127.0.0.1", port))).await {
        Ok(Ok(stream)) => {
            drop(stream);
            Some(started.elapsed().as_millis() as u32)
        }
        _ => None,
    }
}

struct OpGuard {
    set: Arc<StdMutex<HashSet<String>>>,
    id: String,
}

impl OpGuard {
    fn acquire(set: &Arc<StdMutex<HashSet<String>>>, id: &ServerId) -> Option<Self> {
        let mut guard = set.lock().unwrap_or_else(|e| e.into_inner());
        if !guard.insert(id.0.clone()) {
            return None;
        }
        Some(Self {
            set: set.clone(),
            id: id.0.clone(),
        })
    }
}

impl Drop for OpGuard {
    fn drop(&mut self) {
        let mut guard = self.set.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(&self.id);
    }
}

pub struct StartupOrchestrator {
    supervisor: ProcessSupervisor,
    store: Arc<dyn ConfigStore>,
    runtime: Arc<dyn RuntimeResolver>,
    in_flight: Arc<StdMutex<HashSet<String>>>,
}

impl StartupOrchestrator {
    pub fn new(
        supervisor: ProcessSupervisor,
        store: Arc<dyn ConfigStore>,
        runtime: Arc<dyn RuntimeResolver>,
    ) -> Self {
        Self {
            supervisor,
            store,
            runtime,
            in_flight: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    pub async fn start(
        &self,
        config: &ServerConfig,
        force: bool,
    ) -> Result<StartOutcome, StartError> {
        let _guard = OpGuard::acquire(&self.in_flight, &config.id).ok_or_else(|| {
            StartError::OperationInProgress {
                id: config.id.clone(),
            }
        })?;

        if !force {
            safety::validate(config)?;
        }

        // Port already served: either this server's own untracked instance
        // or a foreign occupant. The two cases are indistinguishable from
        // the port alone, so adopt optimistically rather than refuse.
        if let Some(latency) = probe_tcp(config.port, config::probe_timeout()).await {
            tracing::info!(
                server_id = %config.id,
                port = config.port,
                latency_ms = latency,
                "configured port already open; adopting running instance"
            );
            self.supervisor
                .mark_adopted(&config.id, Some(latency))
                .await;
            let mut cfg = config.clone();
            cfg.status = ServerState::Online;
            self.store.save(&cfg).await.map_err(StartError::Other)?;
            return Ok(StartOutcome::Adopted);
        }

        self.validate_environment(config).await?;

        let java = self
            .runtime
            .ensure(&config.java_version)
            .await
            .map_err(|e| StartError::Runtime {
                message: e.to_string(),
            })?;

        let args = build_launch_args(config).map_err(StartError::Other)?;
        let (program, args) = wrap_priority(java, args, config.niceness);

        // server.properties follows the persisted config, never the other
        // way around; otherwise the process binds a drifted port.
        sync_server_port(&config.working_dir, config.port).map_err(StartError::Other)?;

        let mut cfg = config.clone();
        cfg.status = ServerState::Starting;
        cfg.start_time_unix_ms = Some(now_unix_ms());
        self.store.save(&cfg).await.map_err(StartError::Other)?;

        let launch = LaunchCommand {
            program,
            args,
            working_dir: config.working_dir.clone(),
            env: Vec::new(),
            port: config.port,
        };
        if let Err(err) = self.supervisor.launch(&config.id, launch).await {
            // No process was left behind; roll the persisted record back.
            if let Err(persist_err) = self.store.save(config).await {
                tracing::warn!(
                    server_id = %config.id,
                    error = %persist_err,
                    "failed to roll back status after launch failure"
                );
            }
            return Err(err.into());
        }
        Ok(StartOutcome::Launched)
    }

    async fn validate_environment(&self, config: &ServerConfig) -> Result<(), StartError> {
        if !config.working_dir.is_dir() {
            return Err(StartError::MissingWorkingDir {
                path: config.working_dir.clone(),
            });
        }

        let allocated_mb = config.ram_gb as u64 * 1024;
        check_memory(&config.id, allocated_mb, read_meminfo().await)?;

        if let Some(dir) = config.loader.content_dir() {
            let path = config.working_dir.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .with_context(|| format!("create {}", path.display()))
                .map_err(StartError::Other)?;
        }

        let exec = config.executable_path();
        if !exec.is_file() && find_unix_args(&config.working_dir).is_none() {
            return Err(StartError::Safety(SafetyError::MissingExecutable {
                path: exec,
            }));
        }
        Ok(())
    }
}

fn check_memory(
    id: &ServerId,
    allocated_mb: u64,
    meminfo: Option<(u64, u64)>,
) -> Result<(), StartError> {
    let Some((total_mb, available_mb)) = meminfo else {
        return Ok(());
    };
    if allocated_mb > total_mb {
        return Err(StartError::InsufficientMemory {
            allocated_mb,
            total_mb,
        });
    }
    if allocated_mb > available_mb {
        tracing::warn!(
            server_id = %id,
            allocated_mb,
            available_mb,
            "allocation exceeds currently free memory; the server may swap"
        );
    }
    Ok(())
}

/// (MemTotal, MemAvailable) in MiB.
#[cfg(target_os = "linux")]
pub(crate) async fn read_meminfo() -> Option<(u64, u64)> {
    let s = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
    parse_meminfo(&s)
}

#[cfg(not(target_os = "linux"))]
pub(crate) async fn read_meminfo() -> Option<(u64, u64)> {
    None
}

fn parse_meminfo(s: &str) -> Option<(u64, u64)> {
    fn parse_kb(v: &str) -> Option<u64> {
        v.trim().strip_suffix("kB")?.trim().parse().ok()
    }

    let mut total_kb = None;
    let mut available_kb = None;
    for line in s.lines() {
        if let Some(v) = line.strip_prefix("MemTotal:") {
            total_kb = parse_kb(v);
        } else if let Some(v) = line.strip_prefix("MemAvailable:") {
            available_kb = parse_kb(v);
        }
    }
    Some((total_kb? / 1024, available_kb.unwrap_or(0) / 1024))
}

/// JVM argument list for the server. The JVM honors the last -Xmx it
/// sees, so the configured ceiling is placed after any loader @files to
/// keep them from overriding it.
fn build_launch_args(config: &ServerConfig) -> anyhow::Result<Vec<String>> {
    let xmx = format!("-Xmx{}M", config.ram_gb.max(1) as u64 * 1024);

    if config.loader.uses_args_files()
        && let Some(unix_args) = find_unix_args(&config.working_dir)
    {
        // Forge/NeoForge generate run.sh plus JVM argument files. Parsing
        // the argument files directly (instead of re-invoking run.sh)
        // keeps control over the working directory and environment.
        let mut args = Vec::new();
        let user_jvm = config.working_dir.join("user_jvm_args.txt");
        if user_jvm.is_file() {
            args.push(format!("@{}", to_rel_str(&config.working_dir, &user_jvm)?));
        }
        args.push(format!("@{}", to_rel_str(&config.working_dir, &unix_args)?));
        args.push(xmx);
        if config.performance_flags {
            args.extend(PERFORMANCE_FLAGS.iter().map(|s| s.to_string()));
        }
        args.push("nogui".to_string());
        return Ok(args);
    }

    let exec = config.executable_path();
    let jar = to_rel_str(&config.working_dir, &exec)
        .unwrap_or_else(|_| exec.display().to_string());
    let mut args = vec![xmx];
    if config.performance_flags {
        args.extend(PERFORMANCE_FLAGS.iter().map(|s| s.to_string()));
    }
    args.push("-jar".to_string());
    args.push(jar);
    args.push("nogui".to_string());
    Ok(args)
}

/// Unix `nice -n <n> java ...`; no-op wrapping elsewhere.
fn wrap_priority(java: PathBuf, args: Vec<String>, niceness: Option<i32>) -> (PathBuf, Vec<String>) {
    match niceness {
        Some(n) if cfg!(unix) => {
            let mut wrapped = vec!["-n".to_string(), n.to_string(), java.display().to_string()];
            wrapped.extend(args);
            (PathBuf::from("nice"), wrapped)
        }
        _ => (java, args),
    }
}

fn collect_named_files(root: &Path, file_name: &str, out: &mut Vec<PathBuf>) {
    let rd = match std::fs::read_dir(root) {
        Ok(v) => v,
        Err(_) => return,
    };
    for e in rd.flatten() {
        let path = e.path();
        let meta = match std::fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if meta.file_type().is_symlink() {
            continue;
        }
        if meta.is_dir() {
            collect_named_files(&path, file_name, out);
            continue;
        }
        if meta.is_file()
            && path
                .file_name()
                .and_then(|s| s.to_str())
                .is_some_and(|n| n == file_name)
        {
            out.push(path);
        }
    }
}

fn best_candidate(mut candidates: Vec<PathBuf>) -> Option<PathBuf> {
    if candidates.is_empty() {
        return None;
    }
    candidates.sort_by(|a, b| {
        let la = a.components().count();
        let lb = b.components().count();
        la.cmp(&lb)
            .then_with(|| a.to_string_lossy().cmp(&b.to_string_lossy()))
    });
    candidates.into_iter().next()
}

fn find_unix_args(working_dir: &Path) -> Option<PathBuf> {
    // Forge/NeoForge server packs place args under libraries/**/unix_args.txt.
    let mut out = Vec::<PathBuf>::new();
    let libs = working_dir.join("libraries");
    if libs.is_dir() {
        collect_named_files(&libs, "unix_args.txt", &mut out);
    }
    if out.is_empty() {
        collect_named_files(working_dir, "unix_args.txt", &mut out);
    }
    best_candidate(out)
}

fn to_rel_str(base: &Path, path: &Path) -> anyhow::Result<String> {
    let rel = path
        .strip_prefix(base)
        .map_err(|_| anyhow::anyhow!("path is outside the working directory"))?;
    let s = rel.to_string_lossy().to_string();
    if s.trim().is_empty() {
        anyhow::bail!("invalid relative path");
    }
    Ok(s)
}

/// Rewrites only the server-port key; every other line is preserved as-is.
fn sync_server_port(working_dir: &Path, port: u16) -> anyhow::Result<()> {
    let path = working_dir.join("server.properties");
    let existing = std::fs::read_to_string(&path).unwrap_or_default();

    let mut out = String::new();
    let mut wrote_port = false;
    for line in existing.lines() {
        if line.starts_with("server-port=") {
            out.push_str(&format!("server-port={port}\n"));
            wrote_port = true;
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }
    if !wrote_port {
        out.push_str(&format!("server-port={port}\n"));
    }

    let tmp = working_dir.join("server.properties.tmp");
    std::fs::write(&tmp, out.as_bytes()).context("write server.properties.tmp")?;
    std::fs::rename(tmp, path).context("persist server.properties")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::config::{JsonConfigStore, LoaderKind};

    fn sample_config(id: &str, dir: &Path, port: u16) -> ServerConfig {
        ServerConfig {
            id: ServerId(id.to_string()),
            name: id.to_string(),
            working_dir: dir.to_path_buf(),
            port,
            ram_gb: 1,
            java_version: "21".to_string(),
            loader: LoaderKind::Vanilla,
            executable: PathBuf::from("server.jar"),
            performance_flags: false,
            niceness: None,
            status: ServerState::Offline,
            start_time_unix_ms: None,
            auto_start: false,
            check_interval_secs: 30,
        }
    }

    /// Records whether `ensure` was ever reached.
    struct TrackingRuntime {
        called: AtomicBool,
    }

    #[async_trait::async_trait]
    impl RuntimeResolver for TrackingRuntime {
        async fn ensure(&self, _version_label: &str) -> anyhow::Result<PathBuf> {
            self.called.store(true, Ordering::SeqCst);
            Ok(PathBuf::from("java"))
        }
    }

    async fn orchestrator_in(
        dir: &Path,
    ) -> (StartupOrchestrator, Arc<JsonConfigStore>, Arc<TrackingRuntime>) {
        let store = Arc::new(
            JsonConfigStore::open(dir.join("servers.json")).await.unwrap(),
        );
        let runtime = Arc::new(TrackingRuntime {
            called: AtomicBool::new(false),
        });
        let sup = ProcessSupervisor::new(store.clone());
        (
            StartupOrchestrator::new(sup, store.clone(), runtime.clone()),
            store,
            runtime,
        )
    }

    fn unused_port() -> u16 {
        // Bind an ephemeral port, then drop the listener so it's closed.
        let l = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        l.local_addr().unwrap().port()
    }

    #[test]
    fn op_guard_rejects_concurrent_acquire() {
        let set = Arc::new(StdMutex::new(HashSet::new()));
        let id = ServerId("srv".to_string());
        let first = OpGuard::acquire(&set, &id).unwrap();
        assert!(OpGuard::acquire(&set, &id).is_none());
        drop(first);
        assert!(OpGuard::acquire(&set, &id).is_some());
    }

    #[test]
    fn memory_check_hard_fails_over_total() {
        let id = ServerId("m".to_string());
        let err = check_memory(&id, 2048, Some((1024, 512))).unwrap_err();
        assert_eq!(err.code(), "insufficient_memory");
        // Over available but under total is only a warning.
        assert!(check_memory(&id, 900, Some((1024, 512))).is_ok());
        // No meminfo (non-linux): skip the check.
        assert!(check_memory(&id, u64::MAX, None).is_ok());
    }

    #[test]
    fn parses_meminfo_fields() {
        let s = "MemTotal:       16303168 kB\nMemFree:  1048576 kB\nMemAvailable:    8151584 kB\n";
        assert_eq!(parse_meminfo(s), Some((15921, 7960)));
    }

    #[test]
    fn jar_launch_args_include_xmx_and_nogui() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = sample_config("a", dir.path(), 25565);
        cfg.ram_gb = 4;
        let args = build_launch_args(&cfg).unwrap();
        assert_eq!(
            args,
            vec!["-Xmx4096M", "-jar", "server.jar", "nogui"]
        );

        cfg.performance_flags = true;
        let args = build_launch_args(&cfg).unwrap();
        assert!(args.contains(&"-XX:+UseG1GC".to_string()));
        assert_eq!(args.last().unwrap(), "nogui");
    }

    #[test]
    fn forge_launch_args_use_argument_files() {
        let dir = tempfile::tempdir().unwrap();
        let args_dir = dir.path().join("libraries/net/minecraftforge/forge/1.20.1");
        std::fs::create_dir_all(&args_dir).unwrap();
        std::fs::write(args_dir.join("unix_args.txt"), b"-p libs\n").unwrap();
        std::fs::write(dir.path().join("user_jvm_args.txt"), b"-Xms512M\n").unwrap();

        let mut cfg = sample_config("f", dir.path(), 25565);
        cfg.loader = LoaderKind::Forge;
        let args = build_launch_args(&cfg).unwrap();
        assert_eq!(args[0], "@user_jvm_args.txt");
        assert_eq!(
            args[1],
            "@libraries/net/minecraftforge/forge/1.20.1/unix_args.txt"
        );
        assert!(args.contains(&"-Xmx1024M".to_string()));
        assert_eq!(args.last().unwrap(), "nogui");
    }

    #[test]
    fn priority_wrapping_uses_nice() {
        let (program, args) =
            wrap_priority(PathBuf::from("java"), vec!["-jar".to_string()], Some(10));
        assert_eq!(program, PathBuf::from("nice"));
        assert_eq!(args, vec!["-n", "10", "java", "-jar"]);

        let (program, args) =
            wrap_priority(PathBuf::from("java"), vec!["-jar".to_string()], None);
        assert_eq!(program, PathBuf::from("java"));
        assert_eq!(args, vec!["-jar"]);
    }

    #[test]
    fn sync_server_port_rewrites_only_port_key() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("server.properties"),
            "motd=A Minecraft Server\nserver-port=25599\nmax-players=20\n",
        )
        .unwrap();

        sync_server_port(dir.path(), 25565).unwrap();
        let text = std::fs::read_to_string(dir.path().join("server.properties")).unwrap();
        assert!(text.contains("server-port=25565\n"));
        assert!(text.contains("motd=A Minecraft Server\n"));
        assert!(text.contains("max-players=20\n"));
        assert!(!text.contains("25599"));
    }

    #[tokio::test]
    async fn safety_rejection_propagates_with_code() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _store, runtime) = orchestrator_in(dir.path()).await;
        // No server.jar on disk.
        let cfg = sample_config("s", dir.path(), unused_port());

        let err = orch.start(&cfg, false).await.unwrap_err();
        assert_eq!(err.code(), "missing_executable");
        assert!(!runtime.called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn oversized_allocation_fails_before_runtime_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _store, runtime) = orchestrator_in(dir.path()).await;
        std::fs::write(dir.path().join("server.jar"), b"jar").unwrap();

        let mut cfg = sample_config("big", dir.path(), unused_port());
        cfg.ram_gb = 1_000_000;
        let err = orch.start(&cfg, false).await.unwrap_err();
        assert_eq!(err.code(), "insufficient_memory");
        assert!(!runtime.called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn open_port_is_adopted_without_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, store, runtime) = orchestrator_in(dir.path()).await;
        std::fs::write(dir.path().join("server.jar"), b"jar").unwrap();

        // Something is already serving the configured port.
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let cfg = sample_config("adopt", dir.path(), port);
        store.save(&cfg).await.unwrap();

        let outcome = orch.start(&cfg, false).await.unwrap();
        assert_eq!(outcome, StartOutcome::Adopted);
        assert!(!runtime.called.load(Ordering::SeqCst));
        assert!(!orch.supervisor.is_live(&cfg.id).await);
        assert_eq!(
            orch.supervisor.status(&cfg.id).await.unwrap().state,
            ServerState::Online
        );
        let persisted = store.find(&cfg.id).await.unwrap().unwrap();
        assert_eq!(persisted.status, ServerState::Online);
        drop(listener);
    }
}
