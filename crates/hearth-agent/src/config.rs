use std::{collections::HashMap, path::PathBuf, time::Duration};

use anyhow::Context;
use hearth_process::{ServerId, ServerState};
use tokio::{io::AsyncWriteExt, sync::Mutex};

pub(crate) fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
}

pub(crate) fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

pub fn log_max_lines() -> usize {
    env_usize("HEARTH_LOG_MAX_LINES")
        .map(|v| v.clamp(100, 50_000))
        .unwrap_or(1000)
}

pub fn startup_watchdog_timeout() -> Duration {
    Duration::from_secs(
        env_u64("HEARTH_STARTUP_WATCHDOG_SEC")
            .map(|v| v.clamp(10, 1800))
            .unwrap_or(180),
    )
}

pub fn stop_timeout() -> Duration {
    Duration::from_secs(
        env_u64("HEARTH_STOP_TIMEOUT_SEC")
            .map(|v| v.clamp(5, 600))
            .unwrap_or(30),
    )
}

pub fn probe_timeout() -> Duration {
    Duration::from_millis(
        env_u64("HEARTH_PROBE_TIMEOUT_MS")
            .map(|v| v.clamp(100, 10_000))
            .unwrap_or(800),
    )
}

pub fn monitor_tick() -> Duration {
    Duration::from_secs(
        env_u64("HEARTH_MONITOR_TICK_SEC")
            .map(|v| v.clamp(2, 300))
            .unwrap_or(10),
    )
}

pub fn recovery_settle_period() -> Duration {
    Duration::from_secs(
        env_u64("HEARTH_RECOVERY_SETTLE_SEC")
            .map(|v| v.clamp(1, 120))
            .unwrap_or(5),
    )
}

pub fn recovery_decay_window() -> Duration {
    Duration::from_secs(
        env_u64("HEARTH_RECOVERY_DECAY_SEC")
            .map(|v| v.clamp(30, 3600))
            .unwrap_or(300),
    )
}

pub fn resource_sample_interval() -> Duration {
    Duration::from_millis(
        env_u64("HEARTH_RESOURCE_SAMPLE_INTERVAL_MS")
            .map(|v| v.clamp(250, 60_000))
            .unwrap_or(2000),
    )
}

pub fn data_root() -> PathBuf {
    let raw = std::env::var("HEARTH_DATA_ROOT").unwrap_or_else(|_| "./data".to_string());
    let p = PathBuf::from(raw);
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };

    // Best-effort canonicalization: don't fail if the directory doesn't exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

/// Server software family. Decides the expected content subdirectory and
/// how the launch command is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoaderKind {
    Vanilla,
    Paper,
    Fabric,
    Forge,
    NeoForge,
}

impl LoaderKind {
    /// Subdirectory the loader expects to exist before boot, if any.
    pub fn content_dir(self) -> Option<&'static str> {
        match self {
            LoaderKind::Vanilla => None,
            LoaderKind::Paper => Some("plugins"),
            LoaderKind::Fabric | LoaderKind::Forge | LoaderKind::NeoForge => Some("mods"),
        }
    }

    /// Forge-family loaders boot through generated JVM argument files
    /// instead of a single server jar.
    pub fn uses_args_files(self) -> bool {
        matches!(self, LoaderKind::Forge | LoaderKind::NeoForge)
    }
}

/// Persisted description of one managed server. Owned by the config store;
/// the agent mutates only `status` and `start_time_unix_ms`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServerConfig {
    pub id: ServerId,
    pub name: String,
    pub working_dir: PathBuf,
    pub port: u16,
    pub ram_gb: u32,
    /// Required Java major, e.g. "21".
    pub java_version: String,
    pub loader: LoaderKind,
    /// Server jar (or loader bootstrap jar), relative to `working_dir`
    /// unless absolute.
    pub executable: PathBuf,
    #[serde(default)]
    pub performance_flags: bool,
    /// CPU niceness for the spawned process (unix `nice -n`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub niceness: Option<i32>,
    pub status: ServerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_unix_ms: Option<u64>,
    /// Opts the server into health supervision and boot-time autostart.
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

fn default_check_interval_secs() -> u64 {
    30
}

impl ServerConfig {
    pub fn executable_path(&self) -> PathBuf {
        if self.executable.is_absolute() {
            self.executable.clone()
        } else {
            self.working_dir.join(&self.executable)
        }
    }

    pub fn eula_path(&self) -> PathBuf {
        self.working_dir.join("eula.txt")
    }
}

/// Persistence seam for server configs. The agent reads configuration and
/// writes back status transitions; it does not own the storage format.
#[async_trait::async_trait]
pub trait ConfigStore: Send + Sync {
    async fn find(&self, id: &ServerId) -> anyhow::Result<Option<ServerConfig>>;
    async fn save(&self, config: &ServerConfig) -> anyhow::Result<()>;
    async fn all(&self) -> anyhow::Result<Vec<ServerConfig>>;
}

/// JSON-file backed store: one `servers.json` holding every config, flushed
/// whole via write-then-rename so a crash mid-write never truncates it.
pub struct JsonConfigStore {
    path: PathBuf,
    inner: Mutex<HashMap<String, ServerConfig>>,
}

impl JsonConfigStore {
    pub async fn open(path: PathBuf) -> anyhow::Result<Self> {
        let inner = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let configs: Vec<ServerConfig> =
                    serde_json::from_slice(&bytes).context("parse servers.json")?;
                configs.into_iter().map(|c| (c.id.0.clone(), c)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e).context("read servers.json"),
        };
        Ok(Self {
            path,
            inner: Mutex::new(inner),
        })
    }

    async fn flush(&self, map: &HashMap<String, ServerConfig>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("create config dir")?;
        }
        let mut configs: Vec<&ServerConfig> = map.values().collect();
        configs.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        let data = serde_json::to_vec_pretty(&configs).context("serialize servers.json")?;

        let tmp = self.path.with_extension("json.tmp");
        let mut f = tokio::fs::File::create(&tmp)
            .await
            .context("create servers.json.tmp")?;
        f.write_all(&data).await.context("write servers.json.tmp")?;
        f.flush().await.ok();
        tokio::fs::rename(&tmp, &self.path)
            .await
            .context("persist servers.json")?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ConfigStore for JsonConfigStore {
    async fn find(&self, id: &ServerId) -> anyhow::Result<Option<ServerConfig>> {
        Ok(self.inner.lock().await.get(&id.0).cloned())
    }

    async fn save(&self, config: &ServerConfig) -> anyhow::Result<()> {
        let mut map = self.inner.lock().await;
        map.insert(config.id.0.clone(), config.clone());
        self.flush(&map).await
    }

    async fn all(&self) -> anyhow::Result<Vec<ServerConfig>> {
        let map = self.inner.lock().await;
        let mut out: Vec<ServerConfig> = map.values().cloned().collect();
        out.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        Ok(out)
    }
}
