use std::fmt;

/// Stable identifier for a managed server instance.
///
/// NOTE: This is an opaque key, not a display name. The agent keys every
/// per-server structure (handle, snapshot, log buffer) by this id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a managed server.
///
/// Legal transitions:
/// Offline -> Starting -> Online -> { Stopping -> Offline | Crashed },
/// Starting -> Offline (watchdog timeout / bind failure),
/// Starting | Online -> Crashed (unexpected process exit),
/// any -> Recovering (health monitor) -> Starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Offline,
    Starting,
    Online,
    Stopping,
    Crashed,
    Recovering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResourceUsage {
    /// CPU usage in 1/100 of a percent.
    pub cpu_percent_x100: u32,
    pub rss_bytes: u64,
}

/// Ephemeral per-server status cache.
///
/// This is the single source of truth the rest of the agent reads. It may
/// temporarily diverge from the persisted config status: the snapshot leads,
/// the persisted record follows on transition edges.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StatusSnapshot {
    pub state: ServerState,
    pub reachable: bool,
    pub player_count: u32,
    pub players: Vec<String>,
    pub latency_ms: Option<u32>,
    pub last_update_unix_ms: u64,
    pub resources: Option<ResourceUsage>,
}

impl StatusSnapshot {
    pub fn offline(now_unix_ms: u64) -> Self {
        Self {
            state: ServerState::Offline,
            reachable: false,
            player_count: 0,
            players: Vec::new(),
            latency_ms: None,
            last_update_unix_ms: now_unix_ms,
            resources: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_id_is_non_empty() {
        let id = ServerId::new();
        assert!(!id.0.is_empty());
    }

    #[test]
    fn offline_snapshot_is_unreachable() {
        let s = StatusSnapshot::offline(0);
        assert_eq!(s.state, ServerState::Offline);
        assert!(!s.reachable);
        assert!(s.players.is_empty());
    }
}
