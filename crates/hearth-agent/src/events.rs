use hearth_process::{ResourceUsage, ServerId, ServerState};

/// Everything the core emits toward the (out-of-scope) transport layer.
/// Delivered over a lossy broadcast channel; slow subscribers may observe
/// `RecvError::Lagged` and should resync from `status()`.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Log { id: ServerId, line: String },
    Status { id: ServerId, state: ServerState },
    Stats { id: ServerId, usage: ResourceUsage },
    PlayerJoined { id: ServerId, name: String },
    PlayerLeft { id: ServerId, name: String },
}
