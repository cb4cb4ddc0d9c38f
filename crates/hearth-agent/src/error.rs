use std::path::PathBuf;

use hearth_process::ServerId;

/// Pre-flight validation failure. Closed taxonomy, operator-actionable,
/// never a bug: callers render `code()`/`hint()` as remediation UI instead
/// of a stack trace.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SafetyError {
    #[error("server executable not found: {path}")]
    MissingExecutable { path: PathBuf },
    #[error("Minecraft EULA not accepted: {path}")]
    EulaNotAccepted { path: PathBuf },
}

impl SafetyError {
    pub fn code(&self) -> &'static str {
        match self {
            SafetyError::MissingExecutable { .. } => "missing_executable",
            SafetyError::EulaNotAccepted { .. } => "eula_not_accepted",
        }
    }

    pub fn hint(&self) -> &'static str {
        match self {
            SafetyError::MissingExecutable { .. } => {
                "Check the executable path in the server settings, or re-run the installer."
            }
            SafetyError::EulaNotAccepted { .. } => {
                "Set eula=true in eula.txt to accept the Minecraft EULA."
            }
        }
    }
}

/// Everything `start` can fail with. Safety and environment variants
/// propagate unchanged so the caller keeps the original code.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Safety(#[from] SafetyError),
    #[error("another operation is already in progress for {id}")]
    OperationInProgress { id: ServerId },
    #[error("working directory does not exist: {path}")]
    MissingWorkingDir { path: PathBuf },
    #[error(
        "allocated {allocated_mb} MiB exceeds total system memory of {total_mb} MiB; \
         lower the RAM allocation"
    )]
    InsufficientMemory { allocated_mb: u64, total_mb: u64 },
    #[error("java runtime unavailable: {message}")]
    Runtime { message: String },
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StartError {
    pub fn code(&self) -> &'static str {
        match self {
            StartError::Safety(e) => e.code(),
            StartError::OperationInProgress { .. } => "operation_in_progress",
            StartError::MissingWorkingDir { .. } => "missing_working_dir",
            StartError::InsufficientMemory { .. } => "insufficient_memory",
            StartError::Runtime { .. } => "runtime_unavailable",
            StartError::Supervisor(e) => e.code(),
            StartError::Other(_) => "internal",
        }
    }
}

/// Process-lifecycle failures raised by the supervisor.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("a live process already exists for {id}")]
    HandleExists { id: ServerId },
    #[error("no live process for {id}")]
    NotRunning { id: ServerId },
    #[error(
        "{id} is still starting; stopping mid-boot risks corrupting the world \
         (retry with force to override)"
    )]
    StartupProtected { id: ServerId },
    #[error("failed to spawn server process: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write to server stdin: {source}")]
    Stdin {
        #[source]
        source: std::io::Error,
    },
}

impl SupervisorError {
    pub fn code(&self) -> &'static str {
        match self {
            SupervisorError::HandleExists { .. } => "handle_exists",
            SupervisorError::NotRunning { .. } => "not_running",
            SupervisorError::StartupProtected { .. } => "startup_protected",
            SupervisorError::Spawn { .. } => "spawn_failed",
            SupervisorError::Stdin { .. } => "stdin_write_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safety_codes_are_stable() {
        let e = SafetyError::MissingExecutable {
            path: PathBuf::from("/srv/server.jar"),
        };
        assert_eq!(e.code(), "missing_executable");
        let e = SafetyError::EulaNotAccepted {
            path: PathBuf::from("/srv/eula.txt"),
        };
        assert_eq!(e.code(), "eula_not_accepted");
    }

    #[test]
    fn start_error_preserves_safety_code() {
        let e: StartError = SafetyError::EulaNotAccepted {
            path: PathBuf::from("/srv/eula.txt"),
        }
        .into();
        assert_eq!(e.code(), "eula_not_accepted");
    }
}
