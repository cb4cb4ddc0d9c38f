//! Stateless pre-flight gate run before every (non-forced) start.
//!
//! Port availability is deliberately not checked here: a bound port may
//! belong to this same server's own already-running instance, and failing
//! early would block the orchestrator's adoption path.

use crate::config::ServerConfig;
use crate::error::SafetyError;

pub fn validate(config: &ServerConfig) -> Result<(), SafetyError> {
    let exec = config.executable_path();
    if !exec.is_file() {
        return Err(SafetyError::MissingExecutable { path: exec });
    }

    // A missing eula.txt is fine (first boot writes it); an existing one
    // must carry the explicit acceptance.
    let eula = config.eula_path();
    if eula.is_file() {
        let accepted = std::fs::read_to_string(&eula)
            .map(|text| {
                text.lines()
                    .map(str::trim)
                    .filter(|l| !l.starts_with('#'))
                    .any(|l| l.eq_ignore_ascii_case("eula=true"))
            })
            .unwrap_or(false);
        if !accepted {
            return Err(SafetyError::EulaNotAccepted { path: eula });
        }
    }

    Ok(())
}
