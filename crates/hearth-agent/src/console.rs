//! Console-output classifier.
//!
//! Readiness, bind failure and roster tracking are all inferred from raw
//! server output lines. The scraping is best-effort text matching, not
//! authoritative; everything unrecognized is ignored. The supervisor's
//! state machine only sees the events produced here, so the matching
//! strategy can change without touching it.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    /// Game loop is up and listening (disarms the startup watchdog).
    /// Carries the boot duration the server reported, when parseable.
    Ready { startup_ms: Option<u64> },
    /// Listen socket could not be bound; startup is doomed.
    BindFailure,
    Joined(String),
    Left(String),
}

pub fn classify(line: &str) -> Option<ConsoleEvent> {
    if line.contains("FAILED TO BIND TO PORT")
        || line.contains("Perhaps a server is already running on that port")
    {
        return Some(ConsoleEvent::BindFailure);
    }
    if let Some(startup_ms) = ready_marker(line) {
        return Some(ConsoleEvent::Ready { startup_ms });
    }
    if let Some(name) = player_name_before(line, " joined the game") {
        return Some(ConsoleEvent::Joined(name));
    }
    if let Some(name) = player_name_before(line, " left the game") {
        return Some(ConsoleEvent::Left(name));
    }
    None
}

/// Some(duration) on the readiness marker; the duration itself is None
/// when the parenthesized figure does not parse.
fn ready_marker(line: &str) -> Option<Option<u64>> {
    // Vanilla/Paper: `[...] [Server thread/INFO]: Done (12.345s)! For help, type "help"`
    // Forge/NeoForge route the same line through their own logger, so match
    // the `Done (...)!` shape rather than a full prefix.
    let idx = line.find("Done (")?;
    let rest = &line[idx + "Done (".len()..];
    let close = rest.find(")!")?;
    let startup_ms = rest[..close]
        .trim_end_matches('s')
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(|secs| (secs * 1000.0) as u64);
    Some(startup_ms)
}

/// Minecraft account names are 1..=16 chars of [A-Za-z0-9_].
fn valid_player_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 16
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn player_name_before(line: &str, marker: &str) -> Option<String> {
    let idx = line.find(marker)?;
    // Log prefixes end with "]: ", so the name is the last whitespace
    // token before the marker either way.
    let name = line[..idx].split_whitespace().next_back()?;
    valid_player_name(name).then(|| name.to_string())
}
