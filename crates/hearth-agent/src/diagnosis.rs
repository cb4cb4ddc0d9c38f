//! Log-driven failure diagnosis.
//!
//! Each rule owns a trigger list (cheap substring pre-filter over the log
//! window) and an `analyze` function that inspects the full context. Rules
//! are isolated: a panicking rule is logged and skipped, never taking the
//! health monitor down with it.

use std::panic::{AssertUnwindSafe, catch_unwind};

use serde::Serialize;
use uuid::Uuid;

use crate::config::ServerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Machine-actionable follow-up a caller can offer the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuggestedAction {
    AcceptEula,
    ChangePort,
    ChangeJavaVersion { required_major: u32 },
    IncreaseRamAllocation,
    EnablePerformanceFlags,
    FixFilePermissions,
    RemoveConflictingMod,
    RestoreWorldBackup,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosisResult {
    /// Fresh per evaluation; two runs over the same logs get distinct ids.
    pub id: String,
    pub rule_id: &'static str,
    pub severity: Severity,
    pub title: String,
    pub explanation: String,
    pub recommendation: String,
    pub suggested_action: Option<SuggestedAction>,
    /// Restarting cannot help; recovery must stop and surface the cause.
    pub fatal: bool,
}

/// Host facts the rules may consult alongside the logs.
#[derive(Debug, Clone)]
pub struct EnvInfo {
    pub executable_exists: bool,
    pub total_ram_mb: Option<u64>,
    pub port: u16,
}

pub struct RuleContext<'a> {
    pub config: &'a ServerConfig,
    pub logs: &'a [String],
    pub env: &'a EnvInfo,
}

impl RuleContext<'_> {
    fn find_line(&self, needle: &str) -> Option<&str> {
        self.logs
            .iter()
            .rev()
            .find(|l| l.contains(needle))
            .map(String::as_str)
    }
}

pub struct Rule {
    pub rule_id: &'static str,
    /// Substring pre-filter; empty means the rule always runs.
    pub triggers: &'static [&'static str],
    pub fatal: bool,
    pub analyze: fn(&RuleContext<'_>) -> Option<DiagnosisResult>,
}

impl Rule {
    fn triggered(&self, logs: &[String]) -> bool {
        self.triggers.is_empty()
            || logs
                .iter()
                .any(|line| self.triggers.iter().any(|t| line.contains(t)))
    }
}

/// `rule_id` and `fatal` are stamped on by `evaluate` from the owning rule,
/// so analyze bodies only describe the finding.
fn finding(
    severity: Severity,
    title: impl Into<String>,
    explanation: impl Into<String>,
    recommendation: impl Into<String>,
    suggested_action: Option<SuggestedAction>,
) -> DiagnosisResult {
    DiagnosisResult {
        id: Uuid::new_v4().to_string(),
        rule_id: "",
        severity,
        title: title.into(),
        explanation: explanation.into(),
        recommendation: recommendation.into(),
        suggested_action,
        fatal: false,
    }
}

pub fn diagnose(config: &ServerConfig, logs: &[String], env: &EnvInfo) -> Vec<DiagnosisResult> {
    let ctx = RuleContext { config, logs, env };
    evaluate(&registry(), &ctx)
}

/// True when any finding rules out a restart as a fix.
pub fn has_fatal(results: &[DiagnosisResult]) -> bool {
    results.iter().any(|r| r.fatal)
}

fn evaluate(rules: &[Rule], ctx: &RuleContext<'_>) -> Vec<DiagnosisResult> {
    let mut results = Vec::new();
    for rule in rules {
        if !rule.triggered(ctx.logs) {
            continue;
        }
        match catch_unwind(AssertUnwindSafe(|| (rule.analyze)(ctx))) {
            Ok(Some(mut r)) => {
                r.rule_id = rule.rule_id;
                r.fatal = rule.fatal;
                results.push(r);
            }
            Ok(None) => {}
            Err(_) => {
                tracing::warn!(
                    server_id = %ctx.config.id,
                    rule_id = rule.rule_id,
                    "diagnosis rule panicked; skipping it"
                );
            }
        }
    }
    results
}

/// `class file version 65.0` -> the Java major that produced it (N - 44).
fn required_java_major(line: &str) -> Option<u32> {
    let idx = line.find("class file version ")?;
    let rest = &line[idx + "class file version ".len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let classfile: u32 = digits.parse().ok()?;
    classfile.checked_sub(44)
}

fn registry() -> Vec<Rule> {
    vec![
        Rule {
            rule_id: "eula_not_accepted",
            triggers: &["You need to agree to the EULA"],
            fatal: true,
            analyze: |ctx| {
                Some(finding(
                    Severity::Critical,
                    "Mojang EULA not accepted",
                    "The server refuses to boot until eula.txt contains eula=true.",
                    format!(
                        "Edit {} and set eula=true.",
                        ctx.config.eula_path().display()
                    ),
                    Some(SuggestedAction::AcceptEula),
                ))
            },
        },
        Rule {
            rule_id: "port_in_use",
            triggers: &["FAILED TO BIND TO PORT", "Address already in use"],
            fatal: true,
            analyze: |ctx| {
                Some(finding(
                    Severity::Critical,
                    "Listen port already taken",
                    format!(
                        "Another process is bound to port {}; the server cannot listen.",
                        ctx.env.port
                    ),
                    "Stop the occupant or move this server to a free port.",
                    Some(SuggestedAction::ChangePort),
                ))
            },
        },
        Rule {
            rule_id: "java_version_mismatch",
            triggers: &["UnsupportedClassVersionError", "class file version"],
            fatal: true,
            analyze: |ctx| {
                let line = ctx.find_line("class file version")?;
                let required = required_java_major(line)?;
                Some(finding(
                    Severity::Critical,
                    "Java runtime too old for this server",
                    format!(
                        "The server jar was built for Java {required}, but runtime \"{}\" loaded it.",
                        ctx.config.java_version
                    ),
                    format!("Switch the server to a Java {required} runtime."),
                    Some(SuggestedAction::ChangeJavaVersion {
                        required_major: required,
                    }),
                ))
            },
        },
        Rule {
            rule_id: "memory_oom",
            triggers: &["java.lang.OutOfMemoryError", "GC overhead limit exceeded"],
            fatal: false,
            analyze: |ctx| {
                let headroom_gb = ctx
                    .env
                    .total_ram_mb
                    .map(|total| total / 1024)
                    .filter(|host_gb| *host_gb > u64::from(ctx.config.ram_gb));
                let recommendation = match headroom_gb {
                    Some(host_gb) => format!(
                        "Raise the RAM allocation (host has {host_gb} GB), or reduce view distance and mod count."
                    ),
                    None => {
                        "The host has no headroom for a larger heap; reduce view distance and mod count."
                            .to_string()
                    }
                };
                Some(finding(
                    Severity::Critical,
                    "Server ran out of heap",
                    format!("The JVM exhausted its {} GB allocation.", ctx.config.ram_gb),
                    recommendation,
                    Some(SuggestedAction::IncreaseRamAllocation),
                ))
            },
        },
        Rule {
            rule_id: "missing_executable",
            triggers: &[],
            fatal: true,
            analyze: |ctx| {
                if ctx.env.executable_exists {
                    return None;
                }
                Some(finding(
                    Severity::Critical,
                    "Server executable is gone",
                    format!(
                        "{} no longer exists on disk.",
                        ctx.config.executable_path().display()
                    ),
                    "Reinstall the server jar or fix the configured path.",
                    None,
                ))
            },
        },
        Rule {
            rule_id: "corrupted_properties",
            triggers: &["Failed to load properties", "Malformed \\uxxxx encoding"],
            fatal: true,
            analyze: |_ctx| {
                Some(finding(
                    Severity::Critical,
                    "server.properties is unreadable",
                    "The properties file failed to parse during boot.",
                    "Delete server.properties and let the server regenerate it, then re-apply settings.",
                    None,
                ))
            },
        },
        Rule {
            rule_id: "file_permissions",
            triggers: &["Permission denied", "AccessDeniedException"],
            fatal: false,
            analyze: |ctx| {
                Some(finding(
                    Severity::Critical,
                    "Filesystem permission failure",
                    format!(
                        "The server was denied access to files under {}.",
                        ctx.config.working_dir.display()
                    ),
                    "Make the working directory writable by the agent's user.",
                    Some(SuggestedAction::FixFilePermissions),
                ))
            },
        },
        Rule {
            rule_id: "invalid_bind_address",
            triggers: &["Cannot assign requested address"],
            fatal: true,
            analyze: |_ctx| {
                Some(finding(
                    Severity::Critical,
                    "Configured bind address is not local",
                    "server-ip in server.properties names an address this host does not own.",
                    "Clear server-ip (bind all interfaces) or set a local address.",
                    None,
                ))
            },
        },
        Rule {
            rule_id: "missing_mod_dependency",
            triggers: &[
                "Missing or unsupported mandatory dependencies",
                "Mod resolution failed",
            ],
            fatal: true,
            analyze: |_ctx| {
                Some(finding(
                    Severity::Critical,
                    "A mod is missing a required dependency",
                    "Mod loading stopped because a mandatory dependency is absent or the wrong version.",
                    "Install the dependency named in the log, or remove the mod that requires it.",
                    Some(SuggestedAction::RemoveConflictingMod),
                ))
            },
        },
        Rule {
            rule_id: "duplicate_mod",
            triggers: &["Duplicate mods found", "DuplicateModsFoundException"],
            fatal: true,
            analyze: |_ctx| {
                Some(finding(
                    Severity::Critical,
                    "Two copies of the same mod are installed",
                    "The loader refuses to start with duplicate mod ids.",
                    "Delete the older jar from the mods directory.",
                    Some(SuggestedAction::RemoveConflictingMod),
                ))
            },
        },
        Rule {
            rule_id: "mod_injection_conflict",
            triggers: &["Mixin apply failed", "InvalidInjectionException"],
            fatal: true,
            analyze: |_ctx| {
                Some(finding(
                    Severity::Critical,
                    "Mods patch the same code and conflict",
                    "A mixin injection failed, usually two mods rewriting the same method.",
                    "Remove or update one of the mods named in the mixin error.",
                    Some(SuggestedAction::RemoveConflictingMod),
                ))
            },
        },
        Rule {
            rule_id: "entity_tick_crash",
            triggers: &["Ticking entity", "Exception ticking world"],
            fatal: false,
            analyze: |_ctx| {
                Some(finding(
                    Severity::Critical,
                    "An entity crashed the tick loop",
                    "A specific entity threw during ticking and took the server down.",
                    "Check the crash report for the entity and its coordinates; remove it with an editor if it recurs.",
                    None,
                ))
            },
        },
        Rule {
            rule_id: "watchdog_lag_kill",
            triggers: &[
                "A single server tick took",
                "Considering it to be crashed, server will forcibly shutdown",
            ],
            fatal: false,
            analyze: |_ctx| {
                Some(finding(
                    Severity::Warning,
                    "Server killed itself after a stalled tick",
                    "The built-in watchdog shut the server down because one tick exceeded the limit.",
                    "Look for heavy chunk generation or misbehaving mods; raising max-tick-time only hides the stall.",
                    None,
                ))
            },
        },
        Rule {
            rule_id: "world_corruption",
            triggers: &[
                "Failed to read chunk",
                "Corrupted chunk",
                "RegionFile header is corrupt",
            ],
            fatal: false,
            analyze: |_ctx| {
                Some(finding(
                    Severity::Critical,
                    "World data is damaged",
                    "Region files failed integrity checks while loading chunks.",
                    "Restore the affected region files from a backup before the damage spreads.",
                    Some(SuggestedAction::RestoreWorldBackup),
                ))
            },
        },
        Rule {
            rule_id: "auth_unreachable",
            triggers: &[
                "Authentication servers are down",
                "Failed to verify username",
            ],
            fatal: false,
            analyze: |_ctx| {
                Some(finding(
                    Severity::Warning,
                    "Mojang authentication unreachable",
                    "Player logins are failing because the session servers cannot be reached.",
                    "Usually transient; check outbound connectivity if it persists.",
                    None,
                ))
            },
        },
        Rule {
            rule_id: "performance_flags_hint",
            triggers: &[],
            fatal: false,
            analyze: |ctx| {
                if ctx.config.performance_flags || ctx.config.ram_gb < 4 {
                    return None;
                }
                Some(finding(
                    Severity::Info,
                    "GC tuning flags are off",
                    format!(
                        "This server has {} GB allocated but runs the default collector settings.",
                        ctx.config.ram_gb
                    ),
                    "Enable the performance-flag bundle for smoother garbage collection at this heap size.",
                    Some(SuggestedAction::EnablePerformanceFlags),
                ))
            },
        },
    ]
}
