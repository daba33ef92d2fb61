//! Shared data model for the execution gateway.
//!
//! Everything that crosses a module or wire boundary lives here: the risk
//! assessment attached to every command, the execution result contract, the
//! published event shape, and the environment-driven configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Risk bucket assigned to a command by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityLevel {
    Safe,
    Risky,
    Dangerous,
    Critical,
    Blocked,
    Unknown,
}

impl SecurityLevel {
    /// Levels that deny execution outright.
    pub fn is_blocking(self) -> bool {
        matches!(
            self,
            SecurityLevel::Dangerous | SecurityLevel::Critical | SecurityLevel::Blocked
        )
    }

    /// Levels that execute only with an explicit confirmation flag.
    pub fn needs_confirmation(self) -> bool {
        matches!(self, SecurityLevel::Risky | SecurityLevel::Unknown)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SecurityLevel::Safe => "SAFE",
            SecurityLevel::Risky => "RISKY",
            SecurityLevel::Dangerous => "DANGEROUS",
            SecurityLevel::Critical => "CRITICAL",
            SecurityLevel::Blocked => "BLOCKED",
            SecurityLevel::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable classification outcome for one command.
///
/// `blocked` and `requires_confirmation` are derived from `level` at
/// construction and are mutually exclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityAssessment {
    pub level: SecurityLevel,
    pub blocked: bool,
    pub requires_confirmation: bool,
    pub reason: String,
    pub matched_patterns: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verb: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub noun: Option<String>,
}

impl SecurityAssessment {
    pub fn new(level: SecurityLevel, reason: impl Into<String>, matched: Vec<String>) -> Self {
        Self {
            level,
            blocked: level.is_blocking(),
            requires_confirmation: level.needs_confirmation(),
            reason: reason.into(),
            matched_patterns: matched,
            verb: None,
            noun: None,
        }
    }

    pub fn with_tokens(mut self, verb: Option<String>, noun: Option<String>) -> Self {
        self.verb = verb;
        self.noun = noun;
        self
    }
}

/// Canonical single-valued end state of an execution, set exactly once by the
/// finalization gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminationReason {
    Completed,
    Timeout,
    Overflow,
    Killed,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminationReason::Completed => "completed",
            TerminationReason::Timeout => "timeout",
            TerminationReason::Overflow => "overflow",
            TerminationReason::Killed => "killed",
        };
        f.write_str(s)
    }
}

/// Policy for executions whose output exceeds the size or line caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowStrategy {
    /// Respond immediately with partial output and terminate the child in
    /// the background.
    Return,
    /// Stop reading further bytes and let the process finish.
    Truncate,
    /// SIGTERM then SIGKILL after a short grace.
    Terminate,
}

impl FromStr for OverflowStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "return" => Ok(OverflowStrategy::Return),
            "truncate" => Ok(OverflowStrategy::Truncate),
            "terminate" => Ok(OverflowStrategy::Terminate),
            other => Err(anyhow::anyhow!("unknown overflow strategy: {other}")),
        }
    }
}

/// Adaptive timeout parameters: while the child keeps producing output near
/// the deadline, the deadline may be pushed out in fixed steps up to a hard
/// total.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveConfig {
    pub extend_window_ms: u64,
    pub extend_step_ms: u64,
    pub max_total_ms: u64,
}

/// Structured outcome of one executed command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Wall clock, coerced to >= 1ms for any real execution.
    pub duration_ms: u64,
    pub configured_timeout_ms: u64,
    pub effective_timeout_ms: u64,
    pub adaptive_extensions: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adaptive_max_total_ms: Option<u64>,
    pub termination_reason: TerminationReason,
    pub timed_out: bool,
    pub overflow: bool,
    pub truncated: bool,
    pub total_bytes: u64,
    pub internal_self_destruct: bool,
    pub watchdog_triggered: bool,
    pub kill_escalated: bool,
    pub kill_tree_attempted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ps_cpu_sec: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ps_ws_mb: Option<f64>,
    /// Shell binaries tried during resolution, for diagnostics.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub shell_resolution: Vec<String>,
    pub security_assessment: SecurityAssessment,
}

/// Kind of record published to event subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// A command ran to a finalized result.
    Execution,
    /// A blocked or unconfirmed request that never spawned a child.
    Attempt,
}

/// Live feed record for dashboard subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub timestamp: String,
    pub kind: EventKind,
    pub level: SecurityLevel,
    pub duration_ms: u64,
    pub blocked: bool,
    pub truncated: bool,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// First ~120 chars of the command.
    pub preview: String,
    pub confirmed: bool,
    pub tool_name: String,
}

/// Marker appended to stdout when output was cut short.
pub const TRUNCATION_MARKER: &str = "\n...[output truncated]";

/// Maximum command preview length carried on events.
pub const PREVIEW_CHARS: usize = 120;

pub fn preview_of(command: &str) -> String {
    let mut p: String = command.chars().take(PREVIEW_CHARS).collect();
    if command.chars().count() > PREVIEW_CHARS {
        p.push('…');
    }
    p
}

/// Gateway configuration, resolved once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Shared secret the caller must present; `None` disables authentication.
    pub auth_key: Option<String>,
    pub default_timeout_secs: u64,
    pub max_timeout_secs: u64,
    pub rate_capacity: u32,
    pub rate_refill_ms: u64,
    pub rate_refill_amount: u32,
    pub wd_enforced: bool,
    pub wd_allowed_roots: Vec<String>,
    pub overflow_strategy: OverflowStrategy,
    pub capture_process_metrics: bool,
    pub disable_self_destruct: bool,
    pub data_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub learn_hmac_secret: String,
    pub learn_journal_max_bytes: u64,
    pub shell_override: Option<String>,
    /// 0 disables the HTTP observability listener.
    pub http_port: u16,
    pub max_command_chars: usize,
    pub max_output_kb: usize,
    pub max_lines: usize,
    pub chunk_kb: usize,
    /// Publish zero-duration attempt events for blocked / unconfirmed calls.
    pub attempt_events: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let auth_key = std::env::var("SHELLGATE_AUTH_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());

        let default_timeout_secs = env_u64("SHELLGATE_DEFAULT_TIMEOUT_SECS", 30);
        let max_timeout_secs = env_u64("SHELLGATE_MAX_TIMEOUT_SECS", 300);

        let rate_capacity = env_u64("SHELLGATE_RATE_CAPACITY", 30) as u32;
        let rate_refill_ms = env_u64("SHELLGATE_RATE_REFILL_MS", 60_000);
        let rate_refill_amount = env_u64("SHELLGATE_RATE_REFILL_AMOUNT", 30) as u32;

        let wd_enforced = env_bool("SHELLGATE_WD_ENFORCED", false);
        let wd_allowed_roots = std::env::var("SHELLGATE_WD_ALLOWED_ROOTS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let overflow_strategy = std::env::var("SHELLGATE_OVERFLOW_STRATEGY")
            .unwrap_or_else(|_| "return".to_string())
            .parse()
            .unwrap_or(OverflowStrategy::Return);

        let capture_process_metrics = env_bool("SHELLGATE_CAPTURE_PROCESS_METRICS", false);
        let disable_self_destruct = env_bool("SHELLGATE_DISABLE_SELF_DESTRUCT", false);

        let data_dir = PathBuf::from(
            std::env::var("SHELLGATE_DATA_DIR").unwrap_or_else(|_| "./data".to_string()),
        );
        let logs_dir = PathBuf::from(
            std::env::var("SHELLGATE_LOGS_DIR").unwrap_or_else(|_| "./logs".to_string()),
        );

        let learn_hmac_secret = std::env::var("SHELLGATE_LEARN_HMAC_SECRET")
            .unwrap_or_else(|_| "shellgate-learning".to_string());
        let learn_journal_max_bytes = env_u64("SHELLGATE_LEARN_JOURNAL_MAX_BYTES", 5 * 1024 * 1024);

        let shell_override = std::env::var("SHELLGATE_SHELL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let http_port = env_u64("SHELLGATE_HTTP_PORT", 8085) as u16;

        let max_command_chars = env_u64("SHELLGATE_MAX_COMMAND_CHARS", 8192) as usize;
        let max_output_kb = env_u64("SHELLGATE_MAX_OUTPUT_KB", 512) as usize;
        let max_lines = env_u64("SHELLGATE_MAX_LINES", 2000) as usize;
        let chunk_kb = env_u64("SHELLGATE_CHUNK_KB", 64) as usize;

        let attempt_events = env_bool("SHELLGATE_ATTEMPT_EVENTS", true);

        Ok(Self {
            auth_key,
            default_timeout_secs,
            max_timeout_secs,
            rate_capacity,
            rate_refill_ms,
            rate_refill_amount,
            wd_enforced,
            wd_allowed_roots,
            overflow_strategy,
            capture_process_metrics,
            disable_self_destruct,
            data_dir,
            logs_dir,
            learn_hmac_secret,
            learn_journal_max_bytes,
            shell_override,
            http_port,
            max_command_chars,
            max_output_kb,
            max_lines,
            chunk_kb,
            attempt_events,
        })
    }
}

impl Default for Config {
    /// Baseline used by tests; mirrors the `from_env` defaults with
    /// authentication off and the HTTP listener disabled.
    fn default() -> Self {
        Self {
            auth_key: None,
            default_timeout_secs: 30,
            max_timeout_secs: 300,
            rate_capacity: 30,
            rate_refill_ms: 60_000,
            rate_refill_amount: 30,
            wd_enforced: false,
            wd_allowed_roots: Vec::new(),
            overflow_strategy: OverflowStrategy::Return,
            capture_process_metrics: false,
            disable_self_destruct: false,
            data_dir: PathBuf::from("./data"),
            logs_dir: PathBuf::from("./logs"),
            learn_hmac_secret: "shellgate-learning".to_string(),
            learn_journal_max_bytes: 5 * 1024 * 1024,
            shell_override: None,
            http_port: 0,
            max_command_chars: 8192,
            max_output_kb: 512,
            max_lines: 2000,
            chunk_kb: 64,
            attempt_events: true,
        }
    }
}

fn env_u64(var: &str, default: u64) -> u64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_bool(var: &str, default: bool) -> bool {
    std::env::var(var)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_flags_are_exclusive() {
        for level in [
            SecurityLevel::Safe,
            SecurityLevel::Risky,
            SecurityLevel::Dangerous,
            SecurityLevel::Critical,
            SecurityLevel::Blocked,
            SecurityLevel::Unknown,
        ] {
            let a = SecurityAssessment::new(level, "test", vec![]);
            assert!(
                !(a.blocked && a.requires_confirmation),
                "{level} must not both block and require confirmation"
            );
        }
    }

    #[test]
    fn test_blocking_levels() {
        assert!(SecurityLevel::Dangerous.is_blocking());
        assert!(SecurityLevel::Critical.is_blocking());
        assert!(SecurityLevel::Blocked.is_blocking());
        assert!(!SecurityLevel::Risky.is_blocking());
        assert!(!SecurityLevel::Unknown.is_blocking());
        assert!(!SecurityLevel::Safe.is_blocking());
    }

    #[test]
    fn test_confirmation_levels() {
        assert!(SecurityLevel::Risky.needs_confirmation());
        assert!(SecurityLevel::Unknown.needs_confirmation());
        assert!(!SecurityLevel::Safe.needs_confirmation());
    }

    #[test]
    fn test_overflow_strategy_parse() {
        assert_eq!(
            "return".parse::<OverflowStrategy>().unwrap(),
            OverflowStrategy::Return
        );
        assert_eq!(
            "Terminate".parse::<OverflowStrategy>().unwrap(),
            OverflowStrategy::Terminate
        );
        assert!("abort".parse::<OverflowStrategy>().is_err());
    }

    #[test]
    fn test_preview_truncates_long_commands() {
        let long = "x".repeat(500);
        let p = preview_of(&long);
        assert!(p.chars().count() <= PREVIEW_CHARS + 1);
        assert!(p.ends_with('…'));
        assert_eq!(preview_of("Get-Date"), "Get-Date");
    }

    #[test]
    fn test_level_serializes_screaming() {
        let json = serde_json::to_string(&SecurityLevel::Safe).unwrap();
        assert_eq!(json, "\"SAFE\"");
    }
}
