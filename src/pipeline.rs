//! Request pipeline: the ordered gate sequence every tool call walks.
//!
//! authenticate → rate-limit → length gate → classify → confirm → path
//! policy → execute → record. Policy outcomes (blocked commands) come back
//! as structured results; only protocol misuse surfaces as an error. Every
//! outcome is audited exactly once and metered exactly once.

use crate::audit::{AuditJournal, AuditLevel};
use crate::auth::{AuthError, Authenticator};
use crate::events::EventStream;
use crate::exec::{ExecRequest, Executor};
use crate::metrics::{ExecutionRecord, MetricsRegistry, MetricsSnapshot};
use crate::middleware::rate_limit::RateLimiter;
use crate::models::{
    preview_of, AdaptiveConfig, Config, ExecutionResult, SecurityAssessment, SecurityLevel,
    TerminationReason,
};
use crate::policy::{PathPolicy, PathPolicyStore};
use crate::security::learning::{
    ApprovedPattern, CandidateAggregate, LearnQueueEntry, LearningPipeline, Recommendation,
    ThreatSummary,
};
use crate::security::{Classifier, PatternStore};
use crate::syntax::{check_script, SyntaxReport};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Failure kinds surfaced over the RPC boundary.
#[derive(Debug)]
pub enum GatewayError {
    Unauthorized(String),
    RateLimited { retry_after_ms: u64 },
    InvalidArgument(String),
    Internal(String),
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Unauthorized(_) => "unauthorized",
            GatewayError::RateLimited { .. } => "rate-limited",
            GatewayError::InvalidArgument(_) => "invalid-argument",
            GatewayError::Internal(_) => "internal",
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Unauthorized(m) => write!(f, "{m}"),
            GatewayError::RateLimited { retry_after_ms } => {
                write!(f, "rate limit exceeded; retry in {retry_after_ms}ms")
            }
            GatewayError::InvalidArgument(m) => write!(f, "{m}"),
            GatewayError::Internal(m) => write!(f, "{m}"),
        }
    }
}

impl std::error::Error for GatewayError {}

/// Arguments for `execute_command`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteArgs {
    pub command: String,
    #[serde(default)]
    pub confirmed: bool,
    pub working_directory: Option<String>,
    pub timeout_seconds: Option<u64>,
    /// Legacy field names, accepted with a warning.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    pub adaptive: Option<AdaptiveArgs>,
    /// Shared secret when authentication is enabled.
    pub auth_key: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveArgs {
    pub extend_window_ms: u64,
    pub extend_step_ms: u64,
    pub max_total_sec: u64,
}

/// `execute_command` response: the execution result plus a human summary
/// and any normalization warnings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    #[serde(flatten)]
    pub result: ExecutionResult,
    pub warnings: Vec<String>,
    pub summary: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CheckSyntaxArgs {
    pub script: Option<String>,
    pub file_path: Option<String>,
    pub auth_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyArgs {
    pub action: String,
    pub enabled: Option<bool>,
    pub allowed_roots: Option<Vec<String>>,
    pub auth_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StatsArgs {
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub reset: bool,
    pub auth_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    #[serde(flatten)]
    pub snapshot: MetricsSnapshot,
    pub events_dropped: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recent: Option<Vec<ExecutionRecord>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LearnArgs {
    pub action: String,
    pub limit: Option<usize>,
    pub min_count: Option<u64>,
    #[serde(default)]
    pub normalized: Vec<String>,
    pub auth_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase", untagged)]
pub enum LearnResponse {
    List { candidates: Vec<CandidateAggregate> },
    Recommend { recommendations: Vec<Recommendation> },
    Queue { queue: Vec<LearnQueueEntry> },
    Approve { approved: Vec<ApprovedPattern> },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSampleResponse {
    pub ps_cpu_sec: Option<f64>,
    pub ps_ws_mb: Option<f64>,
    pub duration_ms: u64,
}

/// Everything one tool call needs, wired once at startup and shared.
pub struct RequestPipeline {
    pub config: Config,
    pub auth: Authenticator,
    pub rate_limiter: RateLimiter,
    pub patterns: Arc<PatternStore>,
    pub classifier: Classifier,
    pub learning: Arc<LearningPipeline>,
    pub path_policy: PathPolicyStore,
    pub executor: Executor,
    pub metrics: Arc<MetricsRegistry>,
    pub audit: Arc<AuditJournal>,
    pub events: Arc<EventStream>,
}

impl RequestPipeline {
    /// Wire every subsystem from one resolved configuration. Tests build a
    /// fresh pipeline per case; nothing here is global.
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let patterns = Arc::new(PatternStore::new());
        let learning = Arc::new(LearningPipeline::new(
            config.data_dir.clone(),
            config.learn_hmac_secret.clone(),
            config.learn_journal_max_bytes,
            patterns.clone(),
        ));
        // Re-seed previously approved learned-safe patterns.
        for (name, pattern) in learning.approved_patterns() {
            if let Err(e) = patterns.mutate(crate::security::PatternChange::AddLearnedSafe {
                name,
                pattern,
            }) {
                warn!("skipping persisted learned pattern: {e:#}");
            }
        }

        let rate_limiter = RateLimiter::new(crate::middleware::RateLimitConfig {
            capacity: config.rate_capacity,
            refill_every: std::time::Duration::from_millis(config.rate_refill_ms),
            refill_amount: config.rate_refill_amount,
        });

        Ok(Self {
            auth: Authenticator::new(config.auth_key.clone()),
            rate_limiter,
            classifier: Classifier::new(patterns.clone()),
            patterns,
            learning,
            path_policy: PathPolicyStore::new(config.wd_enforced, config.wd_allowed_roots.clone()),
            executor: Executor::new(config.shell_override.clone()),
            metrics: Arc::new(MetricsRegistry::new()),
            audit: Arc::new(AuditJournal::new(config.logs_dir.clone())),
            events: Arc::new(EventStream::new(config.attempt_events)),
            config,
        })
    }

    /// Gate 1: authentication, shared by every tool.
    fn authenticate(&self, presented: Option<&str>, caller_id: &str) -> Result<(), GatewayError> {
        match self.auth.verify(presented) {
            Ok(()) => Ok(()),
            Err(e @ (AuthError::MissingKey | AuthError::InvalidKey)) => {
                self.audit.log(
                    AuditLevel::Warning,
                    "AUTH_FAILED",
                    e.message(),
                    json!({ "callerId": caller_id }),
                );
                Err(GatewayError::Unauthorized(e.message().to_string()))
            }
        }
    }

    pub async fn execute_command(
        &self,
        args: ExecuteArgs,
        caller_id: &str,
    ) -> Result<ExecuteResponse, GatewayError> {
        let mut warnings: Vec<String> = Vec::new();
        let command = args.command.clone();

        // 1. Authenticate.
        self.authenticate(args.auth_key.as_deref(), caller_id)?;

        // 2. Rate limit on the caller identity.
        let consume = self.rate_limiter.consume(caller_id);
        if !consume.allowed {
            let assessment = SecurityAssessment::new(
                SecurityLevel::Blocked,
                "rate limit exceeded",
                vec!["rate-limit".to_string()],
            );
            self.events
                .publish_attempt(&command, &assessment, args.confirmed, "execute_command");
            self.audit.log(
                AuditLevel::Warning,
                "RATE_LIMIT_EXCEEDED",
                "caller exhausted its rate bucket",
                json!({ "callerId": caller_id, "msUntilReset": consume.ms_until_reset }),
            );
            return Err(GatewayError::RateLimited {
                retry_after_ms: consume.ms_until_reset,
            });
        }

        // 3. Length gate.
        let command_chars = command.chars().count();
        if command_chars > self.config.max_command_chars {
            self.audit.log(
                AuditLevel::Warning,
                "COMMAND_REJECTED",
                "command exceeds the maximum length",
                json!({ "chars": command_chars, "max": self.config.max_command_chars }),
            );
            return Err(GatewayError::InvalidArgument(format!(
                "command is {command_chars} chars; the maximum is {}",
                self.config.max_command_chars
            )));
        }

        // 4. Classify.
        let assessment = self.classifier.classify(&command);
        debug!(level = %assessment.level, reason = %assessment.reason, "classified command");

        // UNKNOWN classifications feed the learning journal in the
        // background; a journal hiccup never affects the caller.
        if assessment.level == SecurityLevel::Unknown {
            let learning = self.learning.clone();
            let cmd = command.clone();
            let session = caller_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = learning.record(&cmd, &session) {
                    warn!("learning candidate record failed: {e}");
                }
            });
        }

        // 5. Blocked: returned inline, never thrown.
        if assessment.blocked {
            self.events
                .publish_attempt(&command, &assessment, args.confirmed, "execute_command");
            self.audit.log(
                AuditLevel::Warning,
                "COMMAND_BLOCKED",
                &assessment.reason,
                json!({
                    "level": assessment.level,
                    "preview": preview_of(&command),
                    "patterns": assessment.matched_patterns.join(","),
                }),
            );
            let result = blocked_result(&self.config, assessment);
            self.metrics
                .record(record_of(&command, &result, args.confirmed), None, None);
            let summary = summarize(&command, &result);
            return Ok(ExecuteResponse {
                result,
                warnings,
                summary,
            });
        }

        // 6. Confirmation gate.
        if assessment.requires_confirmation && !args.confirmed {
            self.metrics.increment_confirmation_required();
            self.events
                .publish_attempt(&command, &assessment, false, "execute_command");
            self.audit.log(
                AuditLevel::Info,
                "CONFIRMED_REQUIRED",
                &assessment.reason,
                json!({
                    "level": assessment.level,
                    "preview": preview_of(&command),
                }),
            );
            return Err(GatewayError::InvalidArgument(format!(
                "{} command requires explicit approval; resubmit with confirmed: true",
                assessment.level
            )));
        }

        // 7. Timeout normalization.
        let timeout_secs = self.normalize_timeout(&args, &mut warnings)?;
        let timeout_ms = timeout_secs * 1000;

        // Path policy, when a working directory was supplied.
        let working_directory = match &args.working_directory {
            Some(dir) => match self.path_policy.resolve(dir) {
                Ok(resolved) => Some(resolved),
                Err(e) => {
                    self.audit.log(
                        AuditLevel::Warning,
                        "PATH_POLICY_DENIED",
                        &e.to_string(),
                        json!({ "requested": dir }),
                    );
                    return Err(GatewayError::InvalidArgument(e.to_string()));
                }
            },
            None => None,
        };

        let adaptive = args.adaptive.map(|a| AdaptiveConfig {
            extend_window_ms: a.extend_window_ms,
            extend_step_ms: a.extend_step_ms,
            max_total_ms: a.max_total_sec * 1000,
        });

        // 8. Execute.
        let exec_request = ExecRequest {
            command: command.clone(),
            timeout_ms,
            working_directory,
            adaptive,
            overflow_strategy: self.config.overflow_strategy,
            capture_process_metrics: self.config.capture_process_metrics,
            disable_self_destruct: self.config.disable_self_destruct,
            max_output_bytes: self.config.max_output_kb * 1024,
            max_lines: self.config.max_lines,
            chunk_bytes: self.config.chunk_kb * 1024,
        };
        let result = self
            .executor
            .execute(exec_request, assessment)
            .await
            .map_err(|e| GatewayError::Internal(format!("execution failed: {e:#}")))?;

        // 9–10. Record: metrics first, then the event, then the journal, so
        // no subscriber sees an execution the registry has not absorbed.
        if result.timed_out {
            self.metrics.increment_timeout();
        }
        self.metrics.record(
            record_of(&command, &result, args.confirmed),
            result.ps_cpu_sec,
            result.ps_ws_mb,
        );
        self.events
            .publish_execution(&command, &result, args.confirmed, "execute_command");
        self.audit.log(
            AuditLevel::Info,
            "POWERSHELL_EXEC",
            "command executed",
            json!({
                "level": result.security_assessment.level,
                "reason": result.security_assessment.reason,
                "durationMs": result.duration_ms,
                "terminationReason": result.termination_reason,
                "exitCode": result.exit_code,
                "confirmed": args.confirmed,
                "preview": preview_of(&command),
            }),
        );

        // 11. Structured result plus the textual mirror.
        let summary = summarize(&command, &result);
        info!(
            duration_ms = result.duration_ms,
            termination = %result.termination_reason,
            "execution finished"
        );
        Ok(ExecuteResponse {
            result,
            warnings,
            summary,
        })
    }

    fn normalize_timeout(
        &self,
        args: &ExecuteArgs,
        warnings: &mut Vec<String>,
    ) -> Result<u64, GatewayError> {
        let mut timeout_secs = args.timeout_seconds;
        if timeout_secs.is_none() {
            if let Some(legacy) = args.timeout {
                warnings.push("'timeout' is deprecated; use 'timeoutSeconds'".to_string());
                timeout_secs = Some(legacy);
            } else if let Some(legacy_ms) = args.timeout_ms {
                warnings.push("'timeoutMs' is deprecated; use 'timeoutSeconds'".to_string());
                timeout_secs = Some(legacy_ms.div_ceil(1000));
            }
        }
        let timeout_secs = timeout_secs.unwrap_or(self.config.default_timeout_secs);

        if timeout_secs == 0 {
            return Err(GatewayError::InvalidArgument(
                "timeoutSeconds must be at least 1".to_string(),
            ));
        }
        if timeout_secs > self.config.max_timeout_secs {
            return Err(GatewayError::InvalidArgument(format!(
                "timeoutSeconds {timeout_secs} exceeds the maximum of {}",
                self.config.max_timeout_secs
            )));
        }
        if timeout_secs >= 60 {
            warnings.push(format!(
                "timeout of {timeout_secs}s is long; the command will hold a worker until it finishes"
            ));
        }
        Ok(timeout_secs)
    }

    pub fn check_syntax(
        &self,
        args: CheckSyntaxArgs,
        caller_id: &str,
    ) -> Result<SyntaxReport, GatewayError> {
        self.authenticate(args.auth_key.as_deref(), caller_id)?;
        let script = match (args.script, args.file_path) {
            (Some(s), _) => s,
            (None, Some(path)) => std::fs::read_to_string(&path).map_err(|e| {
                GatewayError::InvalidArgument(format!("cannot read {path}: {e}"))
            })?,
            (None, None) => {
                return Err(GatewayError::InvalidArgument(
                    "either 'script' or 'filePath' is required".to_string(),
                ))
            }
        };
        Ok(check_script(&script))
    }

    pub fn working_directory_policy(
        &self,
        args: PolicyArgs,
        caller_id: &str,
    ) -> Result<PathPolicy, GatewayError> {
        self.authenticate(args.auth_key.as_deref(), caller_id)?;
        match args.action.as_str() {
            "get" => Ok(self.path_policy.current()),
            "set" => {
                let current = self.path_policy.current();
                let enforced = args.enabled.unwrap_or(current.enforced);
                let roots = args.allowed_roots.unwrap_or(current.allowed_roots);
                let updated = self.path_policy.set(enforced, roots);
                self.audit.log(
                    AuditLevel::Info,
                    "PATH_POLICY_CHANGED",
                    "working directory policy updated",
                    json!({ "enforced": updated.enforced, "roots": updated.allowed_roots }),
                );
                Ok(updated)
            }
            other => Err(GatewayError::InvalidArgument(format!(
                "unknown action '{other}'; expected 'get' or 'set'"
            ))),
        }
    }

    pub fn server_stats(
        &self,
        args: StatsArgs,
        caller_id: &str,
    ) -> Result<StatsResponse, GatewayError> {
        self.authenticate(args.auth_key.as_deref(), caller_id)?;
        let snapshot = self.metrics.snapshot(args.reset);
        let recent = args.verbose.then(|| self.metrics.recent_records(50));
        Ok(StatsResponse {
            snapshot,
            events_dropped: self.events.dropped(),
            recent,
        })
    }

    pub fn threat_analysis(
        &self,
        auth_key: Option<&str>,
        caller_id: &str,
    ) -> Result<ThreatSummary, GatewayError> {
        self.authenticate(auth_key, caller_id)?;
        self.learning
            .threat_summary(10)
            .map_err(|e| GatewayError::Internal(format!("threat analysis failed: {e:#}")))
    }

    pub fn learn(&self, args: LearnArgs, caller_id: &str) -> Result<LearnResponse, GatewayError> {
        self.authenticate(args.auth_key.as_deref(), caller_id)?;
        let limit = args.limit.unwrap_or(20);
        let min_count = args.min_count.unwrap_or(1);
        match args.action.as_str() {
            "list" => {
                let mut candidates = self
                    .learning
                    .aggregate()
                    .map_err(internal("listing candidates"))?;
                candidates.truncate(limit);
                Ok(LearnResponse::List { candidates })
            }
            "recommend" => {
                let recommendations = self
                    .learning
                    .recommend(limit, min_count)
                    .map_err(internal("scoring candidates"))?;
                Ok(LearnResponse::Recommend { recommendations })
            }
            "queue" => {
                require_forms(&args.normalized)?;
                let queue = self
                    .learning
                    .queue(&args.normalized, caller_id)
                    .map_err(internal("queueing candidates"))?;
                self.audit.log(
                    AuditLevel::Info,
                    "LEARN_QUEUED",
                    "candidates queued for review",
                    json!({ "count": args.normalized.len() }),
                );
                Ok(LearnResponse::Queue { queue })
            }
            "approve" => {
                require_forms(&args.normalized)?;
                let approved = self
                    .learning
                    .approve(&args.normalized, caller_id)
                    .map_err(internal("approving candidates"))?;
                self.audit.log(
                    AuditLevel::Info,
                    "LEARN_APPROVED",
                    "candidates promoted to learned-safe patterns",
                    json!({ "forms": args.normalized }),
                );
                Ok(LearnResponse::Approve { approved })
            }
            "remove" => {
                require_forms(&args.normalized)?;
                let queue = self
                    .learning
                    .remove_from_queue(&args.normalized)
                    .map_err(internal("removing candidates"))?;
                Ok(LearnResponse::Queue { queue })
            }
            other => Err(GatewayError::InvalidArgument(format!(
                "unknown action '{other}'; expected list, recommend, queue, approve, or remove"
            ))),
        }
    }

    /// Test hook: run a trivial command with process sampling forced on and
    /// return the captured sample.
    pub async fn capture_sample(
        &self,
        auth_key: Option<&str>,
        caller_id: &str,
    ) -> Result<CaptureSampleResponse, GatewayError> {
        self.authenticate(auth_key, caller_id)?;
        let assessment = SecurityAssessment::new(
            SecurityLevel::Safe,
            "metrics sample probe",
            vec!["get-date".to_string()],
        );
        let request = ExecRequest {
            command: "Get-Date".to_string(),
            timeout_ms: 10_000,
            working_directory: None,
            adaptive: None,
            overflow_strategy: self.config.overflow_strategy,
            capture_process_metrics: true,
            disable_self_destruct: self.config.disable_self_destruct,
            max_output_bytes: 64 * 1024,
            max_lines: 100,
            chunk_bytes: 16 * 1024,
        };
        let result = self
            .executor
            .execute(request, assessment)
            .await
            .map_err(|e| GatewayError::Internal(format!("sample probe failed: {e:#}")))?;
        if result.ps_cpu_sec.is_some() || result.ps_ws_mb.is_some() {
            self.metrics.record(
                record_of("Get-Date", &result, true),
                result.ps_cpu_sec,
                result.ps_ws_mb,
            );
        }
        Ok(CaptureSampleResponse {
            ps_cpu_sec: result.ps_cpu_sec,
            ps_ws_mb: result.ps_ws_mb,
            duration_ms: result.duration_ms,
        })
    }
}

fn require_forms(normalized: &[String]) -> Result<(), GatewayError> {
    if normalized.is_empty() {
        Err(GatewayError::InvalidArgument(
            "'normalized' must list at least one form".to_string(),
        ))
    } else {
        Ok(())
    }
}

fn internal(doing: &'static str) -> impl Fn(anyhow::Error) -> GatewayError {
    move |e| GatewayError::Internal(format!("{doing} failed: {e:#}"))
}

/// Inline result for a blocked command: no child was spawned, duration is
/// zero so percentiles are untouched.
fn blocked_result(config: &Config, assessment: SecurityAssessment) -> ExecutionResult {
    ExecutionResult {
        success: false,
        exit_code: None,
        stdout: String::new(),
        stderr: String::new(),
        duration_ms: 0,
        configured_timeout_ms: config.default_timeout_secs * 1000,
        effective_timeout_ms: config.default_timeout_secs * 1000,
        adaptive_extensions: 0,
        adaptive_max_total_ms: None,
        termination_reason: TerminationReason::Killed,
        timed_out: false,
        overflow: false,
        truncated: false,
        total_bytes: 0,
        internal_self_destruct: false,
        watchdog_triggered: false,
        kill_escalated: false,
        kill_tree_attempted: false,
        ps_cpu_sec: None,
        ps_ws_mb: None,
        shell_resolution: Vec::new(),
        security_assessment: assessment,
    }
}

fn record_of(command: &str, result: &ExecutionResult, confirmed: bool) -> ExecutionRecord {
    ExecutionRecord {
        timestamp: Utc::now(),
        preview: preview_of(command),
        level: result.security_assessment.level,
        duration_ms: result.duration_ms,
        blocked: result.security_assessment.blocked,
        truncated: result.truncated,
        timed_out: result.timed_out,
        exit_code: result.exit_code,
        termination_reason: Some(result.termination_reason),
        confirmed,
    }
}

fn summarize(command: &str, result: &ExecutionResult) -> String {
    let assessment = &result.security_assessment;
    let mut summary = format!(
        "Classification: {} ({})\n",
        assessment.level, assessment.reason
    );
    if assessment.blocked {
        summary.push_str(&format!("Blocked: {}\n", preview_of(command)));
        return summary;
    }
    summary.push_str(&format!(
        "Exit code: {} | Duration: {}ms | Termination: {}\n",
        result
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string()),
        result.duration_ms,
        result.termination_reason
    ));
    if !result.stdout.is_empty() {
        summary.push_str("--- stdout ---\n");
        summary.push_str(&result.stdout);
        if !result.stdout.ends_with('\n') {
            summary.push('\n');
        }
    }
    if !result.stderr.is_empty() {
        summary.push_str("--- stderr ---\n");
        summary.push_str(&result.stderr);
        if !result.stderr.ends_with('\n') {
            summary.push('\n');
        }
    }
    summary
}
