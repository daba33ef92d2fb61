//! Child process lifecycle: spawn, stream, enforce, finalize.
//!
//! The control loop owns the child and is the only place outcomes are
//! decided; the earliest of completion, timeout, overflow, and the watchdog
//! backstop wins, and exactly one finalization produces the result.

use crate::exec::shell::{
    extract_sentinel, resolve_shell, shell_args, ShellFlavor, WrapOptions,
    SELF_DESTRUCT_EXIT_CODE,
};
use crate::models::{
    AdaptiveConfig, ExecutionResult, OverflowStrategy, SecurityAssessment, TerminationReason,
    TRUNCATION_MARKER,
};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tokio::time::{interval_at, sleep_until, timeout, Instant};
use tracing::{debug, warn};

/// One execution request, fully normalized by the pipeline.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub timeout_ms: u64,
    /// Already validated by the path policy.
    pub working_directory: Option<PathBuf>,
    pub adaptive: Option<AdaptiveConfig>,
    pub overflow_strategy: OverflowStrategy,
    pub capture_process_metrics: bool,
    pub disable_self_destruct: bool,
    pub max_output_bytes: usize,
    pub max_lines: usize,
    pub chunk_bytes: usize,
}

pub struct Executor {
    shell_override: Option<String>,
}

#[derive(Debug, Default)]
struct OutputState {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    /// Raw bytes seen on both streams, retained or not.
    total_bytes: u64,
    stdout_lines: usize,
    overflowed: bool,
    line_capped: bool,
    /// Retention stopped; readers keep draining so the child is never
    /// blocked on a full pipe.
    stopped: bool,
}

#[derive(Debug, Clone, Copy)]
enum StreamTarget {
    Stdout,
    Stderr,
}

enum LoopOutcome {
    Exited(std::io::Result<ExitStatus>),
    TimeoutFired,
    OverflowFired,
}

impl Executor {
    pub fn new(shell_override: Option<String>) -> Self {
        Self { shell_override }
    }

    pub async fn execute(
        &self,
        req: ExecRequest,
        assessment: SecurityAssessment,
    ) -> Result<ExecutionResult> {
        let resolved = resolve_shell(self.shell_override.as_deref());

        // With adaptive extension in play the hard cap, not the initial
        // deadline, is the last moment the shell may still be alive; the
        // internal timer is armed against that.
        let self_destruct_horizon_ms = req
            .adaptive
            .map(|a| a.max_total_ms.max(req.timeout_ms))
            .unwrap_or(req.timeout_ms);
        let wrap = WrapOptions {
            effective_timeout_ms: self_destruct_horizon_ms,
            self_destruct: !req.disable_self_destruct
                && resolved.flavor == ShellFlavor::PowerShell,
            capture_process_metrics: req.capture_process_metrics
                && resolved.flavor == ShellFlavor::PowerShell,
        };
        let args = shell_args(resolved.flavor, &req.command, wrap);

        let mut cmd = Command::new(&resolved.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &req.working_directory {
            cmd.current_dir(dir);
        }

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", resolved.program.display()))?;

        let state = Arc::new(Mutex::new(OutputState::default()));
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let overflow_notify = Arc::new(Notify::new());

        let stdout_pipe = child.stdout.take().context("child stdout not captured")?;
        let stderr_pipe = child.stderr.take().context("child stderr not captured")?;
        let stdout_reader = spawn_reader(
            stdout_pipe,
            StreamTarget::Stdout,
            state.clone(),
            last_activity.clone(),
            overflow_notify.clone(),
            req.max_output_bytes,
            req.max_lines,
            req.chunk_bytes,
        );
        let stderr_reader = spawn_reader(
            stderr_pipe,
            StreamTarget::Stderr,
            state.clone(),
            last_activity.clone(),
            overflow_notify.clone(),
            req.max_output_bytes,
            req.max_lines,
            req.chunk_bytes,
        );

        let configured_timeout_ms = req.timeout_ms;
        let mut effective_timeout_ms = req.timeout_ms;
        let mut deadline = started + Duration::from_millis(req.timeout_ms);
        let mut adaptive_extensions = 0u32;
        let grace = kill_grace(req.timeout_ms);

        let adaptive_period = req
            .adaptive
            .map(|a| Duration::from_millis((a.extend_window_ms / 2).min(1000).max(1)))
            .unwrap_or(Duration::from_secs(3600));
        let mut adaptive_tick = interval_at(started + adaptive_period, adaptive_period);
        adaptive_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let outcome = loop {
            tokio::select! {
                status = child.wait() => break LoopOutcome::Exited(status),
                _ = sleep_until(deadline) => break LoopOutcome::TimeoutFired,
                _ = overflow_notify.notified() => {
                    match req.overflow_strategy {
                        // Retention already stopped by the readers; the
                        // child runs on to completion or timeout.
                        OverflowStrategy::Truncate => continue,
                        _ => break LoopOutcome::OverflowFired,
                    }
                }
                _ = adaptive_tick.tick(), if req.adaptive.is_some() => {
                    if let Some(a) = req.adaptive {
                        let now = Instant::now();
                        let window = Duration::from_millis(a.extend_window_ms);
                        let remaining = deadline.saturating_duration_since(now);
                        let idle = now.duration_since(*last_activity.lock());
                        let elapsed = now.duration_since(started);
                        let stepped = elapsed + Duration::from_millis(a.extend_step_ms);
                        if remaining <= window
                            && idle <= window
                            && stepped <= Duration::from_millis(a.max_total_ms)
                        {
                            deadline += Duration::from_millis(a.extend_step_ms);
                            effective_timeout_ms += a.extend_step_ms;
                            adaptive_extensions += 1;
                            debug!(
                                adaptive_extensions,
                                effective_timeout_ms, "extended execution deadline"
                            );
                        }
                    }
                }
            }
        };

        let mut timed_out = false;
        let mut watchdog_triggered = false;
        let mut kill_escalated = false;
        let mut kill_tree_attempted = false;
        let mut overflow_returned = false;
        let mut exit_status: Option<ExitStatus> = None;

        match outcome {
            LoopOutcome::Exited(res) => {
                exit_status = res.ok();
            }
            LoopOutcome::TimeoutFired => {
                timed_out = true;
                let kill = terminate_child(&mut child, grace).await;
                exit_status = kill.status;
                kill_escalated = kill.escalated;
                kill_tree_attempted = kill.tree_attempted;
                if exit_status.is_none() {
                    // Backstop: the child could not be reaped within
                    // grace + 2s of the deadline.
                    watchdog_triggered = true;
                }
            }
            LoopOutcome::OverflowFired => match req.overflow_strategy {
                OverflowStrategy::Return => {
                    overflow_returned = true;
                    let mut orphan = child;
                    tokio::spawn(async move {
                        let kill = terminate_child(&mut orphan, Duration::from_secs(2)).await;
                        if kill.status.is_none() {
                            warn!("overflowed child survived termination attempts");
                        }
                    });
                }
                OverflowStrategy::Terminate => {
                    let kill = terminate_child(&mut child, grace).await;
                    exit_status = kill.status;
                    kill_escalated = kill.escalated;
                    kill_tree_attempted = kill.tree_attempted;
                }
                // Truncate never leaves the loop on overflow.
                OverflowStrategy::Truncate => {}
            },
        }

        if overflow_returned {
            // Respond with partial output now; stop pulling from the pipes.
            stdout_reader.abort();
            stderr_reader.abort();
        } else {
            let _ = timeout(Duration::from_secs(1), stdout_reader).await;
            let _ = timeout(Duration::from_secs(1), stderr_reader).await;
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let duration_ms = elapsed_ms.max(1);

        let (stdout_raw, stderr_raw, total_bytes, overflowed, line_capped) = {
            let st = state.lock();
            (
                st.stdout.clone(),
                st.stderr.clone(),
                st.total_bytes,
                st.overflowed,
                st.line_capped,
            )
        };

        let mut exit_code = exit_status.and_then(|s| s.code());
        #[cfg(unix)]
        if exit_code.is_none() {
            use std::os::unix::process::ExitStatusExt;
            // Signal deaths surface as 128 + signo, matching shell
            // conventions.
            exit_code = exit_status.and_then(|s| s.signal()).map(|sig| 128 + sig);
        }

        let mut internal_self_destruct = false;
        if exit_code == Some(SELF_DESTRUCT_EXIT_CODE) && !timed_out {
            timed_out = true;
            internal_self_destruct = true;
        }

        let mut stdout = String::from_utf8_lossy(&stdout_raw).into_owned();
        let stderr = String::from_utf8_lossy(&stderr_raw).into_owned();

        let (mut ps_cpu_sec, mut ps_ws_mb) = (None, None);
        if wrap.capture_process_metrics {
            let (clean, sample) = extract_sentinel(&stdout);
            stdout = clean;
            if let Some((cpu, ws)) = sample {
                ps_cpu_sec = Some(cpu);
                ps_ws_mb = Some(ws);
            }
        }

        if line_capped {
            stdout = stdout
                .lines()
                .take(req.max_lines)
                .collect::<Vec<_>>()
                .join("\n");
        }

        let truncated = overflowed || line_capped;
        if truncated {
            stdout.push_str(TRUNCATION_MARKER);
        }

        let termination_reason = if timed_out {
            TerminationReason::Timeout
        } else if overflowed {
            TerminationReason::Overflow
        } else if exit_code != Some(0) {
            TerminationReason::Killed
        } else {
            TerminationReason::Completed
        };

        Ok(ExecutionResult {
            success: termination_reason == TerminationReason::Completed,
            exit_code,
            stdout,
            stderr,
            duration_ms,
            configured_timeout_ms,
            effective_timeout_ms,
            adaptive_extensions,
            adaptive_max_total_ms: req.adaptive.map(|a| a.max_total_ms),
            termination_reason,
            timed_out,
            overflow: overflowed,
            truncated,
            total_bytes,
            internal_self_destruct,
            watchdog_triggered,
            kill_escalated,
            kill_tree_attempted,
            ps_cpu_sec,
            ps_ws_mb,
            shell_resolution: resolved.attempts,
            security_assessment: assessment,
        })
    }
}

/// SIGTERM grace before SIGKILL: ~10% of the timeout, clamped to [2s, 5s].
fn kill_grace(timeout_ms: u64) -> Duration {
    Duration::from_millis((timeout_ms / 10).clamp(2000, 5000))
}

struct KillOutcome {
    status: Option<ExitStatus>,
    escalated: bool,
    tree_attempted: bool,
}

/// Two-stage termination: polite signal, grace window, hard kill, short
/// reap window.
async fn terminate_child(child: &mut Child, grace: Duration) -> KillOutcome {
    let mut tree_attempted = false;

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    #[cfg(windows)]
    if let Some(pid) = child.id() {
        tree_attempted = true;
        let _ = Command::new("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .output()
            .await;
    }

    if let Ok(Ok(status)) = timeout(grace, child.wait()).await {
        return KillOutcome {
            status: Some(status),
            escalated: false,
            tree_attempted,
        };
    }

    let _ = child.start_kill();
    let status = match timeout(Duration::from_secs(2), child.wait()).await {
        Ok(Ok(status)) => Some(status),
        _ => None,
    };
    KillOutcome {
        status,
        escalated: true,
        tree_attempted,
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_reader<R>(
    mut pipe: R,
    target: StreamTarget,
    state: Arc<Mutex<OutputState>>,
    last_activity: Arc<Mutex<Instant>>,
    overflow_notify: Arc<Notify>,
    max_output_bytes: usize,
    max_lines: usize,
    chunk_bytes: usize,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; chunk_bytes.max(1)];
        loop {
            let n = match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            *last_activity.lock() = Instant::now();

            let mut st = state.lock();
            st.total_bytes += n as u64;

            let over_cap = (st.stdout.len() + st.stderr.len() + n) > max_output_bytes
                || st.total_bytes > max_output_bytes as u64;
            if !st.stopped {
                let retained = st.stdout.len() + st.stderr.len();
                let room = max_output_bytes.saturating_sub(retained);
                let keep = n.min(room);
                match target {
                    StreamTarget::Stdout => {
                        st.stdout.extend_from_slice(&buf[..keep]);
                        st.stdout_lines += buf[..keep].iter().filter(|&&b| b == b'\n').count();
                        if st.stdout_lines > max_lines && !st.line_capped {
                            st.line_capped = true;
                            st.stopped = true;
                        }
                    }
                    StreamTarget::Stderr => st.stderr.extend_from_slice(&buf[..keep]),
                }
            }
            if over_cap && !st.overflowed {
                st.overflowed = true;
                st.stopped = true;
                overflow_notify.notify_one();
            }
        }
    })
}
