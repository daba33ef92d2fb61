//! In-memory metrics registry.
//!
//! Counters per classification level, duration and process-sample vectors
//! with mean and p95, and a bounded ring of recent execution records for
//! event replay. Blocked and confirmation-required attempts carry zero
//! duration and never feed the duration vector, so latency percentiles
//! reflect real executions only.

use crate::models::{SecurityLevel, TerminationReason};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

const RECENT_RING_CAPACITY: usize = 1000;

/// Compact record of one finished execution or attempt, kept in the replay
/// ring.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub timestamp: DateTime<Utc>,
    pub preview: String,
    pub level: SecurityLevel,
    pub duration_ms: u64,
    pub blocked: bool,
    pub truncated: bool,
    pub timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
    pub confirmed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total_commands: u64,
    pub by_level: BTreeMap<String, u64>,
    pub blocked: u64,
    pub truncated: u64,
    pub timeouts: u64,
    pub confirmation_required: u64,
    pub duration_samples: u64,
    pub average_duration_ms: f64,
    pub p95_duration_ms: f64,
    pub ps_cpu_samples: u64,
    pub average_ps_cpu_sec: f64,
    pub p95_ps_cpu_sec: f64,
    pub ps_ws_samples: u64,
    pub average_ps_ws_mb: f64,
    pub p95_ps_ws_mb: f64,
    pub last_reset: DateTime<Utc>,
}

#[derive(Debug)]
struct MetricsInner {
    total: u64,
    by_level: BTreeMap<String, u64>,
    blocked: u64,
    truncated: u64,
    timeouts: u64,
    confirmation_required: u64,
    durations_ms: Vec<f64>,
    ps_cpu: Vec<f64>,
    ps_ws: Vec<f64>,
    recent: VecDeque<ExecutionRecord>,
    last_reset: DateTime<Utc>,
}

impl MetricsInner {
    fn fresh() -> Self {
        Self {
            total: 0,
            by_level: BTreeMap::new(),
            blocked: 0,
            truncated: 0,
            timeouts: 0,
            confirmation_required: 0,
            durations_ms: Vec::new(),
            ps_cpu: Vec::new(),
            ps_ws: Vec::new(),
            recent: VecDeque::with_capacity(RECENT_RING_CAPACITY),
            last_reset: Utc::now(),
        }
    }
}

pub struct MetricsRegistry {
    inner: Mutex<MetricsInner>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MetricsInner::fresh()),
        }
    }

    /// Record one finished execution or attempt. Only non-zero durations
    /// feed the duration vector.
    pub fn record(&self, rec: ExecutionRecord, ps_cpu: Option<f64>, ps_ws: Option<f64>) {
        let mut inner = self.inner.lock();
        inner.total += 1;
        *inner.by_level.entry(rec.level.to_string()).or_insert(0) += 1;
        if rec.blocked {
            inner.blocked += 1;
        }
        if rec.truncated {
            inner.truncated += 1;
        }
        if rec.duration_ms > 0 {
            inner.durations_ms.push(rec.duration_ms as f64);
        }
        if let Some(cpu) = ps_cpu {
            inner.ps_cpu.push(cpu);
        }
        if let Some(ws) = ps_ws {
            inner.ps_ws.push(ws);
        }
        if inner.recent.len() == RECENT_RING_CAPACITY {
            inner.recent.pop_front();
        }
        inner.recent.push_back(rec);
    }

    pub fn increment_timeout(&self) {
        self.inner.lock().timeouts += 1;
    }

    pub fn increment_confirmation_required(&self) {
        self.inner.lock().confirmation_required += 1;
    }

    /// Point-in-time snapshot; optionally zeroes the registry afterwards.
    pub fn snapshot(&self, reset: bool) -> MetricsSnapshot {
        let mut inner = self.inner.lock();
        let (avg_dur, p95_dur) = mean_p95(&inner.durations_ms);
        let (avg_cpu, p95_cpu) = mean_p95(&inner.ps_cpu);
        let (avg_ws, p95_ws) = mean_p95(&inner.ps_ws);
        let snapshot = MetricsSnapshot {
            total_commands: inner.total,
            by_level: inner.by_level.clone(),
            blocked: inner.blocked,
            truncated: inner.truncated,
            timeouts: inner.timeouts,
            confirmation_required: inner.confirmation_required,
            duration_samples: inner.durations_ms.len() as u64,
            average_duration_ms: avg_dur,
            p95_duration_ms: p95_dur,
            ps_cpu_samples: inner.ps_cpu.len() as u64,
            average_ps_cpu_sec: avg_cpu,
            p95_ps_cpu_sec: p95_cpu,
            ps_ws_samples: inner.ps_ws.len() as u64,
            average_ps_ws_mb: avg_ws,
            p95_ps_ws_mb: p95_ws,
            last_reset: inner.last_reset,
        };
        if reset {
            *inner = MetricsInner::fresh();
        }
        snapshot
    }

    pub fn reset(&self) {
        *self.inner.lock() = MetricsInner::fresh();
    }

    /// Last N records for event replay, oldest first.
    pub fn recent_records(&self, limit: usize) -> Vec<ExecutionRecord> {
        let inner = self.inner.lock();
        inner
            .recent
            .iter()
            .rev()
            .take(limit)
            .rev()
            .cloned()
            .collect()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Mean and p95 of a sample vector. The p95 index is
/// `clamp(floor(0.95 * len) - 1, 0, len - 1)` over the sorted samples,
/// which leans high at low sample counts instead of underestimating.
fn mean_p95(samples: &[f64]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;

    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let len = sorted.len();
    let idx = ((0.95 * len as f64).floor() as isize - 1).clamp(0, len as isize - 1) as usize;
    (mean, sorted[idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(level: SecurityLevel, duration_ms: u64) -> ExecutionRecord {
        ExecutionRecord {
            timestamp: Utc::now(),
            preview: "test".to_string(),
            level,
            duration_ms,
            blocked: level.is_blocking(),
            truncated: false,
            timed_out: false,
            exit_code: Some(0),
            termination_reason: Some(TerminationReason::Completed),
            confirmed: false,
        }
    }

    #[test]
    fn test_counters_by_level() {
        let m = MetricsRegistry::new();
        m.record(record(SecurityLevel::Safe, 10), None, None);
        m.record(record(SecurityLevel::Safe, 20), None, None);
        m.record(record(SecurityLevel::Risky, 30), None, None);
        let snap = m.snapshot(false);
        assert_eq!(snap.total_commands, 3);
        assert_eq!(snap.by_level.get("SAFE"), Some(&2));
        assert_eq!(snap.by_level.get("RISKY"), Some(&1));
    }

    #[test]
    fn test_zero_durations_excluded_from_percentiles() {
        let m = MetricsRegistry::new();
        m.record(record(SecurityLevel::Safe, 100), None, None);
        let before = m.snapshot(false);

        // A blocked attempt with zero duration must not move the math.
        m.record(record(SecurityLevel::Critical, 0), None, None);
        let after = m.snapshot(false);
        assert_eq!(after.average_duration_ms, before.average_duration_ms);
        assert_eq!(after.p95_duration_ms, before.p95_duration_ms);
        assert_eq!(after.duration_samples, 1);
        assert_eq!(after.blocked, 1);
    }

    #[test]
    fn test_p95_single_sample() {
        let m = MetricsRegistry::new();
        m.record(record(SecurityLevel::Safe, 42), None, None);
        let snap = m.snapshot(false);
        assert_eq!(snap.p95_duration_ms, 42.0);
        assert_eq!(snap.average_duration_ms, 42.0);
    }

    #[test]
    fn test_p95_hundred_samples() {
        let m = MetricsRegistry::new();
        for i in 1..=100 {
            m.record(record(SecurityLevel::Safe, i), None, None);
        }
        let snap = m.snapshot(false);
        // floor(0.95 * 100) - 1 = 94 → the 95th sorted value.
        assert_eq!(snap.p95_duration_ms, 95.0);
        assert_eq!(snap.average_duration_ms, 50.5);
    }

    #[test]
    fn test_snapshot_reset_zeroes_counters() {
        let m = MetricsRegistry::new();
        m.record(record(SecurityLevel::Safe, 10), Some(0.5), Some(12.0));
        m.increment_timeout();
        m.increment_confirmation_required();

        let first = m.snapshot(true);
        assert_eq!(first.total_commands, 1);
        assert_eq!(first.timeouts, 1);

        let second = m.snapshot(false);
        assert_eq!(second.total_commands, 0);
        assert_eq!(second.timeouts, 0);
        assert_eq!(second.confirmation_required, 0);
        assert_eq!(second.duration_samples, 0);
        assert_eq!(second.average_duration_ms, 0.0);
        assert!(second.last_reset >= first.last_reset);
    }

    #[test]
    fn test_ps_samples_tracked_separately() {
        let m = MetricsRegistry::new();
        m.record(record(SecurityLevel::Safe, 10), Some(1.0), Some(50.0));
        m.record(record(SecurityLevel::Safe, 10), Some(3.0), Some(70.0));
        let snap = m.snapshot(false);
        assert_eq!(snap.ps_cpu_samples, 2);
        assert_eq!(snap.average_ps_cpu_sec, 2.0);
        assert_eq!(snap.average_ps_ws_mb, 60.0);
    }

    #[test]
    fn test_recent_ring_is_bounded() {
        let m = MetricsRegistry::new();
        for i in 0..1100 {
            m.record(record(SecurityLevel::Safe, i + 1), None, None);
        }
        let recent = m.recent_records(2000);
        assert_eq!(recent.len(), 1000);
        // Oldest entries were evicted.
        assert_eq!(recent[0].duration_ms, 101);
        assert_eq!(recent.last().unwrap().duration_ms, 1100);
    }
}
