//! Live event fan-out.
//!
//! A bounded broadcast channel carries every execution and attempt event to
//! subscribers in publish order. Publishing never blocks: a subscriber that
//! falls behind observes a lag and the gap is counted instead of stalling
//! the pipeline.

use crate::models::{preview_of, Event, EventKind, ExecutionResult, SecurityAssessment};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 1024;

pub struct EventStream {
    tx: broadcast::Sender<Event>,
    dropped: AtomicU64,
    attempt_events: bool,
}

impl EventStream {
    pub fn new(attempt_events: bool) -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            dropped: AtomicU64::new(0),
            attempt_events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Events a lagging subscriber skipped; fed by consumers when they
    /// observe `RecvError::Lagged`.
    pub fn note_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn publish(&self, event: Event) {
        // An error only means there is no subscriber right now.
        let _ = self.tx.send(event);
    }

    /// Publish a finalized execution.
    pub fn publish_execution(
        &self,
        command: &str,
        result: &ExecutionResult,
        confirmed: bool,
        tool_name: &str,
    ) {
        self.publish(Event {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            kind: EventKind::Execution,
            level: result.security_assessment.level,
            duration_ms: result.duration_ms,
            blocked: result.security_assessment.blocked,
            truncated: result.truncated,
            timed_out: result.timed_out,
            exit_code: result.exit_code,
            preview: preview_of(command),
            confirmed,
            tool_name: tool_name.to_string(),
        });
    }

    /// Publish a zero-duration attempt (blocked or unconfirmed request)
    /// when attempt events are enabled.
    pub fn publish_attempt(
        &self,
        command: &str,
        assessment: &SecurityAssessment,
        confirmed: bool,
        tool_name: &str,
    ) {
        if !self.attempt_events {
            return;
        }
        self.publish(Event {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now().to_rfc3339(),
            kind: EventKind::Attempt,
            level: assessment.level,
            duration_ms: 0,
            blocked: assessment.blocked,
            truncated: false,
            timed_out: false,
            exit_code: None,
            preview: preview_of(command),
            confirmed,
            tool_name: tool_name.to_string(),
        });
    }
}
