//! Append-only audit journal.
//!
//! Every policy outcome is written twice per calendar day: a pretty-printed
//! human log and a strict NDJSON machine log, with each entry mirrored to
//! stderr. Journal failures are logged and swallowed; audit trouble never
//! fails a caller.

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

/// Metadata string fields longer than this are cut.
const MAX_METADATA_STRING: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub level: AuditLevel,
    pub category: String,
    pub message: String,
    pub metadata: Value,
}

struct DayFiles {
    date: NaiveDate,
    pretty: File,
    ndjson: File,
}

pub struct AuditJournal {
    logs_dir: PathBuf,
    files: Mutex<Option<DayFiles>>,
}

impl AuditJournal {
    pub fn new(logs_dir: PathBuf) -> Self {
        Self {
            logs_dir,
            files: Mutex::new(None),
        }
    }

    /// Append one entry to both journals and mirror it to stderr.
    pub fn log(&self, level: AuditLevel, category: &str, message: &str, metadata: Value) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            level,
            category: category.to_string(),
            message: message.to_string(),
            metadata: sanitize_metadata(metadata),
        };

        // Mirror to stderr through tracing regardless of journal health.
        match level {
            AuditLevel::Info => tracing::info!(
                target: "audit",
                category = %entry.category,
                message = %entry.message,
                metadata = %entry.metadata,
            ),
            AuditLevel::Warning => tracing::warn!(
                target: "audit",
                category = %entry.category,
                message = %entry.message,
                metadata = %entry.metadata,
            ),
            AuditLevel::Error => tracing::error!(
                target: "audit",
                category = %entry.category,
                message = %entry.message,
                metadata = %entry.metadata,
            ),
        }

        if let Err(e) = self.write_entry(&entry) {
            warn!("audit journal write failed: {e}");
        }
    }

    fn write_entry(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        let mut guard = self.files.lock();
        let today = Utc::now().date_naive();

        let reopen = match guard.as_ref() {
            Some(files) => files.date != today,
            None => true,
        };
        if reopen {
            std::fs::create_dir_all(&self.logs_dir)?;
            let stamp = today.format("%Y-%m-%d");
            let pretty = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.logs_dir.join(format!("audit-{stamp}.log")))?;
            let ndjson = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.logs_dir.join(format!("audit-{stamp}.ndjson")))?;
            *guard = Some(DayFiles {
                date: today,
                pretty,
                ndjson,
            });
        }

        if let Some(files) = guard.as_mut() {
            writeln!(files.pretty, "{}\n", serde_json::to_string_pretty(entry)?)?;
            writeln!(files.ndjson, "{}", serde_json::to_string(entry)?)?;
        }
        Ok(())
    }

    /// Flush and drop the open handles; called on shutdown.
    pub fn close(&self) {
        let mut guard = self.files.lock();
        if let Some(files) = guard.as_mut() {
            let _ = files.pretty.flush();
            let _ = files.ndjson.flush();
        }
        *guard = None;
    }
}

/// Clamp metadata so a hostile command line cannot amplify the journal:
/// long strings are truncated and nested structures collapse to a
/// placeholder.
fn sanitize_metadata(metadata: Value) -> Value {
    match metadata {
        Value::Object(map) => {
            let sanitized = map
                .into_iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) if s.chars().count() > MAX_METADATA_STRING => {
                            let cut: String = s.chars().take(MAX_METADATA_STRING).collect();
                            Value::String(format!("{cut}…[truncated]"))
                        }
                        Value::Object(_) | Value::Array(_) => Value::String("[object]".to_string()),
                        other => other,
                    };
                    (k, v)
                })
                .collect();
            Value::Object(sanitized)
        }
        Value::Null => Value::Object(serde_json::Map::new()),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other);
            Value::Object(map)
        }
    }
}
