//! Learning pipeline for unmatched commands.
//!
//! UNKNOWN classifications land here as redacted, hashed candidates. The
//! journal is append-only NDJSON keyed by a keyed HMAC of the normalized
//! form; raw command text is never stored. Aggregated candidates can be
//! scored, queued, and, after human approval, promoted to learned-safe
//! patterns in the pattern store.

use crate::security::patterns::{PatternChange, PatternStore};
use crate::security::redact::{anchored_pattern, normalize};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

type HmacSha256 = Hmac<Sha256>;

const CANDIDATES_FILE: &str = "learnCandidates.jsonl";
const QUEUE_FILE: &str = "learn-queue.json";
const APPROVED_FILE: &str = "learned-safe.json";

/// One journal line. `first_seen`/`last_seen` coincide at append time and
/// spread apart under aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CandidateLine {
    structural_hash: String,
    normalized: String,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    session_id: String,
}

/// Aggregated view of one normalized form across the journal.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateAggregate {
    pub normalized: String,
    pub structural_hash: String,
    pub count: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub distinct_sessions: u64,
    /// Redacted sample shown to the approving human; identical to the
    /// normalized form since nothing rawer is retained.
    pub sample_redacted: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnQueueEntry {
    pub normalized: String,
    pub added_at: DateTime<Utc>,
    pub last_queued_at: DateTime<Utc>,
    pub times_queued: u32,
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub normalized: String,
    pub score: f64,
    pub rationale: String,
    pub count: u64,
    pub distinct_sessions: u64,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovedPattern {
    pub normalized: String,
    pub added: DateTime<Utc>,
    pub pattern: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApprovedFile {
    version: u32,
    approved: Vec<ApprovedPattern>,
}

impl Default for ApprovedFile {
    fn default() -> Self {
        Self {
            version: 1,
            approved: Vec::new(),
        }
    }
}

/// Summary for the threat-analysis tool.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreatSummary {
    pub total_sightings: u64,
    pub distinct_forms: u64,
    pub distinct_sessions: u64,
    pub top: Vec<CandidateAggregate>,
}

pub struct LearningPipeline {
    data_dir: PathBuf,
    hmac_secret: String,
    journal_max_bytes: u64,
    store: Arc<PatternStore>,
    // Serializes journal rotation and queue/approved rewrites.
    file_lock: Mutex<()>,
}

impl LearningPipeline {
    pub fn new(
        data_dir: PathBuf,
        hmac_secret: String,
        journal_max_bytes: u64,
        store: Arc<PatternStore>,
    ) -> Self {
        Self {
            data_dir,
            hmac_secret,
            journal_max_bytes,
            store,
            file_lock: Mutex::new(()),
        }
    }

    /// Keyed HMAC over the normalized form, hex-encoded. Used as the
    /// aggregation key without ever retaining raw text.
    pub fn structural_hash(&self, normalized: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.hmac_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(normalized.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn candidates_path(&self) -> PathBuf {
        self.data_dir.join(CANDIDATES_FILE)
    }

    fn queue_path(&self) -> PathBuf {
        self.data_dir.join(QUEUE_FILE)
    }

    fn approved_path(&self) -> PathBuf {
        self.data_dir.join(APPROVED_FILE)
    }

    /// Redact, normalize, hash, and append one candidate line. Rotates the
    /// journal when it outgrows the configured threshold.
    pub fn record(&self, command: &str, session_id: &str) -> Result<()> {
        let normalized = normalize(command);
        if normalized.is_empty() {
            return Ok(());
        }
        let now = Utc::now();
        let line = CandidateLine {
            structural_hash: self.structural_hash(&normalized),
            normalized,
            first_seen: now,
            last_seen: now,
            session_id: session_id.to_string(),
        };
        let json = serde_json::to_string(&line)?;

        let _guard = self.file_lock.lock();
        fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("creating data dir {:?}", self.data_dir))?;
        let path = self.candidates_path();
        if let Ok(meta) = fs::metadata(&path) {
            if meta.len() >= self.journal_max_bytes {
                let rotated = path.with_extension("jsonl.1");
                fs::rename(&path, &rotated)
                    .with_context(|| format!("rotating journal to {rotated:?}"))?;
            }
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("opening journal {path:?}"))?;
        writeln!(file, "{json}").context("appending candidate line")?;
        Ok(())
    }

    /// Scan the journal (current plus one rotated generation) and aggregate
    /// by structural hash.
    pub fn aggregate(&self) -> Result<Vec<CandidateAggregate>> {
        let _guard = self.file_lock.lock();
        let mut by_hash: HashMap<String, CandidateAggregate> = HashMap::new();
        let mut sessions: HashMap<String, std::collections::HashSet<String>> = HashMap::new();

        let rotated = self.candidates_path().with_extension("jsonl.1");
        for path in [rotated, self.candidates_path()] {
            let content = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(_) => continue,
            };
            for raw in content.lines().filter(|l| !l.trim().is_empty()) {
                let line: CandidateLine = match serde_json::from_str(raw) {
                    Ok(l) => l,
                    Err(e) => {
                        tracing::warn!("skipping malformed candidate line: {e}");
                        continue;
                    }
                };
                sessions
                    .entry(line.structural_hash.clone())
                    .or_default()
                    .insert(line.session_id.clone());
                by_hash
                    .entry(line.structural_hash.clone())
                    .and_modify(|agg| {
                        agg.count += 1;
                        agg.first_seen = agg.first_seen.min(line.first_seen);
                        agg.last_seen = agg.last_seen.max(line.last_seen);
                    })
                    .or_insert_with(|| CandidateAggregate {
                        normalized: line.normalized.clone(),
                        structural_hash: line.structural_hash.clone(),
                        count: 1,
                        first_seen: line.first_seen,
                        last_seen: line.last_seen,
                        distinct_sessions: 0,
                        sample_redacted: line.normalized.clone(),
                    });
            }
        }

        let mut out: Vec<CandidateAggregate> = by_hash
            .into_iter()
            .map(|(hash, mut agg)| {
                agg.distinct_sessions = sessions.get(&hash).map(|s| s.len() as u64).unwrap_or(0);
                agg
            })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count).then(a.normalized.cmp(&b.normalized)));
        Ok(out)
    }

    /// Score candidates for promotion. Each factor is normalized to [0,1]
    /// and the weighted sum is scaled to [0,100].
    pub fn recommend(&self, limit: usize, min_count: u64) -> Result<Vec<Recommendation>> {
        let aggregates = self.aggregate()?;
        let candidates: Vec<&CandidateAggregate> = aggregates
            .iter()
            .filter(|a| a.count >= min_count)
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let max_count = candidates.iter().map(|a| a.count).max().unwrap_or(1).max(1);
        let max_sessions = candidates
            .iter()
            .map(|a| a.distinct_sessions)
            .max()
            .unwrap_or(1)
            .max(1);

        let density_of = |a: &CandidateAggregate| -> f64 {
            let span = (a.last_seen - a.first_seen).num_seconds().max(1) as f64;
            a.count as f64 / span
        };
        let max_density = candidates
            .iter()
            .map(|a| density_of(a))
            .fold(f64::MIN, f64::max)
            .max(f64::EPSILON);

        let mut recs: Vec<Recommendation> = candidates
            .into_iter()
            .map(|a| {
                let frequency = a.count as f64 / max_count as f64;
                let sessions = a.distinct_sessions as f64 / max_sessions as f64;
                let density = density_of(a) / max_density;
                let hours_since = (now - a.last_seen).num_seconds().max(0) as f64 / 3600.0;
                let recency = 1.0 / (1.0 + hours_since);

                let score = 100.0
                    * (0.40 * frequency + 0.25 * sessions + 0.20 * density + 0.15 * recency);
                let score = (score * 100.0).round() / 100.0;

                let rationale = format!(
                    "count={} (freq={frequency:.4}), distinctSessions={} (sessions={sessions:.4}), \
                     density={:.6}/s (norm={density:.4}), hoursSinceLastSeen={hours_since:.2} \
                     (recency={recency:.4})",
                    a.count,
                    a.distinct_sessions,
                    density_of(a),
                );

                Recommendation {
                    normalized: a.normalized.clone(),
                    score,
                    rationale,
                    count: a.count,
                    distinct_sessions: a.distinct_sessions,
                    last_seen: a.last_seen,
                }
            })
            .collect();

        recs.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        recs.truncate(limit);
        Ok(recs)
    }

    fn load_queue(&self) -> Vec<LearnQueueEntry> {
        fs::read_to_string(self.queue_path())
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or_default()
    }

    fn save_queue(&self, queue: &[LearnQueueEntry]) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        let json = serde_json::to_string_pretty(queue)?;
        fs::write(self.queue_path(), json).context("writing learn queue")
    }

    pub fn list_queue(&self) -> Vec<LearnQueueEntry> {
        let _guard = self.file_lock.lock();
        self.load_queue()
    }

    /// Add normalized forms to the review queue; re-queueing bumps the
    /// counter instead of duplicating the entry.
    pub fn queue(&self, normalized: &[String], source: &str) -> Result<Vec<LearnQueueEntry>> {
        let _guard = self.file_lock.lock();
        let mut queue = self.load_queue();
        let now = Utc::now();
        for form in normalized {
            if let Some(entry) = queue.iter_mut().find(|e| &e.normalized == form) {
                entry.times_queued += 1;
                entry.last_queued_at = now;
            } else {
                queue.push(LearnQueueEntry {
                    normalized: form.clone(),
                    added_at: now,
                    last_queued_at: now,
                    times_queued: 1,
                    source: source.to_string(),
                });
            }
        }
        self.save_queue(&queue)?;
        Ok(queue)
    }

    pub fn remove_from_queue(&self, normalized: &[String]) -> Result<Vec<LearnQueueEntry>> {
        let _guard = self.file_lock.lock();
        let mut queue = self.load_queue();
        queue.retain(|e| !normalized.contains(&e.normalized));
        self.save_queue(&queue)?;
        Ok(queue)
    }

    fn load_approved(&self) -> ApprovedFile {
        fs::read_to_string(self.approved_path())
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok())
            .unwrap_or_default()
    }

    /// Previously approved patterns, for seeding the pattern store at boot.
    pub fn approved_patterns(&self) -> Vec<(String, String)> {
        let _guard = self.file_lock.lock();
        self.load_approved()
            .approved
            .iter()
            .map(|a| (format!("learned:{}", a.normalized), a.pattern.clone()))
            .collect()
    }

    /// Promote normalized forms to learned-safe patterns. Persistence comes
    /// first; if the approved list cannot be written, the in-memory store is
    /// left untouched.
    pub fn approve(&self, normalized: &[String], source: &str) -> Result<Vec<ApprovedPattern>> {
        let _guard = self.file_lock.lock();
        let mut approved = self.load_approved();
        let now = Utc::now();
        let mut newly: Vec<ApprovedPattern> = Vec::new();

        for form in normalized {
            if approved.approved.iter().any(|a| &a.normalized == form) {
                continue;
            }
            newly.push(ApprovedPattern {
                normalized: form.clone(),
                added: now,
                pattern: anchored_pattern(form),
                source: source.to_string(),
            });
        }
        if newly.is_empty() {
            return Ok(newly);
        }

        approved.approved.extend(newly.iter().cloned());
        fs::create_dir_all(&self.data_dir)?;
        let json = serde_json::to_string_pretty(&approved)?;
        fs::write(self.approved_path(), json).context("persisting approved list")?;

        for a in &newly {
            self.store.mutate(PatternChange::AddLearnedSafe {
                name: format!("learned:{}", a.normalized),
                pattern: a.pattern.clone(),
            })?;
        }

        // Approved forms leave the queue.
        let mut queue = self.load_queue();
        queue.retain(|e| !normalized.contains(&e.normalized));
        self.save_queue(&queue)?;

        Ok(newly)
    }

    /// Totals and top-N aggregates for the threat-analysis tool.
    pub fn threat_summary(&self, top: usize) -> Result<ThreatSummary> {
        let aggregates = self.aggregate()?;
        let total_sightings = aggregates.iter().map(|a| a.count).sum();
        let distinct_forms = aggregates.len() as u64;
        // Session ids are not retained per aggregate, so the cross-form
        // union is approximated by the largest per-form count.
        let distinct_sessions = aggregates
            .iter()
            .map(|a| a.distinct_sessions)
            .max()
            .unwrap_or(0);
        let mut top_n = aggregates;
        top_n.truncate(top);
        Ok(ThreatSummary {
            total_sightings,
            distinct_forms,
            distinct_sessions,
            top: top_n,
        })
    }
}
