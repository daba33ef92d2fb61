//! Pattern store: named regex groups consulted by the classifier.
//!
//! Groups are compiled case-insensitively into an immutable snapshot held
//! behind an `ArcSwap`. Mutation rebuilds the snapshot from its sources and
//! installs it atomically; in-flight classifications keep the snapshot they
//! loaded and never observe a half-built group.

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use std::collections::HashSet;
use std::sync::Arc;

/// One compiled rule. The name shows up in audit output and assessments.
#[derive(Debug)]
pub struct NamedPattern {
    pub name: String,
    pub regex: Regex,
}

impl NamedPattern {
    fn compile(name: &str, pattern: &str) -> Result<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .with_context(|| format!("invalid pattern '{name}': {pattern}"))?;
        Ok(Self {
            name: name.to_string(),
            regex,
        })
    }
}

/// Immutable compiled view of every group, ordered as the classifier
/// consults them.
#[derive(Debug, Default)]
pub struct PatternSnapshot {
    pub critical_aliases: Vec<NamedPattern>,
    pub blocked: Vec<NamedPattern>,
    pub dangerous: Vec<NamedPattern>,
    pub risky: Vec<NamedPattern>,
    pub safe: Vec<NamedPattern>,
    pub learned_safe: Vec<NamedPattern>,
}

impl PatternSnapshot {
    /// First match within a group wins.
    pub fn first_match<'a>(group: &'a [NamedPattern], command: &str) -> Option<&'a NamedPattern> {
        group.iter().find(|p| p.regex.is_match(command))
    }
}

/// Requested change to the store.
#[derive(Debug, Clone)]
pub enum PatternChange {
    AddSafe { name: String, pattern: String },
    AddBlocked { name: String, pattern: String },
    AddLearnedSafe { name: String, pattern: String },
    Suppress { name: String },
}

/// Uncompiled sources the snapshot is rebuilt from.
#[derive(Debug, Default, Clone)]
struct PatternSources {
    suppressed: HashSet<String>,
    extra_safe: Vec<(String, String)>,
    extra_blocked: Vec<(String, String)>,
    learned_safe: Vec<(String, String)>,
}

pub struct PatternStore {
    snapshot: ArcSwap<PatternSnapshot>,
    sources: Mutex<PatternSources>,
}

impl PatternStore {
    pub fn new() -> Self {
        let sources = PatternSources::default();
        let snapshot = build_snapshot(&sources).expect("built-in patterns must compile");
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            sources: Mutex::new(sources),
        }
    }

    /// Seed the store with previously approved learned-safe patterns.
    pub fn with_learned_safe(learned: Vec<(String, String)>) -> Result<Self> {
        let store = Self::new();
        {
            let mut sources = store.sources.lock();
            sources.learned_safe = learned;
            let snapshot = build_snapshot(&sources)?;
            store.snapshot.store(Arc::new(snapshot));
        }
        Ok(store)
    }

    /// Atomically-readable current snapshot.
    pub fn current(&self) -> Arc<PatternSnapshot> {
        self.snapshot.load_full()
    }

    /// Apply one change. The new snapshot is compiled before installation,
    /// so a bad pattern leaves the store untouched.
    pub fn mutate(&self, change: PatternChange) -> Result<()> {
        let mut sources = self.sources.lock();
        let mut next = sources.clone();
        match change {
            PatternChange::AddSafe { name, pattern } => next.extra_safe.push((name, pattern)),
            PatternChange::AddBlocked { name, pattern } => {
                next.extra_blocked.push((name, pattern))
            }
            PatternChange::AddLearnedSafe { name, pattern } => {
                next.learned_safe.push((name, pattern))
            }
            PatternChange::Suppress { name } => {
                next.suppressed.insert(name);
            }
        }
        let snapshot = build_snapshot(&next)?;
        *sources = next;
        self.snapshot.store(Arc::new(snapshot));
        Ok(())
    }
}

impl Default for PatternStore {
    fn default() -> Self {
        Self::new()
    }
}

fn compile_group(
    builtin: &[(&str, &str)],
    extra: &[(String, String)],
    suppressed: &HashSet<String>,
) -> Result<Vec<NamedPattern>> {
    let mut out = Vec::with_capacity(builtin.len() + extra.len());
    for (name, pattern) in builtin {
        if suppressed.contains(*name) {
            continue;
        }
        out.push(NamedPattern::compile(name, pattern)?);
    }
    for (name, pattern) in extra {
        if suppressed.contains(name.as_str()) {
            continue;
        }
        out.push(NamedPattern::compile(name, pattern)?);
    }
    Ok(out)
}

fn build_snapshot(sources: &PatternSources) -> Result<PatternSnapshot> {
    Ok(PatternSnapshot {
        critical_aliases: compile_group(CRITICAL_ALIASES, &[], &sources.suppressed)?,
        blocked: compile_group(BLOCKED, &sources.extra_blocked, &sources.suppressed)?,
        dangerous: compile_group(DANGEROUS, &[], &sources.suppressed)?,
        risky: compile_group(RISKY, &[], &sources.suppressed)?,
        safe: compile_group(SAFE, &sources.extra_safe, &sources.suppressed)?,
        learned_safe: compile_group(&[], &sources.learned_safe, &sources.suppressed)?,
    })
}

/// Suspicious constructions that deny immediately regardless of anything
/// else on the line.
const CRITICAL_ALIASES: &[(&str, &str)] = &[
    ("encoded-command", r"(?:^|\s)-enc(?:odedcommand)?\b"),
    (
        "download-and-execute",
        r"(?:downloadstring|downloadfile|invoke-webrequest|\biwr\b|\bwget\b|\bcurl\b)[^|]*\|\s*(?:iex|invoke-expression)\b",
    ),
    (
        "iex-download",
        r"(?:\biex\b|invoke-expression)[^;]*(?:downloadstring|net\.webclient|invoke-webrequest)",
    ),
    (
        "execution-policy-bypass",
        r"-e(?:xecution)?p(?:olicy)?\s+bypass\b",
    ),
    ("suspicious-alias", r"(?:^|[|;]\s*)(?:iex|icm)\b"),
];

const BLOCKED: &[(&str, &str)] = &[
    (
        "recursive-root-delete",
        r#"remove-item\s+[^|;]*["']?(?:[a-z]:\\|/)["']?\s*(?:-recurse|-force|$)"#,
    ),
    ("posix-root-delete", r"rm\s+-[rf]{2}\s+/(?:\s|$)"),
    ("format-volume", r"format-volume\b|\bmkfs\b"),
    ("disk-wipe", r"clear-disk\b|initialize-disk\b|\bdd\s+if=.*of=/dev"),
    ("credential-theft", r"mimikatz|sekurlsa|\blsass\b"),
    (
        "defender-disable",
        r"set-mppreference\s+[^|;]*-disablerealtimemonitoring",
    ),
    ("fork-bomb", r":\(\)\s*\{.*\}"),
    ("shadow-copy-delete", r"vssadmin\s+delete\s+shadows"),
];

const DANGEROUS: &[(&str, &str)] = &[
    (
        "remove-recurse-force",
        r"remove-item\s+[^|;]*-recurse\s+[^|;]*-force|remove-item\s+[^|;]*-force\s+[^|;]*-recurse|rm\s+-rf\b",
    ),
    (
        "stop-critical-process",
        r"stop-process\s+[^|;]*-name\s+(?:lsass|winlogon|csrss|services)\b",
    ),
    ("shutdown", r"stop-computer\b|restart-computer\b|shutdown\s+/"),
    (
        "firewall-off",
        r"set-netfirewallprofile\s+[^|;]*-enabled\s+false",
    ),
    ("registry-delete", r"remove-itemproperty\s+[^|;]*hklm|reg\s+delete\b"),
    (
        "service-hard-disable",
        r"set-service\s+[^|;]*-startuptype\s+disabled",
    ),
];

const RISKY: &[(&str, &str)] = &[
    ("remove-item", r"remove-item\b|\bdel\s|\brm\s"),
    ("stop-process", r"stop-process\b|\bpkill\b|\bkill\s"),
    ("service-control", r"stop-service\b|restart-service\b|start-service\b"),
    ("set-executionpolicy", r"set-executionpolicy\b"),
    ("package-install", r"install-module\b|install-package\b|uninstall-module\b"),
    ("network-fetch", r"invoke-webrequest\b|invoke-restmethod\b|\biwr\b|\bwget\b|\bcurl\b"),
    ("move-rename", r"move-item\b|rename-item\b|\bmv\s"),
    ("registry-write", r"set-itemproperty\b|new-itemproperty\b"),
];

const SAFE: &[(&str, &str)] = &[
    ("get-date", r"^get-date\b"),
    ("list-children", r"^(?:get-childitem|gci|dir|ls)\b"),
    ("get-location", r"^(?:get-location|gl|pwd)\b"),
    ("get-process-list", r"^(?:get-process|gps)\b"),
    ("get-service-list", r"^get-service\b"),
    ("read-content", r"^(?:get-content|gc|type|cat)\b"),
    ("echo", r"^(?:write-output|write-host|echo)\b"),
    ("test-path", r"^test-path\b"),
    ("get-help", r"^(?:get-help|help|man)\b"),
    ("select-string", r"^select-string\b"),
    ("get-variable", r"^get-variable\b"),
    ("measure-object", r"^measure-object\b"),
];
