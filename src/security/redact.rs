//! Command normalization and redaction.
//!
//! Pure functions from a raw command to its normalized form: lowercased,
//! whitespace collapsed, sensitive tokens replaced by named placeholders.
//! The learning pipeline aggregates on this form and never stores raw text.

use regex::Regex;
use std::sync::OnceLock;

fn redaction_rules() -> &'static Vec<(Regex, &'static str)> {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES.get_or_init(|| {
        // Applied in order against the lowercased input.
        vec![
            (
                Regex::new(
                    r"\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b",
                )
                .unwrap(),
                "OBF_GUID",
            ),
            (
                Regex::new(r"\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b").unwrap(),
                "OBF_EMAIL",
            ),
            (
                Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").unwrap(),
                "OBF_IP",
            ),
            // Windows drive paths, then rooted unix paths.
            (Regex::new(r#"[a-z]:[\\/][^\s"']*"#).unwrap(), "OBF_PATH"),
            (Regex::new(r#"(?:^|\s)(/[^\s"']+)"#).unwrap(), " OBF_PATH"),
            (Regex::new(r"\b[0-9a-f]{16,}\b").unwrap(), "OBF_HASH"),
        ]
    })
}

/// Collapse runs of whitespace into single spaces and trim the ends.
pub fn collapse_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Replace sensitive tokens with named placeholders. Expects lowercased
/// input; placeholders stay uppercase so they survive round-trips through
/// `normalize`.
pub fn redact(input: &str) -> String {
    let mut out = input.to_string();
    for (re, placeholder) in redaction_rules() {
        out = re.replace_all(&out, *placeholder).into_owned();
    }
    out
}

/// Full normalization: collapse whitespace, lowercase, redact.
pub fn normalize(raw: &str) -> String {
    let collapsed = collapse_whitespace(raw);
    let redacted = redact(&collapsed.to_lowercase());
    // Redaction can leave doubled spaces around substituted tokens.
    collapse_whitespace(&redacted)
}

/// Author the anchored learned-safe regex for a normalized form:
/// `^tok1\s+tok2...$`, each token escaped.
pub fn anchored_pattern(normalized: &str) -> String {
    let body = normalized
        .split_whitespace()
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"\s+");
    format!("^{body}$")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collapse_whitespace() {
        assert_eq!(collapse_whitespace("  a \t b\n c  "), "a b c");
    }

    #[test]
    fn test_normalize_lowercases_and_collapses() {
        assert_eq!(normalize("Get-Date   -Format  o"), "get-date -format o");
    }

    #[test]
    fn test_redacts_windows_path() {
        let n = normalize(r"Get-Content C:\Users\alice\secrets.txt");
        assert_eq!(n, "get-content OBF_PATH");
    }

    #[test]
    fn test_redacts_unix_path() {
        let n = normalize("cat /etc/passwd");
        assert_eq!(n, "cat OBF_PATH");
    }

    #[test]
    fn test_redacts_guid_ip_email_hash() {
        let n = normalize(
            "Invoke-Thing -Id 01234567-89ab-cdef-0123-456789abcdef -Host 10.0.0.1 \
             -Mail bob@example.com -Sum deadbeefdeadbeefdeadbeef",
        );
        assert!(n.contains("OBF_GUID"), "{n}");
        assert!(n.contains("OBF_IP"), "{n}");
        assert!(n.contains("OBF_EMAIL"), "{n}");
        assert!(n.contains("OBF_HASH"), "{n}");
        assert!(!n.contains("10.0.0.1"));
        assert!(!n.contains("bob@example.com"));
    }

    #[test]
    fn test_short_hex_not_redacted() {
        let n = normalize("Write-Output cafe1234");
        assert_eq!(n, "write-output cafe1234");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let once = normalize(r"dir C:\Temp\x");
        assert_eq!(normalize(&once), once);
    }

    #[test]
    fn test_anchored_pattern_matches_variant_spacing() {
        let p = anchored_pattern("get-date -format o");
        let re = regex::RegexBuilder::new(&p)
            .case_insensitive(true)
            .build()
            .unwrap();
        assert!(re.is_match("get-date   -format o"));
        assert!(!re.is_match("get-date -format o; rm x"));
    }
}
