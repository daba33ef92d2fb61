//! Working-directory policy.
//!
//! Tool calls may supply a working directory for the child process; when
//! enforcement is on, the resolved real path must live under one of the
//! configured allow-roots. Policy changes take effect immediately.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathPolicy {
    pub enforced: bool,
    pub allowed_roots: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPolicyError {
    /// The directory does not exist or cannot be resolved.
    NotResolvable(String),
    /// The resolved path is outside every allow-root.
    OutsideAllowedRoots(String),
}

impl fmt::Display for PathPolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathPolicyError::NotResolvable(p) => {
                write!(f, "working directory cannot be resolved: {p}")
            }
            PathPolicyError::OutsideAllowedRoots(p) => {
                write!(f, "working directory is outside the allowed roots: {p}")
            }
        }
    }
}

impl std::error::Error for PathPolicyError {}

pub struct PathPolicyStore {
    inner: RwLock<PathPolicy>,
}

impl PathPolicyStore {
    pub fn new(enforced: bool, allowed_roots: Vec<String>) -> Self {
        Self {
            inner: RwLock::new(PathPolicy {
                enforced,
                allowed_roots,
            }),
        }
    }

    pub fn current(&self) -> PathPolicy {
        self.inner.read().clone()
    }

    pub fn set(&self, enforced: bool, allowed_roots: Vec<String>) -> PathPolicy {
        let mut policy = self.inner.write();
        policy.enforced = enforced;
        policy.allowed_roots = allowed_roots;
        policy.clone()
    }

    /// Resolve a requested working directory against the current policy.
    /// Links are followed; the check runs on the real path.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, PathPolicyError> {
        let resolved = std::fs::canonicalize(path)
            .map_err(|_| PathPolicyError::NotResolvable(path.to_string()))?;
        if !resolved.is_dir() {
            return Err(PathPolicyError::NotResolvable(path.to_string()));
        }

        let policy = self.inner.read();
        if !policy.enforced {
            return Ok(resolved);
        }

        for root in &policy.allowed_roots {
            let expanded = expand_placeholders(root);
            let Ok(root_real) = std::fs::canonicalize(&expanded) else {
                continue;
            };
            if resolved.starts_with(&root_real) {
                return Ok(resolved);
            }
        }
        Err(PathPolicyError::OutsideAllowedRoots(
            resolved.display().to_string(),
        ))
    }
}

/// Expand `TEMP`-style placeholders in an allow-root: bare `TEMP`/`TMP`,
/// `%NAME%`, and `$NAME` forms are all accepted.
fn expand_placeholders(root: &str) -> PathBuf {
    let trimmed = root.trim();
    match trimmed.to_ascii_uppercase().as_str() {
        "TEMP" | "TMP" | "TMPDIR" => return std::env::temp_dir(),
        "HOME" => {
            if let Ok(home) = std::env::var("HOME") {
                return PathBuf::from(home);
            }
        }
        _ => {}
    }

    let name = trimmed
        .strip_prefix('%')
        .and_then(|r| r.strip_suffix('%'))
        .or_else(|| trimmed.strip_prefix('$'));
    if let Some(name) = name {
        if let Ok(value) = std::env::var(name) {
            return PathBuf::from(value);
        }
    }
    PathBuf::from(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_unenforced_resolves_any_existing_dir() {
        let dir = TempDir::new().unwrap();
        let store = PathPolicyStore::new(false, vec![]);
        let resolved = store.resolve(dir.path().to_str().unwrap()).unwrap();
        assert!(resolved.is_dir());
    }

    #[test]
    fn test_missing_dir_is_not_resolvable() {
        let store = PathPolicyStore::new(false, vec![]);
        let err = store.resolve("/definitely/not/a/real/dir").unwrap_err();
        assert!(matches!(err, PathPolicyError::NotResolvable(_)));
    }

    #[test]
    fn test_enforced_allows_inside_root() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("work");
        std::fs::create_dir(&sub).unwrap();
        let store =
            PathPolicyStore::new(true, vec![dir.path().to_string_lossy().into_owned()]);
        assert!(store.resolve(sub.to_str().unwrap()).is_ok());
    }

    #[test]
    fn test_enforced_rejects_outside_root() {
        let allowed = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let store =
            PathPolicyStore::new(true, vec![allowed.path().to_string_lossy().into_owned()]);
        let err = store.resolve(outside.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, PathPolicyError::OutsideAllowedRoots(_)));
    }

    #[test]
    fn test_policy_change_takes_effect_immediately() {
        let dir = TempDir::new().unwrap();
        let store = PathPolicyStore::new(true, vec![]);
        assert!(store.resolve(dir.path().to_str().unwrap()).is_err());
        store.set(false, vec![]);
        assert!(store.resolve(dir.path().to_str().unwrap()).is_ok());
    }

    #[test]
    fn test_temp_placeholder_expands() {
        let store = PathPolicyStore::new(true, vec!["TEMP".to_string()]);
        let inside = TempDir::new().unwrap();
        // TempDir lives under the system temp dir, so it must pass.
        assert!(store.resolve(inside.path().to_str().unwrap()).is_ok());
    }
}
