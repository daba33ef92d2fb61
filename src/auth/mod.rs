//! Caller authentication.
//!
//! A single shared secret, configured at startup, that every tool call must
//! present. Distinct from the confirmation flag: authentication says who may
//! talk to the gateway at all, confirmation approves one risky command.

use tracing::debug;

/// Verifies the shared secret presented by callers.
pub struct Authenticator {
    key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    MissingKey,
    InvalidKey,
}

impl AuthError {
    pub fn message(self) -> &'static str {
        match self {
            AuthError::MissingKey => "Missing authentication key",
            AuthError::InvalidKey => "Invalid authentication key",
        }
    }
}

impl Authenticator {
    /// `None` disables authentication entirely (local single-user setups).
    pub fn new(key: Option<String>) -> Self {
        Self { key }
    }

    pub fn enabled(&self) -> bool {
        self.key.is_some()
    }

    pub fn verify(&self, presented: Option<&str>) -> Result<(), AuthError> {
        let expected = match &self.key {
            None => return Ok(()),
            Some(k) => k,
        };
        let presented = presented.ok_or(AuthError::MissingKey)?;
        if constant_time_eq(expected.as_bytes(), presented.as_bytes()) {
            debug!("caller authenticated");
            Ok(())
        } else {
            Err(AuthError::InvalidKey)
        }
    }
}

/// Length-safe comparison that does not short-circuit on the first
/// mismatching byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_auth_accepts_anything() {
        let auth = Authenticator::new(None);
        assert!(auth.verify(None).is_ok());
        assert!(auth.verify(Some("whatever")).is_ok());
        assert!(!auth.enabled());
    }

    #[test]
    fn test_missing_key_rejected() {
        let auth = Authenticator::new(Some("sekrit".into()));
        assert_eq!(auth.verify(None), Err(AuthError::MissingKey));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let auth = Authenticator::new(Some("sekrit".into()));
        assert_eq!(auth.verify(Some("nope")), Err(AuthError::InvalidKey));
        assert_eq!(auth.verify(Some("sekri")), Err(AuthError::InvalidKey));
    }

    #[test]
    fn test_correct_key_accepted() {
        let auth = Authenticator::new(Some("sekrit".into()));
        assert!(auth.verify(Some("sekrit")).is_ok());
    }
}
