//! Tenant identity.
//!
//! A [`TenantId`] is a validated slug, not a free-form string: it is
//! embedded verbatim in backend keys, so the character set and length are
//! restricted up front. Construction is the only place validation happens;
//! every holder of a `TenantId` can assume it is well-formed.

use crate::error::PathError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum tenant id length in bytes.
pub const MAX_TENANT_LEN: usize = 64;

static TENANT_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").expect("tenant pattern is valid"));

/// Validated tenant identifier.
///
/// Lowercase alphanumeric slug, optionally with `-` and `_` after the
/// first character, at most 64 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Validate and wrap a tenant id.
    pub fn new(value: impl Into<String>) -> Result<Self, PathError> {
        let value = value.into();
        if value.len() > MAX_TENANT_LEN {
            return Err(PathError::InvalidTenant {
                value,
                reason: format!("longer than {} bytes", MAX_TENANT_LEN),
            });
        }
        if !TENANT_PATTERN.is_match(&value) {
            return Err(PathError::InvalidTenant {
                value,
                reason: "must match [a-z0-9][a-z0-9_-]*".to_string(),
            });
        }
        Ok(TenantId(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TenantId::new(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TenantId::new(value)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> String {
        id.0
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_valid_slugs() {
        for valid in ["acme", "acme-prod", "team_42", "a", "0start"] {
            assert!(TenantId::new(valid).is_ok(), "expected {valid:?} to parse");
        }
    }

    #[test]
    fn test_rejects_invalid_slugs() {
        for invalid in ["", "Acme", "has space", "-leading", "_leading", "sla/sh", "dot.ted"] {
            assert!(
                TenantId::new(invalid).is_err(),
                "expected {invalid:?} to be rejected"
            );
        }
    }

    #[test]
    fn test_rejects_over_length() {
        let long = "a".repeat(MAX_TENANT_LEN + 1);
        let err = TenantId::new(long).unwrap_err();
        assert!(matches!(err, PathError::InvalidTenant { .. }));
    }

    #[test]
    fn test_length_boundary() {
        let exact = "a".repeat(MAX_TENANT_LEN);
        assert!(TenantId::new(exact).is_ok());
    }

    #[test]
    fn test_serde_round_trip() {
        let id = TenantId::new("acme-prod").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"acme-prod\"");
        let back: TenantId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_serde_rejects_invalid() {
        let result: Result<TenantId, _> = serde_json::from_str("\"Not Valid\"");
        assert!(result.is_err());
    }
}
