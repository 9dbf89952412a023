//! Tenant path policy.
//!
//! Every logical path a caller supplies is tenant-relative. [`StorePath`]
//! normalizes and validates that input once; the functions here then map
//! it into the per-tenant slice of the backend keyspace and back.
//!
//! Key layout:
//!
//! ```text
//! keel/tenants/<tenant>/<relative-path>
//! ```
//!
//! The namespace prefix always ends with the separator, so two tenants can
//! never observe each other's keys even when one tenant id is a string
//! prefix of the other (`acme` vs `acme2`).

use crate::error::PathError;
use crate::tenant::TenantId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Path separator used in logical and backend keys.
pub const SEPARATOR: char = '/';

/// Maximum normalized relative path length in bytes.
pub const MAX_PATH_LEN: usize = 512;

/// Root of the system keyspace. Everything keel writes lives below this.
const NAMESPACE_ROOT: &str = "keel/tenants";

// ============================================================================
// STORE PATH
// ============================================================================

/// A validated, normalized tenant-relative path.
///
/// Invariants held by construction: no leading or trailing separator, no
/// empty segments, no `.`/`..` segments, characters limited to
/// `[A-Za-z0-9._~-]` within segments, total length at most
/// [`MAX_PATH_LEN`]. The empty path is the namespace root and is valid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorePath(String);

impl StorePath {
    /// Normalize raw caller input into a `StorePath`.
    ///
    /// Leading/trailing whitespace and separators are stripped and
    /// separator runs collapsed before validation, so `" /a//b/ "`
    /// normalizes to `a/b`. Blank input normalizes to the root path.
    pub fn normalize(raw: &str) -> Result<StorePath, PathError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(StorePath::root());
        }

        let mut segments = Vec::new();
        for segment in trimmed.split(SEPARATOR) {
            if segment.is_empty() {
                // Collapsed separator run or leading/trailing separator.
                continue;
            }
            if segment == "." || segment == ".." {
                return Err(PathError::Traversal {
                    segment: segment.to_string(),
                });
            }
            if let Some(character) = segment
                .chars()
                .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '.' | '_' | '~' | '-'))
            {
                return Err(PathError::DisallowedCharacter { character });
            }
            segments.push(segment);
        }

        let normalized = segments.join("/");
        if normalized.len() > MAX_PATH_LEN {
            return Err(PathError::TooLong {
                length: normalized.len(),
                limit: MAX_PATH_LEN,
            });
        }
        Ok(StorePath(normalized))
    }

    /// The root path (empty relative path).
    pub fn root() -> StorePath {
        StorePath(String::new())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append a single validated segment.
    pub fn join(&self, segment: &str) -> Result<StorePath, PathError> {
        let child = StorePath::normalize(segment)?;
        if child.is_root() || child.0.contains(SEPARATOR) {
            return Err(PathError::DisallowedCharacter { character: SEPARATOR });
        }
        if self.is_root() {
            return Ok(child);
        }
        let joined = format!("{}{}{}", self.0, SEPARATOR, child.0);
        if joined.len() > MAX_PATH_LEN {
            return Err(PathError::TooLong {
                length: joined.len(),
                limit: MAX_PATH_LEN,
            });
        }
        Ok(StorePath(joined))
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR).filter(|s| !s.is_empty())
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StorePath {
    type Error = PathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        StorePath::normalize(&value)
    }
}

impl From<StorePath> for String {
    fn from(path: StorePath) -> String {
        path.0
    }
}

// ============================================================================
// NAMESPACE MAPPING
// ============================================================================

/// The separator-terminated key prefix owned by a tenant.
pub fn namespace_prefix(tenant: &TenantId) -> String {
    format!("{}/{}/", NAMESPACE_ROOT, tenant.as_str())
}

/// Map a relative path to its absolute backend key.
pub fn to_absolute(tenant: &TenantId, path: &StorePath) -> String {
    if path.is_root() {
        format!("{}/{}", NAMESPACE_ROOT, tenant.as_str())
    } else {
        format!("{}/{}/{}", NAMESPACE_ROOT, tenant.as_str(), path.as_str())
    }
}

/// Map a relative path to a separator-terminated absolute prefix for
/// list/watch operations. The entry at exactly `path` is not inside its
/// own prefix; prefixes denote folder contents.
pub fn to_absolute_prefix(tenant: &TenantId, path: &StorePath) -> String {
    if path.is_root() {
        namespace_prefix(tenant)
    } else {
        format!("{}/", to_absolute(tenant, path))
    }
}

/// Map an absolute backend key back to its tenant-relative form.
///
/// Inverse of [`to_absolute`] for every normalized path. Keys outside the
/// tenant namespace fail with [`PathError::OutsideNamespace`].
pub fn to_relative(tenant: &TenantId, key: &str) -> Result<StorePath, PathError> {
    let bare = format!("{}/{}", NAMESPACE_ROOT, tenant.as_str());
    if key == bare {
        return Ok(StorePath::root());
    }
    let prefix = namespace_prefix(tenant);
    match key.strip_prefix(&prefix) {
        Some(rest) => StorePath::normalize(rest),
        None => Err(PathError::OutsideNamespace {
            key: key.to_string(),
        }),
    }
}

/// Extract the owning tenant of an absolute key, if it lies inside the
/// system namespace.
pub fn tenant_of(key: &str) -> Option<&str> {
    let rest = key.strip_prefix(NAMESPACE_ROOT)?.strip_prefix(SEPARATOR)?;
    let tenant = rest.split(SEPARATOR).next()?;
    if tenant.is_empty() {
        None
    } else {
        Some(tenant)
    }
}

/// Fold sorted keys at the first `separator` after `prefix`, producing
/// directory-style grouping. Folded entries keep their trailing separator
/// and carry no value. Used by backends without server-side folding.
pub fn fold_keys<I>(prefix: &str, keys: I, separator: char) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut folded: Vec<String> = Vec::new();
    for key in keys {
        let Some(rest) = key.strip_prefix(prefix) else {
            continue;
        };
        let entry = match rest.find(separator) {
            Some(idx) => format!("{}{}", prefix, &rest[..=idx]),
            None => key,
        };
        if folded.last() != Some(&entry) {
            folded.push(entry);
        }
    }
    folded
}

// ============================================================================
// TESTS
// ============================================================================


// ============================================================================
// PROPERTY-BASED TESTS
// ============================================================================
