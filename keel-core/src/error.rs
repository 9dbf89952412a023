//! Error taxonomy for the keel control plane.
//!
//! Four domain enums roll up into the master [`KeelError`]. Two failure
//! classes deliberately do NOT appear here: a missing key is `Ok(None)` /
//! an empty list, and a lost CAS race is a `success = false` result value.
//! Both are normal outcomes callers handle inline, not errors.

use thiserror::Error;

// ============================================================================
// PATH ERRORS
// ============================================================================

/// Path policy violations. Raised before any backend call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path contains traversal segment {segment:?}")]
    Traversal { segment: String },

    #[error("path contains disallowed character {character:?}")]
    DisallowedCharacter { character: char },

    #[error("path length {length} exceeds limit {limit}")]
    TooLong { length: usize, limit: usize },

    #[error("invalid tenant id {value:?}: {reason}")]
    InvalidTenant { value: String, reason: String },

    #[error("key {key:?} is outside the tenant namespace")]
    OutsideNamespace { key: String },
}

// ============================================================================
// STORE ERRORS
// ============================================================================

/// Authoritative-store failures.
///
/// `Unavailable` always surfaces to the caller; there is no silent
/// fallback for authoritative storage.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("transaction spans tenant namespaces {first:?} and {second:?}")]
    CrossTenantTransaction { first: String, second: String },

    #[error("operation not supported by the {backend} backend: {operation}")]
    Unsupported { backend: String, operation: String },

    #[error("backend unavailable: {message}")]
    Unavailable { message: String },

    #[error("backend protocol error: {message}")]
    Protocol { message: String },

    #[error("watch subscription closed")]
    WatchClosed,
}

impl StoreError {
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        StoreError::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        StoreError::Unavailable {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        StoreError::Protocol {
            message: message.into(),
        }
    }
}

// ============================================================================
// CACHE ERRORS
// ============================================================================

/// Cache tier failures.
///
/// `Deserialization` is recovered inside the resilient wrapper (warn,
/// evict, report a miss) and never reaches callers of the cache API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache tier unavailable: {message}")]
    Unavailable { message: String },

    #[error("circuit breaker open for cache {cache}")]
    CircuitOpen { cache: String },

    #[error("cache payload could not be encoded: {reason}")]
    Serialization { reason: String },

    #[error("cache payload could not be decoded: {reason}")]
    Deserialization { reason: String },
}

impl CacheError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        CacheError::Unavailable {
            message: message.into(),
        }
    }
}

// ============================================================================
// CONFIG ERRORS
// ============================================================================

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },

    #[error("Provider not supported: {provider}")]
    ProviderNotSupported { provider: String },
}

// ============================================================================
// MASTER ERROR
// ============================================================================

/// Master error type for all keel operations.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeelError {
    #[error("Path error: {0}")]
    Path(#[from] PathError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl KeelError {
    /// True for the fail-fast argument class: malformed paths, cross-tenant
    /// transactions, and per-backend unsupported operations. These are
    /// raised before any backend call and retrying unchanged cannot help.
    pub fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            KeelError::Path(_)
                | KeelError::Store(StoreError::InvalidArgument { .. })
                | KeelError::Store(StoreError::CrossTenantTransaction { .. })
                | KeelError::Store(StoreError::Unsupported { .. })
        )
    }
}

/// Result type alias for keel operations.
pub type KeelResult<T> = Result<T, KeelError>;

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_error_display() {
        let err = PathError::Traversal {
            segment: "..".to_string(),
        };
        assert_eq!(err.to_string(), "path contains traversal segment \"..\"");

        let err = PathError::TooLong {
            length: 600,
            limit: 512,
        };
        assert_eq!(err.to_string(), "path length 600 exceeds limit 512");
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::CrossTenantTransaction {
            first: "acme".to_string(),
            second: "globex".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "transaction spans tenant namespaces \"acme\" and \"globex\""
        );
    }

    #[test]
    fn test_master_error_wraps_domains() {
        let err: KeelError = StoreError::unavailable("connection refused").into();
        assert_eq!(
            err.to_string(),
            "Store error: backend unavailable: connection refused"
        );

        let err: KeelError = CacheError::CircuitOpen {
            cache: "store-entries".to_string(),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Cache error: circuit breaker open for cache store-entries"
        );
    }

    #[test]
    fn test_invalid_argument_classification() {
        let invalid: KeelError = StoreError::invalid_argument("bad prefix").into();
        assert!(invalid.is_invalid_argument());

        let path: KeelError = PathError::Traversal {
            segment: "..".to_string(),
        }
        .into();
        assert!(path.is_invalid_argument());

        let unavailable: KeelError = StoreError::unavailable("down").into();
        assert!(!unavailable.is_invalid_argument());
    }
}
