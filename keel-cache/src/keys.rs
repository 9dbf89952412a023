//! Deterministic cache key construction.

use sha2::{Digest, Sha256};

/// Longest raw content segment embedded in a key. Anything longer is
/// replaced by a digest so keys stay bounded no matter what callers
/// feed in.
const MAX_CONTENT_LEN: usize = 64;

/// Bytes of the SHA-256 digest kept when content is hashed.
const DIGEST_PREFIX_LEN: usize = 16;

/// Builds namespaced cache keys of the form
/// `{application}::{cache}:v{version}:{content}`.
///
/// The version segment makes key schema changes cheap: bumping a cache's
/// version orphans every existing entry without touching the tiers.
#[derive(Debug, Clone)]
pub struct KeyGenerator {
    application: String,
}

impl KeyGenerator {
    pub fn new(application: impl Into<String>) -> Self {
        KeyGenerator {
            application: application.into(),
        }
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    /// Key for `parts` joined in the order given.
    pub fn key(&self, cache: &str, version: u32, parts: &[&str]) -> String {
        let content = Self::content(parts);
        format!("{}::{}:v{}:{}", self.application, cache, version, content)
    }

    /// Key for `parts` independent of their order. Use this when the
    /// parts come from a collection with no stable iteration order.
    pub fn key_unordered(&self, cache: &str, version: u32, parts: &[&str]) -> String {
        let mut sorted = parts.to_vec();
        sorted.sort_unstable();
        self.key(cache, version, &sorted)
    }

    /// Prefix shared by every key of `cache`, version included or not.
    /// The redis tier scopes `clear` to this prefix.
    pub fn cache_prefix(&self, cache: &str) -> String {
        format!("{}::{}:", self.application, cache)
    }

    fn content(parts: &[&str]) -> String {
        let joined = parts.join(":");
        if joined.len() <= MAX_CONTENT_LEN {
            return joined;
        }
        let digest = Sha256::digest(joined.as_bytes());
        hex::encode(&digest[..DIGEST_PREFIX_LEN])
    }
}
