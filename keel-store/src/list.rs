//! Structured list documents.
//!
//! A list lives under one base path as a manifest entry plus one entry
//! per item:
//!
//! ```text
//! <base>/manifest          JSON ListManifest
//! <base>/items/<id>        raw item bytes
//! ```
//!
//! The manifest carries the item order and an etag over its own canonical
//! form. Readers treat a manifest that fails verification, or a manifest
//! that names a missing item, as a corrupt document.

use chrono::{DateTime, Utc};
use keel_core::{StoreError, StorePath};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};

/// Marker distinguishing list manifests from ordinary values.
pub const LIST_KIND: &str = "keel.list";

/// Path segment holding the manifest entry.
pub const MANIFEST_SEGMENT: &str = "manifest";

/// Path segment under which items live.
pub const ITEMS_SEGMENT: &str = "items";

// ============================================================================
// MANIFEST
// ============================================================================

/// Ordering and versioning metadata for one list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListManifest {
    /// Always [`LIST_KIND`] for a well-formed manifest.
    pub kind: String,
    /// Item ids in list order. Every id must have an item entry.
    pub order: Vec<String>,
    /// Document revision, incremented by every successful update.
    pub version: u64,
    /// Hex sha256 over the canonical manifest form, excluding this field.
    pub etag: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl ListManifest {
    /// Assemble a manifest, stamping `updated_at` and the etag.
    pub fn build(order: Vec<String>, version: u64, metadata: BTreeMap<String, String>) -> Self {
        let mut manifest = ListManifest {
            kind: LIST_KIND.to_string(),
            order,
            version,
            etag: String::new(),
            metadata,
            updated_at: Utc::now(),
        };
        manifest.etag = manifest.compute_etag();
        manifest
    }

    /// Hex sha256 over the canonical manifest form. Fields are
    /// length-framed so no two distinct manifests share a digest input.
    pub fn compute_etag(&self) -> String {
        fn frame(hasher: &mut Sha256, bytes: &[u8]) {
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        }

        let mut hasher = Sha256::new();
        frame(&mut hasher, self.kind.as_bytes());
        frame(&mut hasher, &self.version.to_le_bytes());
        frame(&mut hasher, self.updated_at.to_rfc3339().as_bytes());
        for id in &self.order {
            frame(&mut hasher, id.as_bytes());
        }
        for (key, value) in &self.metadata {
            frame(&mut hasher, key.as_bytes());
            frame(&mut hasher, value.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Whether the manifest is well-formed: right kind, etag matches.
    pub fn verify(&self) -> bool {
        self.kind == LIST_KIND && self.etag == self.compute_etag()
    }
}

/// One list item with its storage version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListItem {
    pub id: String,
    pub value: Vec<u8>,
    pub modify_index: u64,
}

/// A fully resolved list: manifest plus items in manifest order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListDocument {
    pub manifest: ListManifest,
    pub items: Vec<ListItem>,
}

// ============================================================================
// UPDATES
// ============================================================================

/// A batch of changes applied to a list in one atomic write.
///
/// Upserted ids keep their position when already present and append
/// otherwise. Deletes remove the id from the order. Metadata, when given,
/// replaces the manifest metadata wholesale.
#[derive(Debug, Clone, Default)]
pub struct ListUpdate {
    pub upserts: Vec<(String, Vec<u8>)>,
    pub deletes: Vec<String>,
    pub metadata: Option<BTreeMap<String, String>>,
}

impl ListUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(mut self, id: impl Into<String>, value: Vec<u8>) -> Self {
        self.upserts.push((id.into(), value));
        self
    }

    pub fn delete(mut self, id: impl Into<String>) -> Self {
        self.deletes.push(id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Fail fast on updates no backend should see.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.upserts.is_empty() && self.deletes.is_empty() && self.metadata.is_none() {
            return Err(StoreError::invalid_argument(
                "list update must change items or metadata",
            ));
        }

        let mut seen = HashSet::new();
        for (id, _) in &self.upserts {
            validate_item_id(id)?;
            if !seen.insert(id.as_str()) {
                return Err(StoreError::invalid_argument(format!(
                    "duplicate upsert for item id {id}"
                )));
            }
        }
        for id in &self.deletes {
            validate_item_id(id)?;
            if seen.contains(id.as_str()) {
                return Err(StoreError::invalid_argument(format!(
                    "item id {id} appears in both upserts and deletes"
                )));
            }
        }
        Ok(())
    }
}

fn validate_item_id(id: &str) -> Result<(), StoreError> {
    let parsed = StorePath::normalize(id)
        .map_err(|err| StoreError::invalid_argument(format!("invalid item id {id}: {err}")))?;
    if parsed.is_root() || parsed.as_str().contains(keel_core::SEPARATOR) || parsed.as_str() != id
    {
        return Err(StoreError::invalid_argument(format!(
            "item id {id} is not a single path segment"
        )));
    }
    // The reserved segment would collide with the manifest entry.
    if id == MANIFEST_SEGMENT {
        return Err(StoreError::invalid_argument(
            "item id `manifest` is reserved",
        ));
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
