//! Fuzz test for the tenant path normalizer
//!
//! Feeds arbitrary byte sequences through `StorePath::normalize` to find:
//! - Panics or crashes
//! - Inputs that normalize but break the path invariants
//! - Normalized paths that fail the absolute/relative round trip
//!
//! Run with: cargo +nightly fuzz run path_fuzz -- -max_total_time=60

#![no_main]

use keel_core::path::{to_absolute, to_relative, MAX_PATH_LEN, SEPARATOR};
use keel_core::{StorePath, TenantId};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Normalization only accepts UTF-8; anything else is rejected by
    // the str boundary before the normalizer runs.
    if let Ok(input) = std::str::from_utf8(data) {
        // Never panics; invalid input must come back as Err.
        let Ok(path) = StorePath::normalize(input) else {
            return;
        };

        // Invariants held by every accepted path.
        let s = path.as_str();
        assert!(s.len() <= MAX_PATH_LEN, "normalized path over length");
        assert!(!s.starts_with(SEPARATOR), "leading separator survived");
        assert!(!s.ends_with(SEPARATOR), "trailing separator survived");
        assert!(!s.contains("//"), "empty segment survived");
        for segment in path.segments() {
            assert!(segment != "." && segment != "..", "traversal segment survived");
        }

        // Normalization is idempotent.
        let again = StorePath::normalize(s).expect("normalized path must re-normalize");
        assert_eq!(again, path, "normalization not idempotent");

        // Absolute mapping round-trips for any accepted path.
        let tenant = TenantId::new("fuzz").expect("fixed tenant is valid");
        let key = to_absolute(&tenant, &path);
        let back = to_relative(&tenant, &key).expect("own key must map back");
        assert_eq!(back, path, "absolute/relative round trip broke");
    }
});
