//! Fuzz test for the cache key generator
//!
//! Builds keys from arbitrary applications, cache names, and content
//! parts to find:
//! - Panics or crashes
//! - Keys escaping their cache prefix
//! - Keys exceeding the bounded length
//! - Order sensitivity in `key_unordered`
//!
//! Run with: cargo +nightly fuzz run key_fuzz -- -max_total_time=60

#![no_main]

use keel_cache::KeyGenerator;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // First line names the cache, the rest become content parts.
        let mut lines = input.lines();
        let cache = lines.next().unwrap_or("");
        let parts: Vec<&str> = lines.collect();
        let version = data.len() as u32;

        let generator = KeyGenerator::new("fuzz-app");
        let key = generator.key(cache, version, &parts);

        // Every key lives under its cache's prefix.
        let prefix = generator.cache_prefix(cache);
        assert!(key.starts_with(&prefix), "key escaped its cache prefix");

        // Content is either raw (at most 64 bytes) or a 32-char digest,
        // so the whole key is bounded.
        let bound = prefix.len() + "v4294967295:".len() + 64;
        assert!(key.len() <= bound, "key over the bounded length");

        // Deterministic for identical input.
        assert_eq!(key, generator.key(cache, version, &parts), "key not deterministic");

        // Unordered keys collapse permutations.
        let forward = generator.key_unordered(cache, version, &parts);
        let mut reversed = parts.clone();
        reversed.reverse();
        let backward = generator.key_unordered(cache, version, &reversed);
        assert_eq!(forward, backward, "key_unordered is order sensitive");
    }
});
