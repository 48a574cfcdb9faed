//! KS-011: BLAKE3 content fingerprints for recipe cache keys.

use std::path::Path;

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Cache key for a recipe file: its path plus a fingerprint of its source,
/// so an edited file never maps to a stale parse.
pub fn recipe_key(path: &Path, source: &str) -> String {
    format!("{}@{}", path.display(), hash_string(source))
}
