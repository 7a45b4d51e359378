//! # Content Hashing
//!
//! Reproducibility hashes and request fingerprints share one algorithm:
//! SHA-256 over a canonical JSON rendering (object keys sorted, no
//! whitespace), prefixed with a domain tag so a plan hash can never collide
//! with a request fingerprint.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{QueryError, QueryResult};

pub const PLAN_DOMAIN: &str = "prism.plan.v1";
pub const FINGERPRINT_DOMAIN: &str = "prism.request.v1";
pub const NODE_DOMAIN: &str = "prism.node.v1";

/// Hex SHA-256 of `domain` + canonical JSON of `content`.
pub fn canonical_digest<T: Serialize>(domain: &str, content: &T) -> QueryResult<String> {
    let unhashable = |e: serde_json::Error| {
        QueryError::InvalidRequest(format!("unhashable content: {}", e))
    };
    // Routing through `Value` sorts struct fields and map keys alike.
    let value = serde_json::to_value(content).map_err(unhashable)?;
    let canonical = serde_json::to_vec(&value).map_err(unhashable)?;

    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    hasher.update([0u8]);
    hasher.update(&canonical);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compact rendering with sorted object keys. `serde_json::Map` is a
/// `BTreeMap` unless the `preserve_order` feature is on, which this
/// workspace never enables.
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": {"d": [1, 2], "c": null}});
        assert_eq!(canonical_json(&a), r#"{"a":{"c":null,"d":[1,2]},"b":1}"#);
    }

    #[test]
    fn test_digest_ignores_key_order() {
        let a = json!({"x": 1, "y": "two"});
        let b = json!({"y": "two", "x": 1});
        assert_eq!(
            canonical_digest(PLAN_DOMAIN, &a).unwrap(),
            canonical_digest(PLAN_DOMAIN, &b).unwrap()
        );
    }

    #[test]
    fn test_domains_separate_digests() {
        let v = json!({"x": 1});
        assert_ne!(
            canonical_digest(PLAN_DOMAIN, &v).unwrap(),
            canonical_digest(FINGERPRINT_DOMAIN, &v).unwrap()
        );
    }

    #[test]
    fn test_hash_map_order_does_not_change_digest() {
        use std::collections::HashMap;
        let forward: HashMap<&str, i32> = (0..32).map(|i| (KEYS[i], i as i32)).collect();
        let backward: HashMap<&str, i32> = (0..32).rev().map(|i| (KEYS[i], i as i32)).collect();
        assert_eq!(
            canonical_digest(NODE_DOMAIN, &forward).unwrap(),
            canonical_digest(NODE_DOMAIN, &backward).unwrap()
        );
    }

    const KEYS: [&str; 32] = [
        "a0", "a1", "a2", "a3", "a4", "a5", "a6", "a7", "b0", "b1", "b2", "b3", "b4", "b5", "b6",
        "b7", "c0", "c1", "c2", "c3", "c4", "c5", "c6", "c7", "d0", "d1", "d2", "d3", "d4", "d5",
        "d6", "d7",
    ];
}
