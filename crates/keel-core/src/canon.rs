// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Canonical JSON byte emission and digests.
//!
//! One serializer per schema; each is a pure, total function from a typed
//! input to byte-exact output. The conventions, applied everywhere:
//! - UTF-8, no whitespace, compact `,` / `:` separators;
//! - object keys sorted ascending by code point;
//! - integer literals base-10, no `+`, no leading zeros;
//! - scalars are tagged-atom *strings* (floats never appear);
//! - mappings ordered by a non-string key are arrays of pairs.
//!
//! `serde_json`'s object map is an ordered map keyed by string, so building a
//! tree out of [`serde_json::Value`] and serializing compactly yields exactly
//! these bytes. Schemas with a mandated non-alphabetical field order (the
//! curvature matrix) hand-roll their writer instead; see
//! [`crate::curvature`].

use serde_json::Value as Json;

use crate::ident::{sha3_256, Hash};

/// Canonicalization id stamped into state documents.
pub const CANON_ID_SORTED_JSON_V1: &str = "sorted_json_bytes.v1";

/// Float policy id for the authoritative path: floats are forbidden.
pub const FLOAT_POLICY_FORBID: &str = "float.forbid.v1";

/// Serializes a JSON tree to canonical bytes.
///
/// The tree must contain only objects, arrays, strings, booleans, and
/// canonical unsigned integers (used for counts and indices); callers encode
/// every scalar as a tagged atom before reaching this point.
pub fn to_canonical_bytes(doc: &Json) -> Vec<u8> {
    // serde_json emits compact separators and sorted keys (BTreeMap-backed
    // objects); serialization of a tree without non-finite numbers cannot
    // fail, so the fallback is unreachable.
    serde_json::to_vec(doc).unwrap_or_default()
}

/// SHA3-256 digest of the canonical bytes of a JSON tree.
pub fn digest(doc: &Json) -> Hash {
    sha3_256(&to_canonical_bytes(doc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_and_output_is_compact() {
        let doc = json!({"b": "s:x", "a": ["i:1", "i:2"], "c": {"z": "i:0", "y": "i:1"}});
        let bytes = to_canonical_bytes(&doc);
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"a":["i:1","i:2"],"b":"s:x","c":{"y":"i:1","z":"i:0"}}"#
        );
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let doc = json!({"k": "s:v", "n": ["i:1"]});
        let once = to_canonical_bytes(&doc);
        let reparsed: Json = serde_json::from_slice(&once).unwrap();
        assert_eq!(to_canonical_bytes(&reparsed), once);
    }

    #[test]
    fn distinct_tags_digest_differently() {
        let hashes: Vec<Hash> = ["i:1", "q:0:1", "s:1", "b64:AQ"]
            .iter()
            .map(|atom| digest(&json!({ "v": atom })))
            .collect();
        for i in 0..hashes.len() {
            for j in 0..hashes.len() {
                if i != j {
                    assert_ne!(hashes[i], hashes[j]);
                }
            }
        }
    }
}
