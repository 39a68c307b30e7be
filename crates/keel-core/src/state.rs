// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Immutable state snapshots.
//!
//! A state is an unordered mapping from [`FieldId`] to a tagged atom. The
//! in-memory store is a `BTreeMap` keyed by decoded field-id bytes, which is
//! exactly the canonical field order, so encoding never re-sorts.
//!
//! Determinism contract
//! - Canonical bytes are the JSON document
//!   `{"canon_id":…,"fields":[[id,atom],…],"float_policy":…,"schema_id":…}`
//!   with fields ascending by raw id bytes.
//! - A snapshot is immutable; applying writes produces a new snapshot.
//! - The optional `meta` attachment never enters the canonical bytes.

use std::collections::BTreeMap;

use serde_json::{json, Value as Json};

use crate::canon::{self, CANON_ID_SORTED_JSON_V1, FLOAT_POLICY_FORBID};
use crate::footprint::FieldSet;
use crate::ident::{FieldId, Hash};
use crate::value::Value;

/// An immutable snapshot of field values.
///
/// `Eq` is withheld deliberately: the unhashed `meta` attachment is a free
/// JSON value, and only `PartialEq` is defined for those.
#[derive(Clone, PartialEq, Debug)]
pub struct State {
    schema_id: String,
    fields: BTreeMap<FieldId, Value>,
    /// Free-form attachment; never hashed.
    meta: Option<Json>,
}

impl State {
    /// Creates an empty snapshot under the given schema id.
    pub fn new(schema_id: impl Into<String>) -> Self {
        Self {
            schema_id: schema_id.into(),
            fields: BTreeMap::new(),
            meta: None,
        }
    }

    /// Creates a snapshot from a prepared field map.
    pub fn with_fields(schema_id: impl Into<String>, fields: BTreeMap<FieldId, Value>) -> Self {
        Self {
            schema_id: schema_id.into(),
            fields,
            meta: None,
        }
    }

    /// Schema id stamped into the canonical bytes.
    #[must_use]
    pub fn schema_id(&self) -> &str {
        &self.schema_id
    }

    /// Looks up a field value.
    #[must_use]
    pub fn get(&self, id: &FieldId) -> Option<&Value> {
        self.fields.get(id)
    }

    /// Iterates fields in canonical (raw id byte) order.
    pub fn iter(&self) -> impl Iterator<Item = (&FieldId, &Value)> {
        self.fields.iter()
    }

    /// Number of fields present.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when no fields are present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Attaches unhashed metadata to this snapshot.
    pub fn set_meta(&mut self, meta: Json) {
        self.meta = Some(meta);
    }

    /// The unhashed metadata attachment, if any.
    #[must_use]
    pub fn meta(&self) -> Option<&Json> {
        self.meta.as_ref()
    }

    /// Produces a new snapshot with `writes` applied over this one.
    ///
    /// The metadata attachment does not carry over; it belongs to the
    /// snapshot it was attached to.
    #[must_use]
    pub fn patched(&self, writes: &BTreeMap<FieldId, Value>) -> Self {
        let mut fields = self.fields.clone();
        for (id, value) in writes {
            fields.insert(*id, value.clone());
        }
        Self {
            schema_id: self.schema_id.clone(),
            fields,
            meta: None,
        }
    }

    /// Produces a view containing only the fields named in `keep`.
    ///
    /// Kernels receive such a view restricted to their declared reads; a
    /// kernel can therefore never observe state outside its footprint.
    #[must_use]
    pub fn restricted(&self, keep: &FieldSet) -> Self {
        let fields = self
            .fields
            .iter()
            .filter(|(id, _)| keep.contains(id))
            .map(|(id, v)| (*id, v.clone()))
            .collect();
        Self {
            schema_id: self.schema_id.clone(),
            fields,
            meta: None,
        }
    }

    /// Canonical JSON document for this snapshot (meta excluded).
    #[must_use]
    pub fn canonical_doc(&self) -> Json {
        let fields: Vec<Json> = self
            .fields
            .iter()
            .map(|(id, v)| json!([id.to_hex(), v.to_wire()]))
            .collect();
        json!({
            "canon_id": CANON_ID_SORTED_JSON_V1,
            "fields": fields,
            "float_policy": FLOAT_POLICY_FORBID,
            "schema_id": self.schema_id,
        })
    }

    /// Canonical bytes for this snapshot.
    #[must_use]
    pub fn canonical_bytes(&self) -> Vec<u8> {
        canon::to_canonical_bytes(&self.canonical_doc())
    }

    /// SHA3-256 hash of the canonical bytes.
    #[must_use]
    pub fn hash(&self) -> Hash {
        canon::digest(&self.canonical_doc())
    }
}
