//! DNA: the wire-independent serialized form of a remote object.
//!
//! A [`Dna`] record carries everything needed to materialize one object
//! locally: its id and version, the type to instantiate, the defining-loader
//! description, the field data, and an optional parent reference for
//! non-static inner objects. The actual byte-level encoding belongs to the
//! transport layer; this crate only ever sees the decoded form.

use serde::{Deserialize, Serialize};

use crate::cache::types::object_id::ObjectId;

/// A single field value inside a DNA record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DnaValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// Reference to another managed object, faulted in on demand.
    Reference(ObjectId),
}

/// Named field within a DNA record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnaField {
    pub name: String,
    pub value: DnaValue,
}

/// Serialized representation of one remote object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dna {
    pub object_id: ObjectId,
    pub version: i64,
    pub type_name: String,
    pub loader_desc: String,
    /// Parent object for non-static inner objects; used as a retrieval hint.
    pub parent_id: Option<ObjectId>,
    pub fields: Vec<DnaField>,
    /// Whole-object snapshot vs. delta against an existing object.
    pub is_delta: bool,
}

impl Dna {
    /// Convenience constructor for a whole-object record.
    pub fn new(object_id: ObjectId, version: i64, type_name: impl Into<String>) -> Self {
        Dna {
            object_id,
            version,
            type_name: type_name.into(),
            loader_desc: String::new(),
            parent_id: None,
            fields: Vec::new(),
            is_delta: false,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: DnaValue) -> Self {
        self.fields.push(DnaField {
            name: name.into(),
            value,
        });
        self
    }

    pub fn with_parent(mut self, parent: ObjectId) -> Self {
        self.parent_id = Some(parent);
        self
    }

    /// All object ids this record points at, children first.
    pub fn reference_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.fields.iter().filter_map(|f| match f.value {
            DnaValue::Reference(id) if !id.is_null() => Some(id),
            _ => None,
        })
    }
}

/// Value held by a server-map entry.
///
/// Values that are themselves managed objects are shared with the cluster
/// before caching, so the cached entry always carries a resolvable id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MapValue {
    Literal(DnaValue),
    Shared(ObjectId),
}

impl MapValue {
    pub fn shared_id(&self) -> Option<ObjectId> {
        match self {
            MapValue::Shared(id) => Some(*id),
            MapValue::Literal(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_ids_skips_literals_and_null() {
        let dna = Dna::new(ObjectId::new(0, 1), 1, "demo.Node")
            .with_field("name", DnaValue::Text("root".into()))
            .with_field("left", DnaValue::Reference(ObjectId::new(0, 2)))
            .with_field("right", DnaValue::Reference(ObjectId::NULL));
        let refs: Vec<_> = dna.reference_ids().collect();
        assert_eq!(refs, vec![ObjectId::new(0, 2)]);
    }
}
