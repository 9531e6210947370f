//! Global object identity
//!
//! Every shared object in the cluster is named by an [`ObjectId`]: a 64-bit
//! value whose upper byte carries the group (partition) the object belongs to
//! and whose lower 56 bits carry the per-group sequence number. The
//! distinguished [`ObjectId::NULL`] value means "no object" and is used for
//! unresolved root bindings and cleared references.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of bits reserved for the group component.
const GROUP_BITS: u32 = 8;
/// Number of bits available for the per-group sequence.
const SEQUENCE_BITS: u32 = 64 - GROUP_BITS;
const SEQUENCE_MASK: i64 = (1i64 << SEQUENCE_BITS) - 1;

/// Globally unique, totally ordered object identifier.
///
/// Immutable and value-typed; the ordering is the raw 64-bit ordering, which
/// groups ids of the same partition together.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ObjectId(i64);

impl ObjectId {
    /// The distinguished "no object" value.
    pub const NULL: ObjectId = ObjectId(-1);

    /// Build an id from a group and a per-group sequence number.
    ///
    /// Panics if the sequence does not fit in the lower 56 bits; running out
    /// of the sequence space is unrecoverable, not a transient condition.
    pub fn new(group: u8, sequence: i64) -> Self {
        assert!(
            sequence >= 0 && sequence <= SEQUENCE_MASK,
            "object sequence {} out of range for group {}",
            sequence,
            group
        );
        ObjectId(((group as i64) << SEQUENCE_BITS) | sequence)
    }

    /// Reconstruct an id from its raw wire representation.
    pub fn from_raw(raw: i64) -> Self {
        ObjectId(raw)
    }

    /// Raw 64-bit representation, as carried on the wire.
    pub fn to_raw(self) -> i64 {
        self.0
    }

    /// The group/partition component of this id.
    pub fn group(self) -> u8 {
        ((self.0 >> SEQUENCE_BITS) & 0xff) as u8
    }

    /// The per-group sequence component of this id.
    pub fn sequence(self) -> i64 {
        self.0 & SEQUENCE_MASK
    }

    pub fn is_null(self) -> bool {
        self.0 == -1
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "ObjectId(NULL)")
        } else {
            write!(f, "ObjectId({}:{})", self.group(), self.sequence())
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_and_sequence_round_trip() {
        let id = ObjectId::new(3, 42);
        assert_eq!(id.group(), 3);
        assert_eq!(id.sequence(), 42);
        assert!(!id.is_null());
        assert_eq!(ObjectId::from_raw(id.to_raw()), id);
    }

    #[test]
    fn null_is_distinguished() {
        assert!(ObjectId::NULL.is_null());
        assert!(!ObjectId::new(0, 0).is_null());
    }

    #[test]
    fn ordering_is_total_and_group_major() {
        let a = ObjectId::new(1, 999);
        let b = ObjectId::new(2, 0);
        assert!(a < b);
        assert!(ObjectId::new(2, 0) < ObjectId::new(2, 1));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn oversized_sequence_panics() {
        ObjectId::new(0, i64::MAX);
    }
}
