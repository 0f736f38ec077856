//! Source records and golden-record identity.
//!
//! A [`SourceRecord`] is the immutable unit of ingestion: one system's view
//! of one real-world entity at a point in time. Records are owned by the
//! pipeline run that ingested them and are never mutated afterwards.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::AttributeValue;

/// Namespace for deterministic golden-record ids.
///
/// Fixed for the lifetime of the crate so that the same cluster of source
/// records always produces the same [`GoldenId`], across processes and runs.
const GOLDEN_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6a, 0x75, 0x72, 0x75, 0x6d, 0x00, 0x67, 0x6f, 0x6c, 0x64, 0x65, 0x6e, 0x00, 0x69, 0x64,
    0x73,
]);

/// Identifier of a golden record.
///
/// Derived deterministically from the sorted member record ids, so merging
/// the same cluster twice yields the same id. A later merge event that
/// absorbs additional records produces a *different* id; golden records are
/// immutable, never updated in place.
///
/// # Examples
///
/// ```
/// use aurum::GoldenId;
///
/// let a = GoldenId::from_members(["crm_1".to_string(), "web_1".to_string()].iter());
/// let b = GoldenId::from_members(["web_1".to_string(), "crm_1".to_string()].iter());
/// assert_eq!(a, b);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GoldenId(Uuid);

impl GoldenId {
    /// Derives the id for a cluster from its member record ids.
    ///
    /// Member order does not matter; ids are sorted before hashing.
    #[must_use]
    pub fn from_members<'a>(members: impl Iterator<Item = &'a String>) -> Self {
        let mut ids: Vec<&str> = members.map(String::as_str).collect();
        ids.sort_unstable();
        let joined = ids.join("\u{1f}");
        Self(Uuid::new_v5(&GOLDEN_ID_NAMESPACE, joined.as_bytes()))
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for GoldenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single record about one real-world entity, as delivered by one source
/// system.
///
/// Attributes are an ordered mapping from attribute name to an untyped
/// scalar. `record_id` is unique within `source_system`; the pair identifies
/// the record globally.
///
/// # Examples
///
/// ```
/// use aurum::SourceRecord;
/// use chrono::Utc;
///
/// let record = SourceRecord::new("cust_42", "crm", "customer", Utc::now())
///     .with_attr("name", "John Doe")
///     .with_attr("email", "john@example.com");
/// assert_eq!(record.attributes.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Identifier unique within the source system.
    pub record_id: String,

    /// Name of the system that produced this record.
    pub source_system: String,

    /// Kind of real-world entity this record describes (e.g. "customer").
    pub entity_type: String,

    /// Ordered attribute name to value mapping.
    #[serde(default)]
    pub attributes: BTreeMap<String, AttributeValue>,

    /// When the record was captured or last updated at the source.
    pub timestamp: DateTime<Utc>,
}

impl SourceRecord {
    /// Creates a record with no attributes.
    #[must_use]
    pub fn new(
        record_id: impl Into<String>,
        source_system: impl Into<String>,
        entity_type: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            record_id: record_id.into(),
            source_system: source_system.into(),
            entity_type: entity_type.into(),
            attributes: BTreeMap::new(),
            timestamp,
        }
    }

    /// Adds an attribute, consuming and returning the record.
    #[must_use]
    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Returns the attribute value only when present and non-null.
    ///
    /// This is the survivorship notion of "defines": a `Null` value is a
    /// gap, not a definition.
    #[must_use]
    pub fn non_null_attr(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes.get(name).filter(|v| !v.is_null())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_golden_id_order_independent() {
        let members = vec!["b".to_string(), "a".to_string(), "c".to_string()];
        let reversed = vec!["c".to_string(), "b".to_string(), "a".to_string()];
        assert_eq!(
            GoldenId::from_members(members.iter()),
            GoldenId::from_members(reversed.iter())
        );
    }

    #[test]
    fn test_golden_id_differs_per_member_set() {
        let two = vec!["a".to_string(), "b".to_string()];
        let three = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        assert_ne!(
            GoldenId::from_members(two.iter()),
            GoldenId::from_members(three.iter())
        );
    }

    #[test]
    fn test_golden_id_separator_is_unambiguous() {
        // "ab" + "c" must not collide with "a" + "bc".
        let left = vec!["ab".to_string(), "c".to_string()];
        let right = vec!["a".to_string(), "bc".to_string()];
        assert_ne!(
            GoldenId::from_members(left.iter()),
            GoldenId::from_members(right.iter())
        );
    }

    #[test]
    fn test_record_builder() {
        let record = SourceRecord::new("r1", "crm", "customer", Utc::now())
            .with_attr("name", "Ada")
            .with_attr("age", 36i64);
        assert_eq!(record.record_id, "r1");
        assert_eq!(
            record.attributes.get("name"),
            Some(&AttributeValue::String("Ada".to_string()))
        );
    }

    #[test]
    fn test_non_null_attr_skips_null() {
        let record = SourceRecord::new("r1", "crm", "customer", Utc::now())
            .with_attr("name", "Ada")
            .with_attr("email", AttributeValue::Null);
        assert!(record.non_null_attr("name").is_some());
        assert!(record.non_null_attr("email").is_none());
        assert!(record.non_null_attr("missing").is_none());
    }

    #[test]
    fn test_record_serialization_round_trip() {
        let record = SourceRecord::new("r1", "crm", "customer", Utc::now())
            .with_attr("name", "Ada")
            .with_attr("score", 0.9f64);
        let json = serde_json::to_string(&record).unwrap();
        let back: SourceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }
}
