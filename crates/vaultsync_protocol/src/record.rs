//! Change records.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};

/// A single, immutable change.
///
/// `ChangeRecord` is the unit of synchronization. It is created once by the
/// context that produced the mutation and is then only ever copied: from the
/// local store to the broadcaster, into the upload queue, into the remote
/// log and back down into the stores of other devices.
///
/// # Fields
///
/// - `id`: globally unique, client-generated identifier
/// - `data`: opaque serialized payload
///
/// Two records with the same `id` describe the same change. If their
/// payloads differ, that is a conflict (see [`ChangeRecord::conflicts_with`]);
/// field-level edits are expressed as new records with new ids, never by
/// reusing an id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeRecord {
    id: String,
    data: String,
}

impl ChangeRecord {
    /// Creates a record from an identifier and a payload.
    pub fn new(id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: data.into(),
        }
    }

    /// Creates a record with a freshly generated random id.
    pub fn generate(data: impl Into<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), data)
    }

    /// Creates a tombstone record for `target`.
    ///
    /// The tombstone has its own fresh id; the deleted record is left in
    /// place everywhere.
    pub fn tombstone(target: impl Into<String>) -> ProtocolResult<Self> {
        let data = Tombstone::new(target).encode()?;
        Ok(Self::generate(data))
    }

    /// Returns the record id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the record payload.
    pub fn data(&self) -> &str {
        &self.data
    }

    /// Consumes the record, returning `(id, data)`.
    pub fn into_parts(self) -> (String, String) {
        (self.id, self.data)
    }

    /// Returns true if `other` has the same id.
    pub fn same_change(&self, other: &ChangeRecord) -> bool {
        self.id == other.id
    }

    /// Returns true if `other` has the same id but a different payload.
    pub fn conflicts_with(&self, other: &ChangeRecord) -> bool {
        self.same_change(other) && self.data != other.data
    }

    /// Returns the id of the deleted record if this record is a tombstone.
    pub fn tombstone_target(&self) -> Option<String> {
        Tombstone::decode(&self.data).map(|t| t.target)
    }

    /// Checks the record shape.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidRecord`] if the id is empty.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.id.is_empty() {
            return Err(ProtocolError::invalid_record("empty id"));
        }
        Ok(())
    }
}

/// Payload convention marking deletion of a previous record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    /// Id of the record being deleted.
    #[serde(rename = "$tombstone")]
    pub target: String,
}

impl Tombstone {
    /// Creates a tombstone for `target`.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
        }
    }

    /// Encodes to the JSON payload form.
    pub fn encode(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Parses a payload, returning `None` if it is not a tombstone.
    pub fn decode(data: &str) -> Option<Self> {
        serde_json::from_str(data).ok()
    }
}

/// An ordered sequence of records produced by one local operation.
///
/// Order inside a batch is significant and is preserved by every component.
/// No order is implied between batches of different origins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeBatch {
    records: Vec<ChangeRecord>,
}

impl ChangeBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record to the end of the batch.
    pub fn push(&mut self, record: ChangeRecord) {
        self.records.push(record);
    }

    /// Returns the records in order.
    pub fn records(&self) -> &[ChangeRecord] {
        &self.records
    }

    /// Returns the number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the batch holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterates over the records in order.
    pub fn iter(&self) -> std::slice::Iter<'_, ChangeRecord> {
        self.records.iter()
    }

    /// Consumes the batch, returning the records.
    pub fn into_records(self) -> Vec<ChangeRecord> {
        self.records
    }
}

impl From<Vec<ChangeRecord>> for ChangeBatch {
    fn from(records: Vec<ChangeRecord>) -> Self {
        Self { records }
    }
}

impl FromIterator<ChangeRecord> for ChangeBatch {
    fn from_iter<I: IntoIterator<Item = ChangeRecord>>(iter: I) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for ChangeBatch {
    type Item = ChangeRecord;
    type IntoIter = std::vec::IntoIter<ChangeRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a ChangeBatch {
    type Item = &'a ChangeRecord;
    type IntoIter = std::slice::Iter<'a, ChangeRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn equality_is_on_id_and_data() {
        let a = ChangeRecord::new("c1", "x");
        assert_eq!(a, ChangeRecord::new("c1", "x"));
        assert_ne!(a, ChangeRecord::new("c1", "y"));
        assert_ne!(a, ChangeRecord::new("c2", "x"));
    }

    #[test]
    fn conflict_requires_same_id() {
        let a = ChangeRecord::new("c1", "x");
        assert!(a.conflicts_with(&ChangeRecord::new("c1", "y")));
        assert!(!a.conflicts_with(&ChangeRecord::new("c1", "x")));
        assert!(!a.conflicts_with(&ChangeRecord::new("c2", "y")));
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = ChangeRecord::generate("x");
        let b = ChangeRecord::generate("x");
        assert_ne!(a.id(), b.id());
        assert!(a.validate().is_ok());
    }

    #[test]
    fn empty_id_is_invalid() {
        let record = ChangeRecord::new("", "x");
        assert!(matches!(
            record.validate(),
            Err(ProtocolError::InvalidRecord(_))
        ));
    }

    #[test]
    fn tombstone_points_at_target() {
        let record = ChangeRecord::tombstone("vault-7").unwrap();
        assert_ne!(record.id(), "vault-7");
        assert_eq!(record.tombstone_target().as_deref(), Some("vault-7"));
        assert_eq!(record.data(), r#"{"$tombstone":"vault-7"}"#);

        let plain = ChangeRecord::new("c1", r#"{"name":"profile"}"#);
        assert_eq!(plain.tombstone_target(), None);
    }

    #[test]
    fn batch_preserves_order() {
        let batch: ChangeBatch = vec![
            ChangeRecord::new("a", "1"),
            ChangeRecord::new("a2", "2"),
        ]
        .into();

        let ids: Vec<_> = batch.iter().map(|r| r.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "a2"]);
    }

    #[test]
    fn batch_serializes_as_plain_array() {
        let batch: ChangeBatch = vec![ChangeRecord::new("a", "1")].into();
        let json = serde_json::to_string(&batch).unwrap();
        assert_eq!(json, r#"[{"id":"a","data":"1"}]"#);
    }

    proptest! {
        #[test]
        fn a_record_never_conflicts_with_itself(id in "[a-z0-9]{1,16}", data in ".*") {
            let record = ChangeRecord::new(id, data);
            prop_assert!(!record.conflicts_with(&record.clone()));
            prop_assert!(record.same_change(&record.clone()));
        }
    }
}
