//! Messages carried on the local broadcast channel.

use crate::error::{ProtocolError, ProtocolResult};
use crate::record::ChangeRecord;
use serde::{Deserialize, Serialize};

/// A message published to sibling contexts on the same device.
///
/// Serialized as `{"type":"changes","changes":[...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BroadcastMessage {
    /// Records newly stored by the publishing context, in batch order.
    Changes {
        /// The records.
        changes: Vec<ChangeRecord>,
    },
}

impl BroadcastMessage {
    /// Creates a changes message.
    pub fn changes(changes: Vec<ChangeRecord>) -> Self {
        Self::Changes { changes }
    }

    /// Returns the carried records.
    pub fn records(&self) -> &[ChangeRecord] {
        match self {
            Self::Changes { changes } => changes,
        }
    }

    /// Encodes to JSON.
    pub fn to_json(&self) -> ProtocolResult<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Decodes from JSON.
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        serde_json::from_str(json).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape() {
        let msg = BroadcastMessage::changes(vec![ChangeRecord::new("c1", "x")]);
        assert_eq!(
            msg.to_json().unwrap(),
            r#"{"type":"changes","changes":[{"id":"c1","data":"x"}]}"#
        );
    }

    #[test]
    fn unknown_type_is_rejected() {
        let result = BroadcastMessage::from_json(r#"{"type":"presence","changes":[]}"#);
        assert!(result.is_err());
    }

    #[test]
    fn decodes_sibling_message() {
        let msg =
            BroadcastMessage::from_json(r#"{"type":"changes","changes":[{"id":"a","data":"1"}]}"#)
                .unwrap();
        assert_eq!(msg.records(), &[ChangeRecord::new("a", "1")]);
    }
}
