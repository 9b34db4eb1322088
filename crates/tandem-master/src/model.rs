//! Payloads exchanged between replicas and the master
//!
//! These are the logical wire shapes; framing is left to the transport.

use std::fmt;

use serde::{Deserialize, Serialize};
use tandem_common::StoreId;

/// Envelope of every master response
///
/// Carries the master's store identity and log position so a replica can
/// tell when it has fallen behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response<T> {
    pub value: T,
    pub store_id: StoreId,
    pub last_committed_tx_id: i64,
}

impl<T> Response<T> {
    pub fn new(value: T, store_id: StoreId, last_committed_tx_id: i64) -> Self {
        Self {
            value,
            store_id,
            last_committed_tx_id,
        }
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Response<U> {
        Response {
            value: f(self.value),
            store_id: self.store_id,
            last_committed_tx_id: self.last_committed_tx_id,
        }
    }
}

/// Handshake answer; `epoch` must be echoed on every later call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResult {
    pub master_id: i32,
    pub checksum: i64,
    pub epoch: i64,
}

/// Kinds of ids handed out in batches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdType {
    Node,
    Relationship,
    Property,
    StringBlock,
    ArrayBlock,
    PropertyKeyToken,
    RelationshipTypeToken,
    LabelToken,
}

impl IdType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdType::Node => "node",
            IdType::Relationship => "relationship",
            IdType::Property => "property",
            IdType::StringBlock => "string_block",
            IdType::ArrayBlock => "array_block",
            IdType::PropertyKeyToken => "property_key_token",
            IdType::RelationshipTypeToken => "relationship_type_token",
            IdType::LabelToken => "label_token",
        }
    }
}

impl fmt::Display for IdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contiguous batch of ids `[start, start + size)` reserved for one replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdAllocation {
    pub id_type: IdType,
    pub start: i64,
    pub size: i64,
    /// Highest id in use on the master after this allocation
    pub high_id: i64,
}

impl IdAllocation {
    pub fn contains(&self, id: i64) -> bool {
        id >= self.start && id < self.start + self.size
    }
}

/// Named tokens created on the master on behalf of replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    RelationshipType,
    PropertyKey,
    Label,
}

/// A transaction fully prepared on a replica, applied as-is by the master
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedTransaction {
    /// Opaque command stream produced by the replica
    pub commands: Vec<u8>,
}

impl PreparedTransaction {
    pub fn new(commands: impl Into<Vec<u8>>) -> Self {
        Self {
            commands: commands.into(),
        }
    }
}

/// A transaction in the master's committed log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommittedTransaction {
    pub tx_id: i64,
    pub checksum: i64,
    pub master_id: i32,
    pub commands: Vec<u8>,
}

/// Descriptor of a store snapshot handed to a new replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreCopy {
    pub store_id: StoreId,
    pub last_committed_tx_id: i64,
    pub checksum: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_wire_shape() {
        let response = Response::new(7i64, StoreId::new(1, 2, 3), 42);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["value"], 7);
        assert_eq!(json["lastCommittedTxId"], 42);
        assert!(json.get("storeId").is_some());
    }

    #[test]
    fn test_response_map() {
        let response = Response::new(2i32, StoreId::new(1, 2, 3), 5).map(|v| v * 10);
        assert_eq!(response.value, 20);
        assert_eq!(response.last_committed_tx_id, 5);
    }

    #[test]
    fn test_id_allocation_contains() {
        let allocation = IdAllocation {
            id_type: IdType::Node,
            start: 100,
            size: 10,
            high_id: 110,
        };
        assert!(allocation.contains(100));
        assert!(allocation.contains(109));
        assert!(!allocation.contains(110));
        assert_eq!(allocation.id_type.to_string(), "node");
    }
}
