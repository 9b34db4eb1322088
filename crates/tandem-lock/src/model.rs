//! Lock data model

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Kind of a lockable resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Node,
    Relationship,
    /// Graph-wide properties (a single resource)
    GraphProperties,
    /// The schema (a single resource)
    Schema,
    Index,
    /// One entry of an index; the id is the replica-computed entry hash
    IndexEntry,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Node => "node",
            ResourceKind::Relationship => "relationship",
            ResourceKind::GraphProperties => "graph_properties",
            ResourceKind::Schema => "schema",
            ResourceKind::Index => "index",
            ResourceKind::IndexEntry => "index_entry",
        }
    }

    /// Kinds that name exactly one resource, always with id 0
    pub fn is_singleton(&self) -> bool {
        matches!(self, ResourceKind::GraphProperties | ResourceKind::Schema)
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "node" => Ok(ResourceKind::Node),
            "relationship" => Ok(ResourceKind::Relationship),
            "graph_properties" => Ok(ResourceKind::GraphProperties),
            "schema" => Ok(ResourceKind::Schema),
            "index" => Ok(ResourceKind::Index),
            "index_entry" => Ok(ResourceKind::IndexEntry),
            _ => Err(format!("Invalid resource kind: {}", s)),
        }
    }
}

/// Something a replica can lock on the master
///
/// Deliberately not a domain entity: the lock manager only needs a kind and
/// an id to tell resources apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockableResource {
    pub kind: ResourceKind,
    pub id: i64,
}

impl LockableResource {
    pub fn new(kind: ResourceKind, id: i64) -> Self {
        Self { kind, id }
    }

    pub fn node(id: i64) -> Self {
        Self::new(ResourceKind::Node, id)
    }

    pub fn relationship(id: i64) -> Self {
        Self::new(ResourceKind::Relationship, id)
    }

    pub fn graph_properties() -> Self {
        Self::new(ResourceKind::GraphProperties, 0)
    }

    pub fn schema() -> Self {
        Self::new(ResourceKind::Schema, 0)
    }

    pub fn index(id: i64) -> Self {
        Self::new(ResourceKind::Index, id)
    }

    pub fn index_entry(hash: i64) -> Self {
        Self::new(ResourceKind::IndexEntry, hash)
    }

    /// Build the resources named by one lock call on the wire
    pub fn batch(kind: ResourceKind, ids: &[i64]) -> Vec<Self> {
        ids.iter().map(|id| Self::new(kind, *id)).collect()
    }

    /// Check the id is meaningful for the kind
    pub fn is_valid(&self) -> bool {
        match self.kind {
            ResourceKind::GraphProperties | ResourceKind::Schema => self.id == 0,
            ResourceKind::Node | ResourceKind::Relationship | ResourceKind::Index => self.id >= 0,
            ResourceKind::IndexEntry => true,
        }
    }
}

impl Display for LockableResource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.kind.is_singleton() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}({})", self.kind, self.id)
        }
    }
}

/// Lock mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl Display for LockMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LockMode::Shared => write!(f, "shared"),
            LockMode::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// Outcome of a lock call as seen by the replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LockStatus {
    OkLocked,
    NotLocked,
    DeadLocked,
}

/// Lock call result
///
/// Contention is reported here rather than as an error so the replica can
/// decide to retry or abort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockResult {
    pub status: LockStatus,
    #[serde(default)]
    pub message: Option<String>,
}

impl LockResult {
    pub fn locked() -> Self {
        Self {
            status: LockStatus::OkLocked,
            message: None,
        }
    }

    pub fn not_locked(message: impl Into<String>) -> Self {
        Self {
            status: LockStatus::NotLocked,
            message: Some(message.into()),
        }
    }

    pub fn dead_locked(message: impl Into<String>) -> Self {
        Self {
            status: LockStatus::DeadLocked,
            message: Some(message.into()),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.status == LockStatus::OkLocked
    }
}

/// Lock statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStats {
    /// Clients handed out
    pub total_clients: u64,
    /// Granted acquisitions (re-entrant grants included)
    pub total_acquisitions: u64,
    /// Acquisitions that had to wait at least once
    pub contended_acquisitions: u64,
    /// Acquisitions refused because of a deadlock
    pub deadlocks: u64,
    /// Waits aborted by `stop`
    pub stopped_waits: u64,
    /// Clients closed
    pub closed_clients: u64,
}
