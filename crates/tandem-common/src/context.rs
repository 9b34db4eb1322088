//! Replica request identity
//!
//! Every call a replica makes carries a `RequestContext`. The master uses it
//! to correlate calls belonging to one logical conversation and to fence calls
//! that were addressed to an older master incarnation.

use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

const TIMESTAMP_BITS: u32 = 48;
const TIMESTAMP_MASK: u64 = (1 << TIMESTAMP_BITS) - 1;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EpochError {
    #[error("server id {0} does not fit in the 16 high bits of an epoch")]
    ServerIdOutOfRange(i32),
}

/// Identifier of one master incarnation
///
/// The server id occupies the high 16 bits and the start timestamp (millis)
/// the low 48 bits, which keeps the value compatible with replicas that
/// decode either half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Epoch(i64);

impl Epoch {
    pub fn new(server_id: u16, start_millis: u64) -> Self {
        let raw = ((server_id as u64) << TIMESTAMP_BITS) | (start_millis & TIMESTAMP_MASK);
        Self(raw as i64)
    }

    /// Build an epoch from a configured (signed) server id
    pub fn for_server(server_id: i32, start_millis: u64) -> Result<Self, EpochError> {
        let id = u16::try_from(server_id).map_err(|_| EpochError::ServerIdOutOfRange(server_id))?;
        Ok(Self::new(id, start_millis))
    }

    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn as_i64(self) -> i64 {
        self.0
    }

    pub fn server_id(self) -> u16 {
        ((self.0 as u64) >> TIMESTAMP_BITS) as u16
    }

    pub fn start_millis(self) -> u64 {
        (self.0 as u64) & TIMESTAMP_MASK
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Last transaction a replica has applied, with its checksum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxMarker {
    pub tx_id: i64,
    pub checksum: i64,
}

impl TxMarker {
    pub fn new(tx_id: i64, checksum: i64) -> Self {
        Self { tx_id, checksum }
    }
}

/// Identity of one replica-originated conversation
///
/// Equality and hashing only consider `(machine_id, event_identifier)`: the
/// epoch and the last-applied marker travel with the call but do not change
/// which conversation it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub epoch: i64,
    pub machine_id: i32,
    pub event_identifier: i32,
    #[serde(default)]
    pub last_applied: Option<TxMarker>,
}

impl RequestContext {
    pub fn new(epoch: Epoch, machine_id: i32, event_identifier: i32) -> Self {
        Self {
            epoch: epoch.as_i64(),
            machine_id,
            event_identifier,
            last_applied: None,
        }
    }

    pub fn with_last_applied(mut self, marker: TxMarker) -> Self {
        self.last_applied = Some(marker);
        self
    }

    pub fn epoch(&self) -> Epoch {
        Epoch::from_raw(self.epoch)
    }

    /// Id of the last transaction the replica reported, if any
    pub fn last_applied_tx_id(&self) -> Option<i64> {
        self.last_applied.map(|m| m.tx_id)
    }
}

impl PartialEq for RequestContext {
    fn eq(&self, other: &Self) -> bool {
        self.machine_id == other.machine_id && self.event_identifier == other.event_identifier
    }
}

impl Eq for RequestContext {}

impl Hash for RequestContext {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.machine_id.hash(state);
        self.event_identifier.hash(state);
    }
}

impl Display for RequestContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RequestContext[machine={}, event={}, epoch={}]",
            self.machine_id, self.event_identifier, self.epoch
        )
    }
}

/// Identity of a store; a replica may only talk to a master with the same id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreId {
    pub creation_time: i64,
    pub random_id: i64,
    pub store_version: i64,
}

impl StoreId {
    pub fn new(creation_time: i64, random_id: i64, store_version: i64) -> Self {
        Self {
            creation_time,
            random_id,
            store_version,
        }
    }
}

impl Display for StoreId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "StoreId[time={}, random={}, version={}]",
            self.creation_time, self.random_id, self.store_version
        )
    }
}
