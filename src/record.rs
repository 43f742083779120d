//! Relay records and delivery options.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{self, Payload};

/// Store-generated record identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<uuid::Uuid> for RecordId {
    fn from(id: uuid::Uuid) -> Self {
        RecordId(id.to_string())
    }
}

/// Where a broadcast goes within its namespace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryOptions {
    /// Target rooms. `None` means every subscriber of the namespace.
    pub rooms: Option<BTreeSet<String>>,
    /// Rooms whose members are skipped even when otherwise targeted.
    #[serde(default)]
    pub except: BTreeSet<String>,
    /// Auxiliary delivery hints (volatile, compress, ...), passed through untouched.
    #[serde(default, serialize_with = "codec::serialize_present")]
    pub flags: BTreeMap<String, Payload>,
}

impl DeliveryOptions {
    /// Deliver to the whole namespace.
    pub fn everyone() -> Self {
        Self::default()
    }

    /// Deliver to members of the given rooms.
    pub fn to_rooms<I, S>(rooms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            rooms: Some(rooms.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    pub fn except<I, S>(mut self, rooms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.except.extend(rooms.into_iter().map(Into::into));
        self
    }

    pub fn with_flag(mut self, name: impl Into<String>, value: impl Into<Payload>) -> Self {
        self.flags.insert(name.into(), value.into());
        self
    }
}

/// A record about to be inserted. The store assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub origin_id: String,
    pub namespace: String,
    pub event: Value,
    pub delivery_options: Value,
}

/// A relay record as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: RecordId,
    pub origin_id: String,
    /// Missing on records written by peers that predate namespacing.
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub event: Value,
    #[serde(default)]
    pub delivery_options: Value,
}

impl LogRecord {
    pub fn from_new(id: RecordId, record: NewRecord) -> Self {
        Self {
            id,
            origin_id: record.origin_id,
            namespace: Some(record.namespace),
            event: record.event,
            delivery_options: record.delivery_options,
        }
    }
}
