use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level record collections held by the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Trips,
    Pickups,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Trips => "trips",
            Collection::Pickups => "pickups",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Put { version: u64 },
    Deleted,
}

/// Emitted by a record store once a write has committed. Feeds are ordered
/// by commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordChange {
    pub collection: Collection,
    pub key: String,
    pub kind: ChangeKind,
}

impl RecordChange {
    pub fn put(collection: Collection, key: impl Into<String>, version: u64) -> Self {
        Self {
            collection,
            key: key.into(),
            kind: ChangeKind::Put { version },
        }
    }

    pub fn deleted(collection: Collection, key: impl Into<String>) -> Self {
        Self {
            collection,
            key: key.into(),
            kind: ChangeKind::Deleted,
        }
    }
}
