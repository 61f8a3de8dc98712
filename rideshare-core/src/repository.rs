use async_trait::async_trait;
use rideshare_shared::{Collection, RecordChange};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Attempts `merge` makes against a contended key before giving up.
pub const MERGE_ATTEMPTS: u32 = 8;

/// A stored record together with its write version. Versions start at 1
/// and increase by one on every committed write of the key.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub version: u64,
    pub value: Value,
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write committed at this version.
    Committed(u64),
    /// Another writer got there first; nothing was written.
    Conflict { current: Option<u64> },
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PersistenceError {
    #[error("Record store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt record {collection}/{key}: {reason}")]
    Corrupt {
        collection: Collection,
        key: String,
        reason: String,
    },

    #[error("Write contention on {collection}/{key} after {attempts} attempts")]
    Contention {
        collection: Collection,
        key: String,
        attempts: u32,
    },
}

impl PersistenceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, PersistenceError::Unavailable(_) | PersistenceError::Contention { .. })
    }
}

/// The keyed persistence collaborator behind the trip and pickup stores.
///
/// Implementations must make `compare_and_put` and `delete` atomic per key
/// and must publish a [`RecordChange`] on the feed returned by `subscribe`
/// after every committed write, in commit order.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fresh, unique key. No format is promised beyond uniqueness.
    fn generate_key(&self) -> String;

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Versioned>, PersistenceError>;

    /// Every record of the collection, in insertion order.
    async fn list(&self, collection: Collection) -> Result<Vec<(String, Versioned)>, PersistenceError>;

    /// Unconditional write. Returns the committed version.
    async fn put(&self, collection: Collection, key: &str, value: Value) -> Result<u64, PersistenceError>;

    /// Writes only if the stored version equals `expected` (`None` means the
    /// key must not exist).
    async fn compare_and_put(
        &self,
        collection: Collection,
        key: &str,
        expected: Option<u64>,
        value: Value,
    ) -> Result<CasOutcome, PersistenceError>;

    /// Returns false when there was nothing to delete.
    async fn delete(&self, collection: Collection, key: &str) -> Result<bool, PersistenceError>;

    /// Commit-ordered feed of changes.
    fn subscribe(&self) -> broadcast::Receiver<RecordChange>;

    /// Shallow-merges the fields of `partial` into the stored object.
    /// Returns `None` when the key does not exist.
    async fn merge(
        &self,
        collection: Collection,
        key: &str,
        partial: Value,
    ) -> Result<Option<Versioned>, PersistenceError> {
        let Value::Object(fields) = partial else {
            return Err(PersistenceError::Corrupt {
                collection,
                key: key.to_string(),
                reason: "merge payload is not an object".to_string(),
            });
        };

        for _ in 0..MERGE_ATTEMPTS {
            let Some(current) = self.get(collection, key).await? else {
                return Ok(None);
            };
            let Value::Object(mut merged) = current.value else {
                return Err(PersistenceError::Corrupt {
                    collection,
                    key: key.to_string(),
                    reason: "stored value is not an object".to_string(),
                });
            };
            for (field, value) in fields.iter() {
                merged.insert(field.clone(), value.clone());
            }
            let merged = Value::Object(merged);

            match self
                .compare_and_put(collection, key, Some(current.version), merged.clone())
                .await?
            {
                CasOutcome::Committed(version) => {
                    return Ok(Some(Versioned { version, value: merged }));
                }
                CasOutcome::Conflict { .. } => {
                    tracing::debug!("merge conflict on {}/{}, retrying", collection, key);
                }
            }
        }

        Err(PersistenceError::Contention {
            collection,
            key: key.to_string(),
            attempts: MERGE_ATTEMPTS,
        })
    }
}

/// Serializes a domain record into its stored form.
pub fn encode<T: Serialize>(collection: Collection, key: &str, record: &T) -> Result<Value, PersistenceError> {
    serde_json::to_value(record).map_err(|e| PersistenceError::Corrupt {
        collection,
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Reads a stored value back into a domain record.
pub fn decode<T: DeserializeOwned>(collection: Collection, key: &str, value: Value) -> Result<T, PersistenceError> {
    serde_json::from_value(value).map_err(|e| PersistenceError::Corrupt {
        collection,
        key: key.to_string(),
        reason: e.to_string(),
    })
}
