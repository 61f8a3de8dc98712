use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use rideshare_core::{CasOutcome, PersistenceError, RecordStore, Versioned};
use rideshare_shared::{Collection, RecordChange};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const FEED_RECONNECT_DELAY: Duration = Duration::from_secs(1);

// Every script publishes the committed change on the feed channel inside
// the same atomic step, so subscribers see commits in order no matter which
// process made them. Payloads are `RecordChange` JSON.

// KEYS[1] record hash, KEYS[2] collection index, KEYS[3] sequence counter
// ARGV[1] expected version ("" = must not exist), ARGV[2] value, ARGV[3] key,
// ARGV[4] feed channel, ARGV[5] collection name
// Returns the committed version, or -1 on a version mismatch.
const CAS_SCRIPT: &str = r#"
    local current = redis.call("HGET", KEYS[1], "version")
    if ARGV[1] == "" then
        if current then return -1 end
    elseif current ~= ARGV[1] then
        return -1
    end
    local next = tonumber(current or "0") + 1
    redis.call("HSET", KEYS[1], "version", next, "value", ARGV[2])
    if not redis.call("ZSCORE", KEYS[2], ARGV[3]) then
        redis.call("ZADD", KEYS[2], redis.call("INCR", KEYS[3]), ARGV[3])
    end
    redis.call("PUBLISH", ARGV[4], cjson.encode({
        collection = ARGV[5], key = ARGV[3], kind = { put = { version = next } }
    }))
    return next
"#;

// Same layout as CAS_SCRIPT, without the version check:
// ARGV[1] value, ARGV[2] key, ARGV[3] feed channel, ARGV[4] collection name
const PUT_SCRIPT: &str = r#"
    local next = tonumber(redis.call("HGET", KEYS[1], "version") or "0") + 1
    redis.call("HSET", KEYS[1], "version", next, "value", ARGV[1])
    if not redis.call("ZSCORE", KEYS[2], ARGV[2]) then
        redis.call("ZADD", KEYS[2], redis.call("INCR", KEYS[3]), ARGV[2])
    end
    redis.call("PUBLISH", ARGV[3], cjson.encode({
        collection = ARGV[4], key = ARGV[2], kind = { put = { version = next } }
    }))
    return next
"#;

// KEYS[1] record hash, KEYS[2] collection index
// ARGV[1] key, ARGV[2] feed channel, ARGV[3] collection name
const DELETE_SCRIPT: &str = r#"
    local removed = redis.call("DEL", KEYS[1])
    redis.call("ZREM", KEYS[2], ARGV[1])
    if removed > 0 then
        redis.call("PUBLISH", ARGV[2], cjson.encode({
            collection = ARGV[3], key = ARGV[1], kind = "deleted"
        }))
    end
    return removed
"#;

fn unavailable(err: redis::RedisError) -> PersistenceError {
    PersistenceError::Unavailable(err.to_string())
}

fn parse_change(payload: &str) -> Option<RecordChange> {
    match serde_json::from_str(payload) {
        Ok(change) => Some(change),
        Err(e) => {
            warn!("Ignoring malformed change notification: {}", e);
            None
        }
    }
}

async fn open_feed(client: &redis::Client, channel: &str) -> Result<redis::aio::PubSub, PersistenceError> {
    let mut pubsub = client.get_async_pubsub().await.map_err(unavailable)?;
    pubsub.subscribe(channel).await.map_err(unavailable)?;
    Ok(pubsub)
}

/// Relays the shared notification channel into the local broadcast feed,
/// reconnecting when the connection drops. Changes published while
/// disconnected are lost to this process.
async fn follow_changes(
    client: redis::Client,
    channel: String,
    mut pubsub: redis::aio::PubSub,
    changes: broadcast::Sender<RecordChange>,
) {
    loop {
        {
            let mut messages = pubsub.on_message();
            while let Some(message) = messages.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Unreadable change notification: {}", e);
                        continue;
                    }
                };
                if let Some(change) = parse_change(&payload) {
                    // No receivers is fine: nobody is watching yet.
                    let _ = changes.send(change);
                }
            }
        }
        error!("Change notifications on {} stopped, reconnecting", channel);

        pubsub = loop {
            tokio::time::sleep(FEED_RECONNECT_DELAY).await;
            match open_feed(&client, &channel).await {
                Ok(pubsub) => break pubsub,
                Err(e) => warn!("Reconnecting change notifications failed: {}", e),
            }
        };
        info!("Change notifications on {} resumed", channel);
    }
}

struct FeedTask(AbortHandle);

impl Drop for FeedTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Redis-backed record store. Each record is a hash holding `version` and
/// the JSON `value`; a sorted set per collection keeps insertion order.
///
/// Commits are announced on a Redis pub/sub channel, so the change feed
/// covers writes made by every process sharing the prefix.
#[derive(Clone)]
pub struct RedisRecordStore {
    client: redis::Client,
    prefix: String,
    changes: broadcast::Sender<RecordChange>,
    _feed: Option<Arc<FeedTask>>,
}

impl RedisRecordStore {
    pub async fn new(connection_string: &str, prefix: Option<&str>, feed_capacity: usize) -> Result<Self, PersistenceError> {
        let client = redis::Client::open(connection_string).map_err(unavailable)?;
        // Fail fast on a bad URL or unreachable server.
        let mut conn = client.get_multiplexed_async_connection().await.map_err(unavailable)?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(unavailable)?;
        info!("Connected to redis record store");

        let prefix = prefix.unwrap_or("rideshare").to_string();
        let (changes, _) = broadcast::channel(feed_capacity.max(1));

        // Subscribed before returning: no commit after `new` is missed.
        let channel = feed_channel(&prefix);
        let pubsub = open_feed(&client, &channel).await?;
        let task = tokio::spawn(follow_changes(client.clone(), channel, pubsub, changes.clone()));

        Ok(Self {
            client,
            prefix,
            changes,
            _feed: Some(Arc::new(FeedTask(task.abort_handle()))),
        })
    }

    fn channel(&self) -> String {
        feed_channel(&self.prefix)
    }

    fn record_key(&self, collection: Collection, key: &str) -> String {
        format!("{}:{}:{}", self.prefix, collection, key)
    }

    fn index_key(&self, collection: Collection) -> String {
        format!("{}:{}:_index", self.prefix, collection)
    }

    fn seq_key(&self, collection: Collection) -> String {
        format!("{}:{}:_seq", self.prefix, collection)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, PersistenceError> {
        self.client.get_multiplexed_async_connection().await.map_err(unavailable)
    }

    fn parse_row(
        &self,
        collection: Collection,
        key: &str,
        version: Option<u64>,
        raw: Option<String>,
    ) -> Result<Option<Versioned>, PersistenceError> {
        match (version, raw) {
            (Some(version), Some(raw)) => {
                let value = serde_json::from_str(&raw).map_err(|e| PersistenceError::Corrupt {
                    collection,
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(Some(Versioned { version, value }))
            }
            _ => Ok(None),
        }
    }

    fn serialize(collection: Collection, key: &str, value: &Value) -> Result<String, PersistenceError> {
        serde_json::to_string(value).map_err(|e| PersistenceError::Corrupt {
            collection,
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

}

fn feed_channel(prefix: &str) -> String {
    format!("{}:_changes", prefix)
}

#[async_trait]
impl RecordStore for RedisRecordStore {
    fn generate_key(&self) -> String {
        Uuid::new_v4().to_string()
    }

    async fn get(&self, collection: Collection, key: &str) -> Result<Option<Versioned>, PersistenceError> {
        let mut conn = self.connection().await?;
        let (version, raw): (Option<u64>, Option<String>) = redis::cmd("HMGET")
            .arg(self.record_key(collection, key))
            .arg("version")
            .arg("value")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        self.parse_row(collection, key, version, raw)
    }

    async fn list(&self, collection: Collection) -> Result<Vec<(String, Versioned)>, PersistenceError> {
        let mut conn = self.connection().await?;
        let keys: Vec<String> = conn
            .zrange(self.index_key(collection), 0, -1)
            .await
            .map_err(unavailable)?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.cmd("HMGET")
                .arg(self.record_key(collection, key))
                .arg("version")
                .arg("value");
        }
        let rows: Vec<(Option<u64>, Option<String>)> = pipe.query_async(&mut conn).await.map_err(unavailable)?;

        let mut records = Vec::with_capacity(keys.len());
        for (key, (version, raw)) in keys.into_iter().zip(rows) {
            // A key can vanish between the index read and the fetch.
            if let Some(record) = self.parse_row(collection, &key, version, raw)? {
                records.push((key, record));
            }
        }
        Ok(records)
    }

    async fn put(&self, collection: Collection, key: &str, value: Value) -> Result<u64, PersistenceError> {
        let payload = Self::serialize(collection, key, &value)?;
        let mut conn = self.connection().await?;
        let version: u64 = redis::Script::new(PUT_SCRIPT)
            .key(self.record_key(collection, key))
            .key(self.index_key(collection))
            .key(self.seq_key(collection))
            .arg(payload)
            .arg(key)
            .arg(self.channel())
            .arg(collection.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(version)
    }

    async fn compare_and_put(
        &self,
        collection: Collection,
        key: &str,
        expected: Option<u64>,
        value: Value,
    ) -> Result<CasOutcome, PersistenceError> {
        let payload = Self::serialize(collection, key, &value)?;
        let expected_arg = expected.map(|v| v.to_string()).unwrap_or_default();

        let mut conn = self.connection().await?;
        let result: i64 = redis::Script::new(CAS_SCRIPT)
            .key(self.record_key(collection, key))
            .key(self.index_key(collection))
            .key(self.seq_key(collection))
            .arg(expected_arg)
            .arg(payload)
            .arg(key)
            .arg(self.channel())
            .arg(collection.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        if result < 0 {
            let current: Option<u64> = conn
                .hget(self.record_key(collection, key), "version")
                .await
                .map_err(unavailable)?;
            debug!("CAS conflict on {}/{}: expected {:?}, found {:?}", collection, key, expected, current);
            return Ok(CasOutcome::Conflict { current });
        }

        Ok(CasOutcome::Committed(result as u64))
    }

    async fn delete(&self, collection: Collection, key: &str) -> Result<bool, PersistenceError> {
        let mut conn = self.connection().await?;
        let removed: i64 = redis::Script::new(DELETE_SCRIPT)
            .key(self.record_key(collection, key))
            .key(self.index_key(collection))
            .arg(key)
            .arg(self.channel())
            .arg(collection.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;

        Ok(removed > 0)
    }

    fn subscribe(&self) -> broadcast::Receiver<RecordChange> {
        self.changes.subscribe()
    }
}
