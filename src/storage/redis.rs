// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis backend for the shared store.
//!
//! Two Lua scripts carry the operations that must be indivisible:
//! - **release**: delete a lock key only while it still holds the caller's token
//! - **admission**: window check, stock check, duplicate check, decrement and
//!   claimant record in one server-side step
//!
//! Streams map onto consumer groups (`XREADGROUP`, `XACK`, `XAUTOCLAIM`).
//!
//! Nothing here retries. The request path treats a failed command as a
//! verdict (`StoreUnavailable`), only connecting uses the startup retry.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, RedisError, Script};
use tracing::debug;

use super::traits::{AdmissionKeys, KvStore, ReadFrom, StorageError, StreamEntry, StreamLog};
use crate::resilience::retry::{retry, RetryConfig};

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

// KEYS[1] resource hash, KEYS[2] claimants hash
// ARGV[1] client id, ARGV[2] claim id, ARGV[3] now (ms)
const ADMISSION_SCRIPT: &str = r#"
local fields = redis.call('HMGET', KEYS[1], 'stock', 'begin', 'end')
if not fields[1] then
    return 5
end
local now = tonumber(ARGV[3])
local begin_at = tonumber(fields[2] or '0') or 0
local end_at = tonumber(fields[3] or '0') or 0
if begin_at > 0 and now < begin_at then
    return 3
end
if end_at > 0 and now > end_at then
    return 4
end
if (tonumber(fields[1]) or 0) <= 0 then
    return 1
end
if redis.call('HEXISTS', KEYS[2], ARGV[1]) == 1 then
    return 2
end
redis.call('HINCRBY', KEYS[1], 'stock', -1)
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2])
return 0
"#;

fn unavailable(e: RedisError) -> StorageError {
    StorageError::Unavailable(e.to_string())
}

pub struct RedisStore {
    connection: ConnectionManager,
    /// Optional key prefix for namespacing (e.g., "shop:" → "shop:lock:order:7")
    prefix: String,
    release: Script,
    admission: Script,
}

impl RedisStore {
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        Self::with_prefix(connection_string, None).await
    }

    /// Connect with an optional key prefix applied to every key and stream.
    ///
    /// ```rust,no_run
    /// # use claim_engine::storage::redis::RedisStore;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let store = RedisStore::with_prefix("redis://localhost", Some("shop:")).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_prefix(connection_string: &str, prefix: Option<&str>) -> Result<Self, StorageError> {
        let client = Client::open(connection_string).map_err(unavailable)?;

        // Startup only: fail fast instead of hanging on a dead server
        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(unavailable)?;

        Ok(Self {
            connection,
            prefix: prefix.unwrap_or("").to_string(),
            release: Script::new(RELEASE_SCRIPT),
            admission: Script::new(ADMISSION_SCRIPT),
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        if self.prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}{}", self.prefix, key)
        }
    }

    pub fn connection(&self) -> ConnectionManager {
        self.connection.clone()
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(self.prefixed_key(key)).await.map_err(unavailable)?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let key = self.prefixed_key(key);
        match ttl {
            Some(ttl) => {
                let _: () = conn.pset_ex(&key, value, millis(ttl)).await.map_err(unavailable)?;
            }
            None => {
                let _: () = conn.set(&key, value).await.map_err(unavailable)?;
            }
        }
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        // SET key value PX ms NX replies OK or nil
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.prefixed_key(key))
            .arg(value)
            .arg("PX")
            .arg(millis(ttl))
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(self.prefixed_key(key)).await.map_err(unavailable)?;
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StorageError> {
        let mut conn = self.connection.clone();
        let deleted: i64 = self
            .release
            .key(self.prefixed_key(key))
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(deleted == 1)
    }

    async fn incr(&self, key: &str) -> Result<i64, StorageError> {
        let mut conn = self.connection.clone();
        let n: i64 = conn.incr(self.prefixed_key(key), 1).await.map_err(unavailable)?;
        Ok(n)
    }

    async fn hset_multiple(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StorageError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let _: () = conn
            .hset_multiple(self.prefixed_key(key), fields)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StorageError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.hget(self.prefixed_key(key), field).await.map_err(unavailable)?;
        Ok(value)
    }

    async fn admit(
        &self,
        keys: &AdmissionKeys,
        client_id: &str,
        claim_id: &str,
        now_ms: i64,
    ) -> Result<i64, StorageError> {
        let mut conn = self.connection.clone();
        let code: i64 = self
            .admission
            .key(self.prefixed_key(&keys.resource))
            .key(self.prefixed_key(&keys.claimants))
            .arg(client_id)
            .arg(claim_id)
            .arg(now_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(code)
    }
}

fn entries_from_reply(reply: StreamReadReply) -> Vec<StreamEntry> {
    reply
        .keys
        .into_iter()
        .flat_map(|k| k.ids)
        .map(|id| {
            let fields = id
                .map
                .iter()
                .filter_map(|(f, v)| redis::from_redis_value::<String>(v).ok().map(|v| (f.clone(), v)))
                .collect();
            StreamEntry { id: id.id, fields }
        })
        .collect()
}

fn pairs_to_fields(flat: Vec<String>) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    let mut it = flat.into_iter();
    while let (Some(f), Some(v)) = (it.next(), it.next()) {
        fields.insert(f, v);
    }
    fields
}

#[async_trait]
impl StreamLog for RedisStore {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StorageError> {
        let mut conn = self.connection.clone();
        let created: Result<(), RedisError> = conn
            .xgroup_create_mkstream(self.prefixed_key(stream), group, "0")
            .await;
        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream, group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String, StorageError> {
        let mut conn = self.connection.clone();
        let id: String = conn
            .xadd(self.prefixed_key(stream), "*", fields)
            .await
            .map_err(unavailable)?;
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        from: ReadFrom,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        let mut conn = self.connection.clone();
        let mut opts = StreamReadOptions::default().group(group, consumer).count(count);
        let start = match from {
            ReadFrom::New => {
                if let Some(block) = block {
                    opts = opts.block(usize::try_from(block.as_millis()).unwrap_or(usize::MAX));
                }
                ">"
            }
            ReadFrom::Pending => "0",
        };

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[self.prefixed_key(stream)], &[start], &opts)
            .await
            .map_err(unavailable)?;
        Ok(reply.map(entries_from_reply).unwrap_or_default())
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        let n: u64 = conn.xack(self.prefixed_key(stream), group, ids).await.map_err(unavailable)?;
        Ok(n)
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        let mut conn = self.connection.clone();
        // Reply: [next-start-id, [[id, [f, v, ...]], ...], (deleted ids on 7.0+)]
        let raw: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(self.prefixed_key(stream))
            .arg(group)
            .arg(consumer)
            .arg(u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX))
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        let parts: Vec<redis::Value> = redis::from_redis_value(&raw).map_err(unavailable)?;
        let Some(claimed) = parts.get(1) else {
            return Ok(Vec::new());
        };
        let (entries, deleted) = split_claimed(claimed);
        if !deleted.is_empty() {
            // Redis 6.2 keeps trimmed entries in the PEL and hands them back with nil fields
            debug!(stream, count = deleted.len(), "Acking pending entries deleted from the stream");
            self.ack(stream, group, &deleted).await?;
        }
        Ok(entries)
    }
}

/// Split the claimed section of an `XAUTOCLAIM` reply into live entries and
/// ids whose payload no longer exists.
fn split_claimed(claimed: &redis::Value) -> (Vec<StreamEntry>, Vec<String>) {
    let redis::Value::Array(items) = claimed else {
        return (Vec::new(), Vec::new());
    };
    let mut entries = Vec::with_capacity(items.len());
    let mut deleted = Vec::new();
    for item in items {
        match redis::from_redis_value::<(String, Option<Vec<String>>)>(item) {
            Ok((id, Some(flat))) if !flat.is_empty() => {
                entries.push(StreamEntry { id, fields: pairs_to_fields(flat) });
            }
            Ok((id, _)) => deleted.push(id),
            Err(e) => debug!(error = %e, "Skipping unreadable pending entry"),
        }
    }
    (entries, deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_pairs() {
        let fields = pairs_to_fields(vec!["a".into(), "1".into(), "b".into(), "2".into(), "dangling".into()]);
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["a"], "1");
        assert_eq!(fields["b"], "2");
    }

    fn bulk(s: &str) -> redis::Value {
        redis::Value::BulkString(s.as_bytes().to_vec())
    }

    #[test]
    fn test_claimed_skips_deleted_entries() {
        use redis::Value;
        let claimed = Value::Array(vec![
            Value::Array(vec![bulk("1-0"), Value::Array(vec![bulk("claim_id"), bulk("7")])]),
            Value::Array(vec![bulk("2-0"), Value::Nil]),
            Value::Nil,
            Value::Array(vec![bulk("3-0"), Value::Array(vec![bulk("claim_id"), bulk("9")])]),
        ]);

        let (entries, deleted) = split_claimed(&claimed);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "1-0");
        assert_eq!(entries[0].fields["claim_id"], "7");
        assert_eq!(entries[1].id, "3-0");
        assert_eq!(deleted, vec!["2-0".to_string()]);
    }

    #[test]
    fn test_claimed_tolerates_empty_section() {
        let (entries, deleted) = split_claimed(&redis::Value::Array(vec![]));
        assert!(entries.is_empty() && deleted.is_empty());
        let (entries, _) = split_claimed(&redis::Value::Nil);
        assert!(entries.is_empty());
    }

    #[test]
    fn test_millis_never_zero() {
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }
}
