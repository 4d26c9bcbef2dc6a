//! Redis-backed broker.
//!
//! Uses a [`ConnectionManager`] for command traffic (it reconnects under the
//! hood) and a dedicated pub/sub connection per subscription. Multi-step
//! conditional operations run as Lua scripts so they stay atomic across
//! service replicas.

use crate::{Broker, BrokerError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error};

/// A [`Broker`] backed by a Redis server.
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    manager: ConnectionManager,
}

fn broker_err(err: RedisError) -> BrokerError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_timeout() {
        BrokerError::Connection(err.to_string())
    } else {
        BrokerError::Command(err.to_string())
    }
}

/// Atomically pop the earliest member with score `<= ARGV[1]`, returning the
/// member and its score.
const POP_DUE_SCRIPT: &str = r#"
local entries = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'WITHSCORES', 'LIMIT', 0, 1)
if #entries == 0 then
    return false
end
redis.call('ZREM', KEYS[1], entries[1])
return {entries[1], entries[2]}
"#;

/// Compare-and-set a hash field. ARGV[1] is '1' when an expected value is
/// supplied in ARGV[2]; ARGV[3] is the replacement.
const HASH_CAS_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
local has_expected = ARGV[2] == '1'
local matches
if has_expected then
    matches = current == ARGV[3]
else
    matches = current == false
end
if matches then
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[4])
    return 1
end
return 0
"#;

impl RedisBroker {
    /// Connect to a Redis endpoint, optionally selecting a database index.
    pub async fn connect(url: &str, db: Option<i64>) -> Result<Self> {
        let url = match db {
            Some(index) => format!("{}/{index}", url.trim_end_matches('/')),
            None => url.to_string(),
        };

        let client = redis::Client::open(url.as_str()).map_err(|e| {
            error!("failed to create Redis client for {url}: {e}");
            BrokerError::Connection(e.to_string())
        })?;

        let manager = ConnectionManager::new(client.clone()).await.map_err(|e| {
            error!("failed to connect to Redis at {url}: {e}");
            BrokerError::Connection(e.to_string())
        })?;

        debug!("connected to Redis broker at {url}");

        Ok(Self { client, manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn push_back(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.rpush::<_, _, ()>(key, value).await.map_err(broker_err)
    }

    async fn pop_front(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        conn.lpop(key, None).await.map_err(broker_err)
    }

    async fn blocking_pop_front(
        &self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        if timeout.is_zero() {
            return self.pop_front(key).await;
        }
        let mut conn = self.conn();
        // BLPOP with timeout 0 would block forever; keep it strictly positive.
        let timeout_secs = timeout.as_secs_f64().max(0.01);
        let popped: Option<(String, String)> =
            conn.blpop(key, timeout_secs).await.map_err(broker_err)?;
        Ok(popped.map(|(_, value)| value))
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn();
        conn.lrange(key, start, stop).await.map_err(broker_err)
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn();
        conn.llen(key).await.map_err(broker_err)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.hset::<_, _, _, ()>(key, field, value)
            .await
            .map_err(broker_err)
    }

    async fn hash_set_multiple(&self, key: &str, entries: &[(String, String)]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        conn.hset_multiple::<_, _, _, ()>(key, entries)
            .await
            .map_err(broker_err)
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        conn.hget(key, field).await.map_err(broker_err)
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn();
        conn.hgetall(key).await.map_err(broker_err)
    }

    async fn hash_del(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.hdel::<_, _, ()>(key, field).await.map_err(broker_err)
    }

    async fn hash_compare_and_set(
        &self,
        key: &str,
        field: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool> {
        let script = redis::Script::new(HASH_CAS_SCRIPT);
        let mut conn = self.conn();
        let mut invocation = script.key(key);
        invocation.arg(field);
        invocation.arg(if expected.is_some() { "1" } else { "0" });
        invocation.arg(expected.unwrap_or(""));
        invocation.arg(new);
        let swapped: i64 = invocation.invoke_async(&mut conn).await.map_err(broker_err)?;
        Ok(swapped == 1)
    }

    async fn zset_add(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut conn = self.conn();
        conn.zadd::<_, _, _, ()>(key, member, score)
            .await
            .map_err(broker_err)
    }

    async fn zset_pop_due(&self, key: &str, max_score: i64) -> Result<Option<(String, i64)>> {
        let script = redis::Script::new(POP_DUE_SCRIPT);
        let mut conn = self.conn();
        let mut invocation = script.key(key);
        invocation.arg(max_score);
        let popped: Option<(String, String)> =
            invocation.invoke_async(&mut conn).await.map_err(broker_err)?;
        Ok(popped.and_then(|(member, score)| {
            score
                .parse::<f64>()
                .ok()
                .map(|score| (member, score as i64))
        }))
    }

    async fn zset_peek_score(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.conn();
        let head: Vec<(String, f64)> = conn
            .zrange_withscores(key, 0, 0)
            .await
            .map_err(broker_err)?;
        Ok(head.first().map(|(_, score)| *score as i64))
    }

    async fn zset_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn();
        conn.zrange(key, start, stop).await.map_err(broker_err)
    }

    async fn zset_remove(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.zrem::<_, _, ()>(key, member).await.map_err(broker_err)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn();
        conn.get(key).await.map_err(broker_err)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await
            .map_err(broker_err)?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.del::<_, ()>(key).await.map_err(broker_err)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn();
        conn.exists(key).await.map_err(broker_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn();
        conn.pexpire::<_, ()>(key, ttl.as_millis().max(1) as i64)
            .await
            .map_err(broker_err)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(broker_err)
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(broker_err)?;
        pubsub.subscribe(channel).await.map_err(broker_err)?;
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<String>().ok() });
        Ok(stream.boxed())
    }
}
