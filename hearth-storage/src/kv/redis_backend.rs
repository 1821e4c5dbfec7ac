//! Redis-backed key-value store.
//!
//! Requires the `redis` feature. One multiplexed connection is shared by all
//! callers; every command is bounded by the configured operation timeout.

use async_trait::async_trait;
use hearth_core::{StoreError, StoreResult};
use redis::aio::MultiplexedConnection;
use redis::{Client, Cmd, FromRedisValue, Pipeline, Script};
use std::time::Duration;
use tokio::time::timeout;

use super::{effective_ttl, KeyValueStore, WriteOp};

const DELETE_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

const SET_IF_EQUALS: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2])
    return 1
else
    return 0
end
"#;

/// Redis connection settings.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Connection URL, e.g. `redis://localhost:6379`
    pub url: String,
    /// Prefix prepended to every key
    pub prefix: String,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            prefix: String::new(),
            connect_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(2),
        }
    }
}

pub struct RedisKvStore {
    conn: MultiplexedConnection,
    config: RedisStoreConfig,
    delete_if_equals: Script,
    set_if_equals: Script,
}

impl RedisKvStore {
    pub async fn connect(config: RedisStoreConfig) -> StoreResult<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| StoreError::unavailable(format!("invalid Redis URL: {}", e)))?;

        let conn = timeout(
            config.connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| StoreError::Timeout {
            operation: "CONNECT".to_string(),
        })?
        .map_err(|e| StoreError::unavailable(format!("Redis connection error: {}", e)))?;

        tracing::info!(url = %config.url, prefix = %config.prefix, "Connected to Redis");

        Ok(Self {
            conn,
            config,
            delete_if_equals: Script::new(DELETE_IF_EQUALS),
            set_if_equals: Script::new(SET_IF_EQUALS),
        })
    }

    fn prefixed(&self, key: &str) -> String {
        format!("{}{}", self.config.prefix, key)
    }

    fn unprefixed(&self, key: String) -> String {
        match key.strip_prefix(self.config.prefix.as_str()) {
            Some(rest) => rest.to_string(),
            None => key,
        }
    }

    async fn run<T: FromRedisValue>(&self, operation: &str, key: &str, cmd: Cmd) -> StoreResult<T> {
        let mut conn = self.conn.clone();
        timeout(self.config.operation_timeout, cmd.query_async(&mut conn))
            .await
            .map_err(|_| StoreError::Timeout {
                operation: operation.to_string(),
            })?
            .map_err(|e| map_redis_error(operation, key, e))
    }

    async fn eval<T: FromRedisValue>(
        &self,
        key: &str,
        invocation: redis::ScriptInvocation<'_>,
    ) -> StoreResult<T> {
        let mut conn = self.conn.clone();
        timeout(
            self.config.operation_timeout,
            invocation.invoke_async(&mut conn),
        )
        .await
        .map_err(|_| StoreError::Timeout {
            operation: "EVAL".to_string(),
        })?
        .map_err(|e| map_redis_error("EVAL", key, e))
    }

    fn with_ttl(cmd: &mut Cmd, ttl: Option<Duration>) {
        if let Some(ttl) = effective_ttl(ttl) {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
    }
}

fn map_redis_error(operation: &str, key: &str, err: redis::RedisError) -> StoreError {
    if err.code() == Some("WRONGTYPE") || err.kind() == redis::ErrorKind::TypeError {
        return StoreError::WrongType {
            key: key.to_string(),
        };
    }
    if operation.starts_with("INCR") && err.to_string().contains("not an integer") {
        return StoreError::NotAnInteger {
            key: key.to_string(),
        };
    }
    StoreError::unavailable(format!("Redis {} error: {}", operation, err))
}

#[async_trait]
impl KeyValueStore for RedisKvStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut cmd = redis::cmd("GET");
        cmd.arg(self.prefixed(key));
        self.run("GET", key, cmd).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.prefixed(key)).arg(value);
        Self::with_ttl(&mut cmd, ttl);
        self.run("SET", key, cmd).await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.prefixed(key)).arg(value).arg("NX");
        Self::with_ttl(&mut cmd, ttl);
        let reply: Option<String> = self.run("SET NX", key, cmd).await?;
        Ok(reply.is_some())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut cmd = redis::cmd("INCRBY");
        cmd.arg(self.prefixed(key)).arg(delta);
        self.run("INCRBY", key, cmd).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut cmd = redis::cmd("PEXPIRE");
        cmd.arg(self.prefixed(key)).arg(ttl.as_millis() as u64);
        let updated: i64 = self.run("PEXPIRE", key, cmd).await?;
        Ok(updated == 1)
    }

    async fn pttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut cmd = redis::cmd("PTTL");
        cmd.arg(self.prefixed(key));
        let millis: i64 = self.run("PTTL", key, cmd).await?;
        // -2 = missing key, -1 = no expiry
        Ok((millis >= 0).then(|| Duration::from_millis(millis as u64)))
    }

    async fn mget(&self, keys: &[String]) -> StoreResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(self.prefixed(key));
        }
        self.run("MGET", "*", cmd).await
    }

    async fn keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut cmd = redis::cmd("KEYS");
        cmd.arg(self.prefixed(pattern));
        let keys: Vec<String> = self.run("KEYS", pattern, cmd).await?;
        let mut keys: Vec<String> = keys.into_iter().map(|k| self.unprefixed(k)).collect();
        keys.sort();
        Ok(keys)
    }

    async fn del(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(self.prefixed(key));
        }
        self.run("DEL", "*", cmd).await
    }

    async fn sadd(&self, key: &str, members: &[String]) -> StoreResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("SADD");
        cmd.arg(self.prefixed(key)).arg(members);
        self.run("SADD", key, cmd).await
    }

    async fn srem(&self, key: &str, members: &[String]) -> StoreResult<u64> {
        if members.is_empty() {
            return Ok(0);
        }
        let mut cmd = redis::cmd("SREM");
        cmd.arg(self.prefixed(key)).arg(members);
        self.run("SREM", key, cmd).await
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut cmd = redis::cmd("SMEMBERS");
        cmd.arg(self.prefixed(key));
        let mut members: Vec<String> = self.run("SMEMBERS", key, cmd).await?;
        members.sort();
        Ok(members)
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let mut invocation = self.delete_if_equals.key(self.prefixed(key));
        invocation.arg(expected);
        let deleted: i64 = self.eval(key, invocation).await?;
        Ok(deleted == 1)
    }

    async fn set_if_equals(&self, key: &str, expected: &str, value: &str) -> StoreResult<bool> {
        let mut invocation = self.set_if_equals.key(self.prefixed(key));
        invocation.arg(expected).arg(value);
        let replaced: i64 = self.eval(key, invocation).await?;
        Ok(replaced == 1)
    }

    async fn apply(&self, ops: Vec<WriteOp>) -> StoreResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipe = Pipeline::new();
        pipe.atomic();
        for op in ops {
            match op {
                WriteOp::Set { key, value, ttl } => {
                    let cmd = pipe.cmd("SET").arg(self.prefixed(&key)).arg(value);
                    if let Some(ttl) = effective_ttl(ttl) {
                        cmd.arg("PX").arg(ttl.as_millis() as u64);
                    }
                    cmd.ignore();
                }
                WriteOp::Del { key } => {
                    pipe.cmd("DEL").arg(self.prefixed(&key)).ignore();
                }
                WriteOp::Expire { key, ttl } => {
                    pipe.cmd("PEXPIRE")
                        .arg(self.prefixed(&key))
                        .arg(ttl.as_millis() as u64)
                        .ignore();
                }
                WriteOp::SAdd { key, member } => {
                    pipe.cmd("SADD").arg(self.prefixed(&key)).arg(member).ignore();
                }
                WriteOp::SRem { key, member } => {
                    pipe.cmd("SREM").arg(self.prefixed(&key)).arg(member).ignore();
                }
            }
        }

        let mut conn = self.conn.clone();
        let result: Result<(), redis::RedisError> =
            timeout(self.config.operation_timeout, pipe.query_async(&mut conn))
                .await
                .map_err(|_| StoreError::Timeout {
                    operation: "MULTI/EXEC".to_string(),
                })?;
        result.map_err(|e| map_redis_error("MULTI/EXEC", "*", e))
    }

    async fn ping(&self) -> StoreResult<()> {
        let reply: String = self.run("PING", "", redis::cmd("PING")).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::unavailable(format!(
                "unexpected PING reply: {}",
                reply
            )))
        }
    }
}
