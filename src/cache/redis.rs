//! Redis backend, enabled with the `redis` feature.
//!
//! Entries are written with `SET .. EX` so expiry is enforced server-side.
//! Prefix enumeration walks the keyspace with `SCAN MATCH` instead of `KEYS`
//! to avoid blocking the server on large databases.

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Client};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use super::error::StoreError;
use super::store::{CacheBackend, Ttl};

const SCAN_BATCH: usize = 500;

pub struct RedisBackend {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl RedisBackend {
    /// Open a multiplexed connection to `url`. All keys are stored under
    /// `key_prefix` so several deployments can share one server.
    pub async fn connect(url: &str, key_prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|err| StoreError::unavailable(err.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| StoreError::unavailable(err.to_string()))?;
        let key_prefix = key_prefix.into();
        info!(key_prefix = %key_prefix, "Connected to redis cache backend");
        Ok(Self { conn, key_prefix })
    }

    fn physical(&self, key: &str) -> String {
        format!("{}{key}", self.key_prefix)
    }
}

fn command_error(op: &'static str) -> impl Fn(::redis::RedisError) -> StoreError {
    move |err| {
        if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
            StoreError::unavailable(format!("{op}: {err}"))
        } else {
            StoreError::backend(format!("{op}: {err}"))
        }
    }
}

/// Escape glob metacharacters so a literal prefix can be used with `MATCH`.
fn glob_literal(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let mut conn = self.conn.clone();
        let payload: Option<Vec<u8>> = conn
            .get(self.physical(key))
            .await
            .map_err(command_error("GET"))?;
        Ok(payload.map(Bytes::from))
    }

    async fn set(&self, key: &str, payload: Bytes, ttl: Ttl) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(self.physical(key), &payload[..], ttl.as_secs())
            .await
            .map_err(command_error("SETEX"))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn
            .del(self.physical(key))
            .await
            .map_err(command_error("DEL"))?;
        Ok(removed > 0)
    }

    async fn delete_many(&self, keys: &[String]) -> Result<usize, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let physical: Vec<String> = keys.iter().map(|key| self.physical(key)).collect();
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(&physical).await.map_err(command_error("DEL"))?;
        Ok(usize::try_from(removed).unwrap_or_default())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{}*", glob_literal(&self.physical(prefix)));
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut found = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(command_error("SCAN"))?;
            found.extend(
                batch
                    .into_iter()
                    .filter_map(|key| key.strip_prefix(&self.key_prefix).map(str::to_string)),
            );
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may report a key more than once across iterations.
        found.sort_unstable();
        found.dedup();
        Ok(found)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(self.physical(key))
            .await
            .map_err(command_error("EXISTS"))?;
        Ok(exists)
    }
}

#[cfg(test)]
mod tests {
    use super::glob_literal;

    #[test]
    fn glob_metacharacters_are_escaped() {
        assert_eq!(glob_literal("inkwell:article-list:"), "inkwell:article-list:");
        assert_eq!(glob_literal("a*b?[c]\\"), "a\\*b\\?\\[c\\]\\\\");
    }
}
