//! Key-value store client.
//!
//! Thin async wrapper over a Redis-compatible store. All multi-step updates
//! go through pipelines or the compare-and-set script; there are no
//! distributed locks anywhere in the service.

use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv store unavailable: {0}")]
    Unavailable(String),
    #[error("kv command failed: {0}")]
    Command(String),
}

impl From<redis::RedisError> for KvError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_io_error() || err.is_timeout() {
            KvError::Unavailable(err.to_string())
        } else {
            KvError::Command(err.to_string())
        }
    }
}

// Single round trip: if the hash field still holds the expected value,
// replace it and report 1, otherwise report 0.
const CAS_FIELD_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if current == ARGV[2] then
  redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
  return 1
end
return 0
"#;

#[derive(Clone)]
pub struct KvClient {
    manager: ConnectionManager,
}

impl KvClient {
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client =
            redis::Client::open(url).map_err(|err| KvError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| KvError::Unavailable(err.to_string()))?;
        Ok(Self { manager })
    }

    pub async fn ping(&self) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> Result<(), KvError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>, KvError> {
        let mut conn = self.manager.clone();
        let map: HashMap<String, String> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(map)
    }

    /// Compare-and-set on a single hash field. Returns whether the swap won.
    pub async fn hcas(
        &self,
        key: &str,
        field: &str,
        expected: &str,
        next: &str,
    ) -> Result<bool, KvError> {
        let mut conn = self.manager.clone();
        let script = Script::new(CAS_FIELD_SCRIPT);
        let won: i64 = script
            .key(key)
            .arg(field)
            .arg(expected)
            .arg(next)
            .invoke_async(&mut conn)
            .await?;
        Ok(won == 1)
    }

    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    pub async fn del(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    pub async fn expire(&self, key: &str, ttl_secs: u64) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn sadd(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("SADD")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn srem(&self, key: &str, member: &str) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.manager.clone();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    pub async fn lpush(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Blocking pop across several lists; keys are checked in the given
    /// order, which is what makes priority queues work.
    pub async fn brpop(
        &self,
        keys: &[String],
        timeout_secs: u64,
    ) -> Result<Option<(String, String)>, KvError> {
        let mut conn = self.manager.clone();
        let mut cmd = redis::cmd("BRPOP");
        for key in keys {
            cmd.arg(key);
        }
        cmd.arg(timeout_secs);
        let popped: Option<(String, String)> = cmd.query_async(&mut conn).await?;
        Ok(popped)
    }

    pub async fn llen(&self, key: &str) -> Result<u64, KvError> {
        let mut conn = self.manager.clone();
        let len: u64 = redis::cmd("LLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    /// Prune a sliding window and report its cardinality, in one pipeline.
    pub async fn window_prune_and_count(
        &self,
        key: &str,
        window_start: f64,
    ) -> Result<u64, KvError> {
        let mut conn = self.manager.clone();
        let (_removed, count): (u64, u64) = redis::pipe()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(0)
            .arg(window_start)
            .cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    /// Record one entry in a sliding window and refresh the key TTL.
    pub async fn window_record(
        &self,
        key: &str,
        member: &str,
        score: f64,
        ttl_secs: u64,
    ) -> Result<(), KvError> {
        let mut conn = self.manager.clone();
        let _: (u64, u64) = redis::pipe()
            .cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Sum the amounts embedded in window members shaped `score:amount:nonce`.
    /// Members without an amount field count as 1.
    pub async fn window_sum(&self, key: &str, window_start: f64) -> Result<u64, KvError> {
        let mut conn = self.manager.clone();
        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(format!("({window_start}"))
            .arg("+inf")
            .query_async(&mut conn)
            .await?;
        let total = members
            .iter()
            .map(|member| {
                member
                    .split(':')
                    .nth(1)
                    .and_then(|amount| amount.parse::<u64>().ok())
                    .unwrap_or(1)
            })
            .sum();
        Ok(total)
    }

    /// Score of the oldest entry still inside the window, if any.
    pub async fn window_oldest_score(&self, key: &str) -> Result<Option<f64>, KvError> {
        let mut conn = self.manager.clone();
        let entries: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(key)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await?;
        Ok(entries.first().map(|(_, score)| *score))
    }

    /// Cursor-based key scan; used by the admin key listing, never on a hot
    /// path.
    pub async fn scan_match(&self, pattern: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.manager.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

}
