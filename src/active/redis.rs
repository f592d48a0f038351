//! KV-store active-request counter.
//!
//! Each backend gets a sorted set keyed by `active_requests:{backend_id}`,
//! members `request_id|instance_id` scored by start time, so expiry is a
//! score-range operation. Admission runs a server-side Lua script that drops
//! expired members, checks cardinality against the cap, and adds the new
//! member — atomically, in one round trip.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;

use super::{ActiveRequest, ActiveRequestStore, ACTIVE_REQUEST_TTL};
use crate::error::{ProxyError, Result};
use crate::types::now_ms;

const KEY_PREFIX: &str = "active_requests:";

/// Drop expired members, enforce the cap, add the member. ARGV: cutoff,
/// max (0 = unlimited), score, member, key-ttl-ms.
const ADMIT_SCRIPT: &str = r#"
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
local max = tonumber(ARGV[2])
if max > 0 and redis.call('ZCARD', KEYS[1]) >= max then
  return 0
end
redis.call('ZADD', KEYS[1], ARGV[3], ARGV[4])
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return 1
"#;

pub struct RedisActiveRequestStore {
    conn: ConnectionManager,
    admit: Script,
}

fn storage_err(err: redis::RedisError) -> ProxyError {
    ProxyError::Storage(err.to_string())
}

fn key_for(backend_id: &str) -> String {
    format!("{KEY_PREFIX}{backend_id}")
}

fn member_for(request: &ActiveRequest) -> String {
    format!("{}|{}", request.request_id, request.instance_id)
}

fn ttl_cutoff() -> i64 {
    now_ms() - ACTIVE_REQUEST_TTL.as_millis() as i64
}

/// Keys live twice the record TTL so abandoned sets eventually vanish even
/// without a sweep.
fn key_ttl_ms() -> i64 {
    2 * ACTIVE_REQUEST_TTL.as_millis() as i64
}

impl RedisActiveRequestStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(storage_err)?;
        let conn = ConnectionManager::new(client).await.map_err(storage_err)?;
        Ok(Self {
            conn,
            admit: Script::new(ADMIT_SCRIPT),
        })
    }

    async fn scan_backend_keys(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(format!("{KEY_PREFIX}*"))
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(storage_err)?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }
}

#[async_trait]
impl ActiveRequestStore for RedisActiveRequestStore {
    async fn try_record_start(
        &self,
        backend_id: &str,
        request: &ActiveRequest,
        max_limit: Option<u32>,
    ) -> Result<bool> {
        let mut conn = self.conn.clone();
        let admitted: i64 = self
            .admit
            .key(key_for(backend_id))
            .arg(ttl_cutoff())
            .arg(max_limit.unwrap_or(0))
            .arg(request.started_at_ms)
            .arg(member_for(request))
            .arg(key_ttl_ms())
            .invoke_async(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(admitted == 1)
    }

    async fn record_start(&self, backend_id: &str, request: &ActiveRequest) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.cmd("ZADD")
            .arg(key_for(backend_id))
            .arg(request.started_at_ms)
            .arg(member_for(request))
            .ignore()
            .cmd("PEXPIRE")
            .arg(key_for(backend_id))
            .arg(key_ttl_ms())
            .ignore();
        let _: () = pipe.query_async(&mut conn).await.map_err(storage_err)?;
        Ok(())
    }

    async fn record_complete(&self, backend_id: &str, request_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let key = key_for(backend_id);
        let members: Vec<String> = redis::cmd("ZRANGE")
            .arg(&key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;
        let prefix = format!("{request_id}|");
        let matching: Vec<&String> = members.iter().filter(|m| m.starts_with(&prefix)).collect();
        if matching.is_empty() {
            return Ok(());
        }
        let mut cmd = redis::cmd("ZREM");
        cmd.arg(&key);
        for member in matching {
            cmd.arg(member);
        }
        let _: () = cmd.query_async(&mut conn).await.map_err(storage_err)?;
        Ok(())
    }

    async fn get_count(&self, backend_id: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = redis::cmd("ZCOUNT")
            .arg(key_for(backend_id))
            .arg(format!("({}", ttl_cutoff()))
            .arg("+inf")
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(count)
    }

    async fn get_all_counts(&self) -> Result<HashMap<String, u64>> {
        let mut counts = HashMap::new();
        for key in self.scan_backend_keys().await? {
            let backend_id = key.trim_start_matches(KEY_PREFIX).to_string();
            let count = self.get_count(&backend_id).await?;
            if count > 0 {
                counts.insert(backend_id, count);
            }
        }
        Ok(counts)
    }

    async fn cleanup_instance(&self, instance_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let suffix = format!("|{instance_id}");
        for key in self.scan_backend_keys().await? {
            let members: Vec<String> = redis::cmd("ZRANGE")
                .arg(&key)
                .arg(0)
                .arg(-1)
                .query_async(&mut conn)
                .await
                .map_err(storage_err)?;
            let owned: Vec<&String> = members.iter().filter(|m| m.ends_with(&suffix)).collect();
            if owned.is_empty() {
                continue;
            }
            let mut cmd = redis::cmd("ZREM");
            cmd.arg(&key);
            for member in owned {
                cmd.arg(member);
            }
            let _: () = cmd.query_async(&mut conn).await.map_err(storage_err)?;
        }
        Ok(())
    }

    async fn sweep_expired(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let cutoff = ttl_cutoff();
        let mut reaped = 0u64;
        for key in self.scan_backend_keys().await? {
            let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
                .arg(&key)
                .arg("-inf")
                .arg(cutoff)
                .query_async(&mut conn)
                .await
                .map_err(storage_err)?;
            reaped += removed;
        }
        Ok(reaped)
    }
}
