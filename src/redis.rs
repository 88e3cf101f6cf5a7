// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of PlexLease.
//
// PlexLease is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// PlexLease is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with PlexLease. If not, see <https://www.gnu.org/licenses/>.

//! Redis-based lease store.
//!
//! ## Purpose
//! Distributed backend using Redis primitives: the lease lives in a hash
//! with a `PEXPIRE` TTL, and each of the three adapter operations is one
//! Lua script, so the check and the write execute atomically server-side
//! in a single round trip. The per-key fencing counter is a separate
//! non-expiring key bumped with `INCR` inside the create script, which
//! keeps fencing tokens strictly increasing across lease expiry and
//! deletion.
//!
//! ## Key layout
//! - `{prefix}{lock_key}` — lease hash: `owner`, `fence`, `lease_ms`,
//!   `metadata` (JSON); TTL = lease duration
//! - `{prefix}{lock_key}:fence` — fencing counter, never expires
//!
//! Transport errors map to `LockError::StoreUnavailable`; the
//! [`ConnectionManager`] reconnects on its own underneath.

use crate::error::{LockError, LockResult};
use crate::fencing::FencingToken;
use crate::store::{LeaseRecord, LeaseStore, OwnerToken};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Script;
use std::collections::HashMap;
use std::time::Duration;
use tracing::instrument;

/// Creates the lease only if absent. Returns `{fence, ''}` on success and
/// `{-1, holder}` on conflict.
const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return {-1, redis.call('HGET', KEYS[1], 'owner')}
end
local fence = redis.call('INCR', KEYS[2])
redis.call('HSET', KEYS[1], 'owner', ARGV[1], 'fence', fence, 'lease_ms', ARGV[2], 'metadata', ARGV[3])
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return {fence, ''}
"#;

/// Extends the TTL only when the stored owner matches.
/// Returns 1 on success, -1 on owner mismatch, -2 when absent.
const EXTEND_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return -2
end
if redis.call('HGET', KEYS[1], 'owner') ~= ARGV[1] then
  return -1
end
redis.call('HSET', KEYS[1], 'lease_ms', ARGV[2])
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return 1
"#;

/// Deletes the lease only when the stored owner matches.
/// Returns 1 on success, -1 on owner mismatch, -2 when absent.
const DELETE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return -2
end
if redis.call('HGET', KEYS[1], 'owner') ~= ARGV[1] then
  return -1
end
redis.call('DEL', KEYS[1])
return 1
"#;

const DEFAULT_KEY_PREFIX: &str = "plexlease:";

/// Redis implementation of [`LeaseStore`].
#[derive(Clone)]
pub struct RedisLeaseStore {
    conn: ConnectionManager,
    key_prefix: String,
    create_script: Script,
    extend_script: Script,
    delete_script: Script,
}

impl RedisLeaseStore {
    /// Connect with the default key prefix.
    ///
    /// Example URLs:
    /// - `redis://127.0.0.1/`
    /// - `rediss://host:6379/`
    pub async fn new(redis_url: &str) -> LockResult<Self> {
        Self::with_prefix(redis_url, DEFAULT_KEY_PREFIX).await
    }

    /// Connect with an explicit key prefix (one prefix per application
    /// keeps lease keys out of foreign keyspaces).
    pub async fn with_prefix(redis_url: &str, key_prefix: &str) -> LockResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| LockError::StoreUnavailable(format!("failed to create redis client: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| LockError::StoreUnavailable(format!("failed to connect redis: {e}")))?;
        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
            create_script: Script::new(CREATE_SCRIPT),
            extend_script: Script::new(EXTEND_SCRIPT),
            delete_script: Script::new(DELETE_SCRIPT),
        })
    }

    fn lease_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn fence_key(&self, key: &str) -> String {
        format!("{}{}:fence", self.key_prefix, key)
    }

    /// PEXPIRE rejects zero, so grant at least one millisecond.
    fn ttl_millis(ttl: Duration) -> u64 {
        (ttl.as_millis() as u64).max(1)
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    #[instrument(skip(self, owner, metadata), fields(lock_key = %key))]
    async fn try_create(
        &self,
        key: &str,
        owner: &OwnerToken,
        ttl: Duration,
        metadata: &HashMap<String, String>,
    ) -> LockResult<FencingToken> {
        let metadata_json = serde_json::to_string(metadata)
            .map_err(|e| LockError::StoreUnavailable(format!("encode metadata: {e}")))?;

        let mut conn = self.conn.clone();
        let (code, holder): (i64, String) = self
            .create_script
            .key(self.lease_key(key))
            .key(self.fence_key(key))
            .arg(owner.as_str())
            .arg(Self::ttl_millis(ttl))
            .arg(metadata_json)
            .invoke_async(&mut conn)
            .await?;

        if code == -1 {
            return Err(LockError::Busy { holder });
        }
        Ok(FencingToken::new(code as u64))
    }

    #[instrument(skip(self, owner), fields(lock_key = %key))]
    async fn try_extend(&self, key: &str, owner: &OwnerToken, new_ttl: Duration) -> LockResult<()> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .extend_script
            .key(self.lease_key(key))
            .arg(owner.as_str())
            .arg(Self::ttl_millis(new_ttl))
            .invoke_async(&mut conn)
            .await?;

        match code {
            1 => Ok(()),
            -1 => Err(LockError::NotOwner { lock_key: key.to_string() }),
            _ => Err(LockError::NotFound(key.to_string())),
        }
    }

    #[instrument(skip(self, owner), fields(lock_key = %key))]
    async fn try_delete(&self, key: &str, owner: &OwnerToken) -> LockResult<()> {
        let mut conn = self.conn.clone();
        let code: i64 = self
            .delete_script
            .key(self.lease_key(key))
            .arg(owner.as_str())
            .invoke_async(&mut conn)
            .await?;

        match code {
            1 => Ok(()),
            -1 => Err(LockError::NotOwner { lock_key: key.to_string() }),
            _ => Err(LockError::NotFound(key.to_string())),
        }
    }

    #[instrument(skip(self), fields(lock_key = %key))]
    async fn get(&self, key: &str) -> LockResult<Option<LeaseRecord>> {
        let lease_key = self.lease_key(key);
        let mut conn = self.conn.clone();
        let (fields, pttl_ms): (HashMap<String, String>, i64) = redis::pipe()
            .atomic()
            .cmd("HGETALL")
            .arg(&lease_key)
            .cmd("PTTL")
            .arg(&lease_key)
            .query_async(&mut conn)
            .await?;

        if fields.is_empty() || pttl_ms < 0 {
            return Ok(None);
        }

        let owner = fields
            .get("owner")
            .cloned()
            .ok_or_else(|| LockError::StoreUnavailable("lease record missing owner".to_string()))?;
        let fence = fields
            .get("fence")
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| LockError::StoreUnavailable("lease record missing fence".to_string()))?;
        let lease_ms = fields.get("lease_ms").and_then(|v| v.parse::<u64>().ok()).unwrap_or(0);
        let metadata: HashMap<String, String> = fields
            .get("metadata")
            .filter(|json| !json.is_empty())
            .and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default();

        Ok(Some(LeaseRecord {
            lock_key: key.to_string(),
            owner_token: OwnerToken::from_raw(owner),
            fencing_token: FencingToken::new(fence),
            expires_at: Utc::now() + chrono::Duration::milliseconds(pttl_ms),
            lease_duration: Duration::from_millis(lease_ms),
            metadata,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        // No live server needed for key formatting.
        let prefix = "app:";
        assert_eq!(format!("{}{}", prefix, "resource-A"), "app:resource-A");
        assert_eq!(format!("{}{}:fence", prefix, "resource-A"), "app:resource-A:fence");
    }

    #[test]
    fn test_ttl_millis_floor() {
        assert_eq!(RedisLeaseStore::ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(RedisLeaseStore::ttl_millis(Duration::from_millis(250)), 250);
    }
}
