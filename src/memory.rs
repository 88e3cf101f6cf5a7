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

//! In-memory lease store (for testing and single-process embedding).
//!
//! ## Limitations
//! - Not persistent (leases lost on restart)
//! - Not distributed (single process only)
//! - Lazy expiry: an expired record is treated as absent on access and
//!   removed the next time its key is touched, mimicking a TTL store

use crate::error::{LockError, LockResult};
use crate::fencing::FencingToken;
use crate::store::{LeaseRecord, LeaseStore, OwnerToken};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Default)]
struct MemoryInner {
    leases: HashMap<String, LeaseRecord>,
    /// Per-key fencing counters. Deliberately never removed, even when the
    /// lease is deleted: fencing tokens must stay strictly increasing
    /// across the whole history of a key.
    fence_counters: HashMap<String, u64>,
}

/// In-memory implementation of [`LeaseStore`].
#[derive(Clone, Default)]
pub struct MemoryLeaseStore {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryLeaseStore {
    /// Create an empty in-memory lease store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn try_create(
        &self,
        key: &str,
        owner: &OwnerToken,
        ttl: Duration,
        metadata: &HashMap<String, String>,
    ) -> LockResult<FencingToken> {
        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.leases.get(key) {
            if !existing.is_expired() {
                return Err(LockError::Busy { holder: existing.owner_token.to_string() });
            }
            // Expired record counts as absent.
            inner.leases.remove(key);
        }

        let counter = inner.fence_counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        let fence = FencingToken::new(*counter);

        let ttl_chrono = chrono::Duration::from_std(ttl)
            .map_err(|e| LockError::StoreUnavailable(format!("TTL out of range: {}", e)))?;
        inner.leases.insert(
            key.to_string(),
            LeaseRecord {
                lock_key: key.to_string(),
                owner_token: owner.clone(),
                fencing_token: fence,
                expires_at: Utc::now() + ttl_chrono,
                lease_duration: ttl,
                metadata: metadata.clone(),
            },
        );
        Ok(fence)
    }

    async fn try_extend(&self, key: &str, owner: &OwnerToken, new_ttl: Duration) -> LockResult<()> {
        let mut inner = self.inner.write().await;

        let expired = match inner.leases.get(key) {
            None => return Err(LockError::NotFound(key.to_string())),
            Some(existing) => existing.is_expired(),
        };
        if expired {
            inner.leases.remove(key);
            return Err(LockError::NotFound(key.to_string()));
        }

        match inner.leases.get_mut(key) {
            Some(existing) if existing.owner_token == *owner => {
                let ttl_chrono = chrono::Duration::from_std(new_ttl)
                    .map_err(|e| LockError::StoreUnavailable(format!("TTL out of range: {}", e)))?;
                existing.expires_at = Utc::now() + ttl_chrono;
                existing.lease_duration = new_ttl;
                Ok(())
            }
            Some(_) => Err(LockError::NotOwner { lock_key: key.to_string() }),
            None => Err(LockError::NotFound(key.to_string())),
        }
    }

    async fn try_delete(&self, key: &str, owner: &OwnerToken) -> LockResult<()> {
        let mut inner = self.inner.write().await;

        let expired = match inner.leases.get(key) {
            None => return Err(LockError::NotFound(key.to_string())),
            Some(existing) => existing.is_expired(),
        };
        if expired {
            inner.leases.remove(key);
            return Err(LockError::NotFound(key.to_string()));
        }

        let owned = match inner.leases.get(key) {
            Some(existing) => existing.owner_token == *owner,
            None => return Err(LockError::NotFound(key.to_string())),
        };
        if !owned {
            return Err(LockError::NotOwner { lock_key: key.to_string() });
        }
        inner.leases.remove(key);
        Ok(())
    }

    async fn get(&self, key: &str) -> LockResult<Option<LeaseRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.leases.get(key).filter(|record| !record.is_expired()).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_metadata() -> HashMap<String, String> {
        HashMap::new()
    }

    #[tokio::test]
    async fn test_create_issues_first_fencing_token() {
        let store = MemoryLeaseStore::new();
        let owner = OwnerToken::generate();

        let fence = store
            .try_create("test-lock", &owner, Duration::from_secs(30), &no_metadata())
            .await
            .unwrap();
        assert_eq!(fence.value(), 1);

        let record = store.get("test-lock").await.unwrap().unwrap();
        assert_eq!(record.owner_token, owner);
        assert_eq!(record.fencing_token, fence);
        assert!(!record.is_expired());
    }

    #[tokio::test]
    async fn test_create_conflicts_while_lease_live() {
        let store = MemoryLeaseStore::new();
        let first = OwnerToken::generate();
        store
            .try_create("test-lock", &first, Duration::from_secs(30), &no_metadata())
            .await
            .unwrap();

        let second = OwnerToken::generate();
        let result = store
            .try_create("test-lock", &second, Duration::from_secs(30), &no_metadata())
            .await;
        match result {
            Err(LockError::Busy { holder }) => assert_eq!(holder, first.to_string()),
            other => panic!("expected Busy, got {:?}", other.map(|f| f.value())),
        }
    }

    #[tokio::test]
    async fn test_create_succeeds_after_expiry() {
        let store = MemoryLeaseStore::new();
        let first = OwnerToken::generate();
        store
            .try_create("test-lock", &first, Duration::from_millis(50), &no_metadata())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        let second = OwnerToken::generate();
        let fence = store
            .try_create("test-lock", &second, Duration::from_secs(30), &no_metadata())
            .await
            .unwrap();
        assert_eq!(fence.value(), 2, "fencing counter survives expiry");
    }

    #[tokio::test]
    async fn test_fencing_tokens_strictly_increase() {
        let store = MemoryLeaseStore::new();
        let mut last = 0;
        for _ in 0..5 {
            let owner = OwnerToken::generate();
            let fence = store
                .try_create("test-lock", &owner, Duration::from_secs(30), &no_metadata())
                .await
                .unwrap();
            assert!(fence.value() > last);
            last = fence.value();
            store.try_delete("test-lock", &owner).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_extend_moves_expiry() {
        let store = MemoryLeaseStore::new();
        let owner = OwnerToken::generate();
        store
            .try_create("test-lock", &owner, Duration::from_millis(200), &no_metadata())
            .await
            .unwrap();

        let before = store.get("test-lock").await.unwrap().unwrap().expires_at;
        store.try_extend("test-lock", &owner, Duration::from_secs(30)).await.unwrap();
        let after = store.get("test-lock").await.unwrap().unwrap().expires_at;
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_extend_rejects_wrong_owner() {
        let store = MemoryLeaseStore::new();
        let owner = OwnerToken::generate();
        store
            .try_create("test-lock", &owner, Duration::from_secs(30), &no_metadata())
            .await
            .unwrap();

        let intruder = OwnerToken::generate();
        let result = store.try_extend("test-lock", &intruder, Duration::from_secs(30)).await;
        assert!(matches!(result, Err(LockError::NotOwner { .. })));

        // No mutation on failure.
        let record = store.get("test-lock").await.unwrap().unwrap();
        assert_eq!(record.owner_token, owner);
    }

    #[tokio::test]
    async fn test_extend_after_expiry_reports_not_found() {
        let store = MemoryLeaseStore::new();
        let owner = OwnerToken::generate();
        store
            .try_create("test-lock", &owner, Duration::from_millis(50), &no_metadata())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        let result = store.try_extend("test-lock", &owner, Duration::from_secs(30)).await;
        assert!(matches!(result, Err(LockError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_extend_missing_key_reports_not_found() {
        let store = MemoryLeaseStore::new();
        let owner = OwnerToken::generate();
        let result = store.try_extend("absent", &owner, Duration::from_secs(30)).await;
        assert!(matches!(result, Err(LockError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_requires_ownership() {
        let store = MemoryLeaseStore::new();
        let owner = OwnerToken::generate();
        store
            .try_create("test-lock", &owner, Duration::from_secs(30), &no_metadata())
            .await
            .unwrap();

        let intruder = OwnerToken::generate();
        assert!(matches!(
            store.try_delete("test-lock", &intruder).await,
            Err(LockError::NotOwner { .. })
        ));
        assert!(store.get("test-lock").await.unwrap().is_some());

        store.try_delete("test-lock", &owner).await.unwrap();
        assert!(store.get("test-lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_key_reports_not_found() {
        let store = MemoryLeaseStore::new();
        let owner = OwnerToken::generate();
        let result = store.try_delete("absent", &owner).await;
        assert!(matches!(result, Err(LockError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_get_hides_expired_record() {
        let store = MemoryLeaseStore::new();
        let owner = OwnerToken::generate();
        store
            .try_create("test-lock", &owner, Duration::from_millis(50), &no_metadata())
            .await
            .unwrap();

        assert!(store.get("test-lock").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(store.get("test-lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_metadata_stored_with_lease() {
        let store = MemoryLeaseStore::new();
        let owner = OwnerToken::generate();
        let mut metadata = HashMap::new();
        metadata.insert("host".to_string(), "node-1".to_string());

        store
            .try_create("test-lock", &owner, Duration::from_secs(30), &metadata)
            .await
            .unwrap();

        let record = store.get("test-lock").await.unwrap().unwrap();
        assert_eq!(record.metadata.get("host").map(String::as_str), Some("node-1"));
    }

    #[tokio::test]
    async fn test_concurrent_creates_admit_exactly_one() {
        let store = Arc::new(MemoryLeaseStore::new());
        let mut handles = vec![];
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let owner = OwnerToken::generate();
                store
                    .try_create("contended", &owner, Duration::from_secs(30), &HashMap::new())
                    .await
            }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        assert_eq!(successes, 1);
    }

    #[tokio::test]
    async fn test_independent_keys_do_not_interfere() {
        let store = MemoryLeaseStore::new();
        let a = OwnerToken::generate();
        let b = OwnerToken::generate();

        let fence_a =
            store.try_create("lock-a", &a, Duration::from_secs(30), &no_metadata()).await.unwrap();
        let fence_b =
            store.try_create("lock-b", &b, Duration::from_secs(30), &no_metadata()).await.unwrap();

        // Counters are per key.
        assert_eq!(fence_a.value(), 1);
        assert_eq!(fence_b.value(), 1);
    }
}
