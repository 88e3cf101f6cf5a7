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

//! Redis lease store integration tests.
//!
//! Requires a reachable Redis; set `PLEXLEASE_REDIS_URL` to override the
//! default `redis://127.0.0.1/`. Keys are ULID-suffixed so concurrent test
//! runs do not collide.

#[cfg(feature = "redis-backend")]
mod tests {
    use plexlease::{LockError, LeaseStore, LockService, OwnerToken, RedisLeaseStore};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::sleep;
    use ulid::Ulid;

    async fn create_store() -> RedisLeaseStore {
        let url = std::env::var("PLEXLEASE_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1/".to_string());
        RedisLeaseStore::with_prefix(&url, "plexlease-test:").await.unwrap()
    }

    fn unique_key(prefix: &str) -> String {
        format!("{}-{}", prefix, Ulid::new())
    }

    fn no_metadata() -> HashMap<String, String> {
        HashMap::new()
    }

    #[tokio::test]
    async fn test_redis_create_extend_delete_roundtrip() {
        let store = create_store().await;
        let key = unique_key("roundtrip");
        let owner = OwnerToken::generate();

        let fence = store
            .try_create(&key, &owner, Duration::from_secs(5), &no_metadata())
            .await
            .unwrap();
        assert!(fence.value() >= 1);

        let record = store.get(&key).await.unwrap().unwrap();
        assert_eq!(record.owner_token, owner);
        assert_eq!(record.fencing_token, fence);

        store.try_extend(&key, &owner, Duration::from_secs(10)).await.unwrap();
        store.try_delete(&key, &owner).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_redis_conflict_and_ownership_checks() {
        let store = create_store().await;
        let key = unique_key("conflict");
        let owner = OwnerToken::generate();
        store
            .try_create(&key, &owner, Duration::from_secs(5), &no_metadata())
            .await
            .unwrap();

        let intruder = OwnerToken::generate();
        assert!(matches!(
            store.try_create(&key, &intruder, Duration::from_secs(5), &no_metadata()).await,
            Err(LockError::Busy { .. })
        ));
        assert!(matches!(
            store.try_extend(&key, &intruder, Duration::from_secs(5)).await,
            Err(LockError::NotOwner { .. })
        ));
        assert!(matches!(
            store.try_delete(&key, &intruder).await,
            Err(LockError::NotOwner { .. })
        ));

        store.try_delete(&key, &owner).await.unwrap();
    }

    #[tokio::test]
    async fn test_redis_ttl_expiry_frees_key_and_fence_survives() {
        let store = create_store().await;
        let key = unique_key("expiry");
        let first = OwnerToken::generate();

        let fence1 = store
            .try_create(&key, &first, Duration::from_millis(150), &no_metadata())
            .await
            .unwrap();

        sleep(Duration::from_millis(250)).await;
        assert!(store.get(&key).await.unwrap().is_none());
        assert!(matches!(
            store.try_extend(&key, &first, Duration::from_secs(5)).await,
            Err(LockError::NotFound(_))
        ));

        let second = OwnerToken::generate();
        let fence2 = store
            .try_create(&key, &second, Duration::from_secs(5), &no_metadata())
            .await
            .unwrap();
        assert!(fence2 > fence1, "fencing counter must survive TTL expiry");

        store.try_delete(&key, &second).await.unwrap();
    }

    #[tokio::test]
    async fn test_redis_service_end_to_end() {
        let store = Arc::new(create_store().await);
        let service = LockService::new(store);
        let key = unique_key("service");

        let mut handle = service.try_acquire_once(&key, Duration::from_millis(600)).await.unwrap();

        // Renewals keep the lease alive well past its original TTL.
        sleep(Duration::from_millis(1200)).await;
        assert!(handle.is_live().await);

        service.release(&mut handle).await.unwrap();
        assert!(service.inspect(&key).await.unwrap().is_none());
    }
}
