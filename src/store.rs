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

//! Lease store adapter trait for the external consistent store.
//!
//! ## Purpose
//! The store is the single authoritative record of who holds a lock. All
//! mutation goes through three atomic conditional operations; no client
//! ever reads-then-writes a lease non-atomically, and no process-local map
//! is treated as authoritative.
//!
//! ## Contract
//! Each mutating operation is a single round-trip, read-modify-write atomic
//! operation (conditional write, Lua script, or equivalent transaction).
//! Partial failure — check succeeds, write fails — is not acceptable; a
//! backend that cannot guarantee atomicity must fail closed (report the
//! lease as held / not owned) rather than risk double ownership.

use crate::error::LockResult;
use crate::fencing::FencingToken;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use ulid::Ulid;

/// Unique identifier for one acquisition attempt.
///
/// Generated fresh (ULID, 128-bit) for every attempt and never reused, even
/// by the same process for the same key. A delayed release or renewal
/// carrying an old token can therefore never affect a newer holder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerToken(String);

impl OwnerToken {
    /// Generate a fresh owner token.
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// Rehydrate a token read back from a store.
    ///
    /// Only backends reconstructing a [`LeaseRecord`] should use this;
    /// acquisition paths always [`generate`](Self::generate) fresh tokens.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Token as a string slice, for store-side comparison.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lease record as stored externally.
///
/// Created on successful acquisition, extended only by the owner holding
/// the matching [`OwnerToken`], removed by ownership-checked delete or by
/// the store's TTL when renewals stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Key identifying the protected resource.
    pub lock_key: String,
    /// Owner token of the current holder.
    pub owner_token: OwnerToken,
    /// Fencing token issued for this acquisition.
    pub fencing_token: FencingToken,
    /// When the lease expires unless renewed.
    pub expires_at: DateTime<Utc>,
    /// Lease duration granted at acquisition or last renewal.
    pub lease_duration: Duration,
    /// Caller-supplied diagnostic tags (holder host, purpose, ...).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl LeaseRecord {
    /// Whether the lease has passed its expiry.
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Remaining lease time, zero if already expired.
    pub fn remaining(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Adapter to the external consistent key-value store.
///
/// ## Behavior
/// - `try_create`: create the lease only if absent (expired records count
///   as absent); on success returns a freshly incremented fencing token,
///   strictly greater than any token previously issued for the key. On
///   conflict fails with `Busy` and has no side effects.
/// - `try_extend`: extend the expiry only if the stored owner token
///   matches; fails with `NotOwner` / `NotFound` without mutation.
/// - `try_delete`: delete only if the stored owner token matches; same
///   failure taxonomy as `try_extend`.
/// - `get`: diagnostic read of the current record; never used for
///   ownership decisions.
///
/// Transport faults surface as `LockError::StoreUnavailable`.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Atomically create a lease for `key` if none is live.
    async fn try_create(
        &self,
        key: &str,
        owner: &OwnerToken,
        ttl: Duration,
        metadata: &HashMap<String, String>,
    ) -> LockResult<FencingToken>;

    /// Atomically extend the lease expiry to now + `new_ttl` if `owner`
    /// still holds it.
    async fn try_extend(&self, key: &str, owner: &OwnerToken, new_ttl: Duration) -> LockResult<()>;

    /// Atomically delete the lease if `owner` still holds it.
    async fn try_delete(&self, key: &str, owner: &OwnerToken) -> LockResult<()>;

    /// Current lease record for `key`, if one is live.
    async fn get(&self, key: &str) -> LockResult<Option<LeaseRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_tokens_are_unique() {
        let a = OwnerToken::generate();
        let b = OwnerToken::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 26); // ULID canonical encoding
    }

    #[test]
    fn test_record_expiry() {
        let live = LeaseRecord {
            lock_key: "k".into(),
            owner_token: OwnerToken::generate(),
            fencing_token: FencingToken::new(1),
            expires_at: Utc::now() + chrono::Duration::seconds(30),
            lease_duration: Duration::from_secs(30),
            metadata: HashMap::new(),
        };
        assert!(!live.is_expired());
        assert!(live.remaining() > Duration::from_secs(25));

        let dead = LeaseRecord { expires_at: Utc::now() - chrono::Duration::seconds(1), ..live };
        assert!(dead.is_expired());
        assert_eq!(dead.remaining(), Duration::ZERO);
    }
}
