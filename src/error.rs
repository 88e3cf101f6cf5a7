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

//! Error types for lease and lock operations.
//!
//! Contention (`Busy`) and deadline expiry (`TimedOut`) are expected
//! outcomes, not exceptional ones; callers match on the variant and pick a
//! backoff or alerting policy per kind. Only `StoreUnavailable` is ever
//! retried automatically.

use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors that can occur during lease and lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// Lock currently held by another owner
    #[error("Lock busy: held by {holder}")]
    Busy {
        /// Owner token of the current holder.
        holder: String,
    },

    /// Acquisition deadline passed before the lock became free
    #[error("Lock acquisition timed out for {lock_key} after {waited_ms}ms")]
    TimedOut {
        /// Key the acquisition was waiting on.
        lock_key: String,
        /// How long the caller waited before giving up.
        waited_ms: u64,
    },

    /// A mutation was attempted with a stale or incorrect owner token.
    ///
    /// This is a logic error or a lost lease that was re-acquired by someone
    /// else. It is never retried: retrying a mutual-exclusion violation is
    /// itself a bug.
    #[error("Not the lease owner for {lock_key}")]
    NotOwner {
        /// Key the mutation targeted.
        lock_key: String,
    },

    /// Lease record absent (expired or never existed)
    #[error("Lease not found: {0}")]
    NotFound(String),

    /// The handle's lease lapsed before it could be renewed
    #[error("Lease expired: {0}")]
    Expired(String),

    /// Transient infrastructure fault talking to the store
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Invalid key, TTL, or interval combination
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl LockError {
    /// Whether this error is a transient infrastructure fault that may be
    /// retried (bounded, jittered). Ownership and logic faults are never
    /// transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, LockError::StoreUnavailable(_))
    }

    /// Whether this error reports contention rather than a fault.
    pub fn is_busy(&self) -> bool {
        matches!(self, LockError::Busy { .. })
    }
}

#[cfg(feature = "redis-backend")]
impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        LockError::StoreUnavailable(format!("Redis error: {}", err))
    }
}
