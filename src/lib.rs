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

//! # PlexLease — Lease-Based Distributed Locks
//!
//! ## Purpose
//! Lets many independent processes coordinate mutually-exclusive access to
//! a named resource, backed by a single consistent external key-value
//! store with atomic conditional writes and TTL expiry. Each acquisition
//! gets a lease: a time-bounded grant of exclusive ownership that expires
//! automatically unless renewed.
//!
//! ## Design Decisions
//! - **Store-backed ownership**: the external lease record is the only
//!   authoritative state; no process-local registry is trusted
//! - **Fresh owner token per attempt**: a delayed or stale release can
//!   never affect a newer holder
//! - **Fencing tokens**: a per-key monotonic counter lets downstream
//!   resources reject writes from holders whose lease has lapsed, even
//!   across long process pauses
//! - **Watchdog renewal**: one lightweight task per held lock renews at a
//!   fraction of TTL and actively notifies the owner when the lease is
//!   lost
//! - **Clock-skew independence**: correctness rests on the store's atomic
//!   conditional operations, never on synchronized wall clocks
//!
//! ## Backend Support
//! - **InMemory**: HashMap-based (always available, for testing)
//! - **Redis**: distributed, Lua-scripted atomic operations with native
//!   TTL (feature: `redis-backend`)
//!
//! ## Examples
//!
//! ```rust,no_run
//! use plexlease::{LockService, MemoryLeaseStore};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let service = LockService::new(Arc::new(MemoryLeaseStore::new()));
//!
//! // Wait up to 5s for the lock, retrying with jitter every ~100ms.
//! let mut handle = service
//!     .acquire_with_timeout(
//!         "billing:settlement",
//!         Duration::from_secs(30),
//!         Duration::from_secs(5),
//!         Duration::from_millis(100),
//!     )
//!     .await?;
//!
//! // Every protected write must carry the fencing token so the resource
//! // can reject stale holders.
//! let fence = handle.fencing_token();
//! do_settlement_write(fence.value()).await;
//!
//! service.release(&mut handle).await?;
//! # Ok(())
//! # }
//! # async fn do_settlement_write(_fence: u64) {}
//! ```

pub mod error;
pub mod fencing;
pub mod handle;
pub mod service;
pub mod store;

mod watchdog;

#[cfg(feature = "memory-backend")]
pub mod memory;

#[cfg(feature = "redis-backend")]
pub mod redis;

pub use error::{LockError, LockResult};
pub use fencing::{FencingGuard, FencingToken};
pub use handle::{ExpiryListener, LockHandle, RenewalState};
pub use service::{AcquireOptions, LockConfig, LockService, ReleaseOutcome};
pub use store::{LeaseRecord, LeaseStore, OwnerToken};

#[cfg(feature = "memory-backend")]
pub use memory::MemoryLeaseStore;

#[cfg(feature = "redis-backend")]
pub use redis::RedisLeaseStore;
