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

//! Lock acquisition protocol and release logic.
//!
//! ## Purpose
//! [`LockService`] is the caller-facing surface: three acquisition modes
//! built on the store's atomic `try_create`, plus ownership-checked
//! release. Every successful acquisition spawns a renewal watchdog and
//! returns a [`LockHandle`] carrying a fresh owner token and fencing token.
//!
//! ## Acquisition modes
//! - [`try_acquire_once`](LockService::try_acquire_once): single attempt,
//!   no retry; contention surfaces as `Busy`.
//! - [`acquire_with_timeout`](LockService::acquire_with_timeout): retries
//!   with full jitter (uniform in `[0, retry_interval]`, so a crowd of
//!   waiters released by one event does not retry in lockstep) until
//!   `max_wait` elapses; then `TimedOut`. A `max_wait` of zero is
//!   equivalent to a single attempt.
//! - [`acquire_blocking`](LockService::acquire_blocking): retries until
//!   acquired; cancellation is cooperative — dropping the future stops the
//!   retry loop at its next suspension point without leaking anything.
//!
//! ## Timeout race
//! If a retry wins the lock only after the deadline has already passed,
//! the just-created lease is deleted immediately and the call reports
//! `TimedOut`: a timed-out acquisition never leaves a lease record behind.

use crate::error::{LockError, LockResult};
use crate::handle::{HandleShared, LockHandle, RenewalState};
use crate::store::{LeaseStore, OwnerToken};
use crate::watchdog::{self, WatchdogParams, jittered};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{info, instrument, warn};

/// Default retry cadence for waiting acquisitions.
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Tuning knobs for the service and its renewal watchdogs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Renewal cadence as a fraction of TTL (interval = ttl / divisor).
    /// Must be at least 2 so two renewal attempts fit in one lease
    /// lifetime; the default of 3 tolerates one transient failure without
    /// losing ownership.
    pub renewal_divisor: u32,

    /// Fixed renewal interval overriding the divisor. Must be shorter than
    /// the TTL of every lock acquired through this service.
    pub renewal_interval: Option<Duration>,

    /// Floor for the renewal cadence; TTLs whose derived interval falls
    /// below this are rejected at acquisition instead of producing a lock
    /// that expires before its first renewal.
    pub min_renewal_interval: Duration,

    /// Bounded retry attempts per renewal for transient store faults.
    pub renew_retry_limit: u32,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            renewal_divisor: 3,
            renewal_interval: None,
            min_renewal_interval: Duration::from_millis(10),
            renew_retry_limit: 3,
        }
    }
}

/// Options for one acquisition.
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// Key identifying the protected resource. Must be non-empty.
    pub lock_key: String,
    /// Lease duration.
    pub ttl: Duration,
    /// How long to keep retrying. `None` means a single attempt.
    pub max_wait: Option<Duration>,
    /// Base retry cadence; actual delays are jittered in `[0, interval]`.
    pub retry_interval: Duration,
    /// Diagnostic tags stored with the lease (holder host, purpose, ...).
    pub metadata: HashMap<String, String>,
}

impl AcquireOptions {
    /// Single-attempt options for `key` with the given lease duration.
    pub fn new(lock_key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            lock_key: lock_key.into(),
            ttl,
            max_wait: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            metadata: HashMap::new(),
        }
    }

    /// Keep retrying for up to `max_wait`.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// Base retry cadence for waiting modes.
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    /// Attach a diagnostic tag to the lease record.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Outcome of a release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The lease was deleted; the key is free.
    Released,
    /// The handle was already released; no-op.
    AlreadyReleased,
    /// The lease had already expired (or was re-acquired by another
    /// holder) before release: the caller's mutual-exclusion guarantee was
    /// lost at some earlier point. Surfaced, never swallowed.
    AlreadyExpired,
}

/// Lease-based distributed lock service.
///
/// ## Example
/// ```rust,no_run
/// use plexlease::{LockService, MemoryLeaseStore};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let service = LockService::new(Arc::new(MemoryLeaseStore::new()));
///
/// let mut handle = service
///     .try_acquire_once("orders:reconcile", Duration::from_secs(30))
///     .await?;
///
/// // Attach handle.fencing_token() to every write this lock protects.
/// service.release(&mut handle).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct LockService {
    store: Arc<dyn LeaseStore>,
    config: LockConfig,
}

impl LockService {
    /// Create a service over `store` with default configuration.
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self::with_config(store, LockConfig::default())
    }

    /// Create a service with explicit configuration.
    pub fn with_config(store: Arc<dyn LeaseStore>, config: LockConfig) -> Self {
        Self { store, config }
    }

    /// Single acquisition attempt, no retry.
    ///
    /// ## Returns
    /// - `Ok(LockHandle)`: lock acquired, watchdog running
    /// - `Err(LockError::Busy)`: held by another owner
    /// - `Err(LockError::StoreUnavailable)`: store fault, caller decides
    /// - `Err(LockError::InvalidConfig)`: bad key/TTL combination
    pub async fn try_acquire_once(&self, lock_key: &str, ttl: Duration) -> LockResult<LockHandle> {
        self.acquire(AcquireOptions::new(lock_key, ttl)).await
    }

    /// Retry until acquired or `max_wait` elapses.
    ///
    /// Retries are jittered uniformly in `[0, retry_interval]`. A
    /// `max_wait` of zero performs exactly one attempt.
    pub async fn acquire_with_timeout(
        &self,
        lock_key: &str,
        ttl: Duration,
        max_wait: Duration,
        retry_interval: Duration,
    ) -> LockResult<LockHandle> {
        self.acquire(
            AcquireOptions::new(lock_key, ttl)
                .with_max_wait(max_wait)
                .with_retry_interval(retry_interval),
        )
        .await
    }

    /// Retry indefinitely until acquired.
    ///
    /// Cancellation is cooperative: dropping the returned future abandons
    /// the wait at its next suspension point. (If cancellation lands while
    /// a create is in flight, an orphan lease may be written; it is never
    /// renewed and lapses via the store TTL.)
    #[instrument(skip(self, ttl), fields(lock_key = %lock_key))]
    pub async fn acquire_blocking(&self, lock_key: &str, ttl: Duration) -> LockResult<LockHandle> {
        let options = AcquireOptions::new(lock_key, ttl);
        let interval = self.validate(&options)?;
        loop {
            match self.attempt_create(&options).await {
                Ok((owner, fence)) => return Ok(self.commit(&options, owner, fence, interval)),
                Err(err) if err.is_busy() => {}
                Err(err) if err.is_transient() => {
                    warn!(lock_key = %options.lock_key, error = %err, "store fault during blocking acquisition, retrying");
                }
                Err(err) => return Err(err),
            }
            sleep(jittered(options.retry_interval)).await;
        }
    }

    /// Acquire with full control over options.
    #[instrument(skip(self, options), fields(lock_key = %options.lock_key))]
    pub async fn acquire(&self, options: AcquireOptions) -> LockResult<LockHandle> {
        let interval = self.validate(&options)?;
        let start = Instant::now();

        let max_wait = match options.max_wait {
            None => return self.acquire_once_inner(&options, interval).await,
            Some(max_wait) if max_wait.is_zero() => {
                return self.acquire_once_inner(&options, interval).await;
            }
            Some(max_wait) => max_wait,
        };
        if options.retry_interval.is_zero() {
            return Err(LockError::InvalidConfig(
                "retry interval must be positive for waiting acquisition".to_string(),
            ));
        }

        let deadline = start + max_wait;
        let mut saw_busy = false;
        let mut last_store_fault: Option<LockError> = None;
        loop {
            match self.attempt_create(&options).await {
                Ok((owner, fence)) => {
                    if Instant::now() >= deadline {
                        // Won the race only after the caller's deadline:
                        // roll back so a timed-out acquisition leaves no
                        // lease behind.
                        if let Err(err) = self.store.try_delete(&options.lock_key, &owner).await {
                            warn!(
                                lock_key = %options.lock_key,
                                error = %err,
                                "failed to roll back post-deadline acquisition, lease will lapse via TTL"
                            );
                        }
                        return Err(self.timed_out(&options, start));
                    }
                    return Ok(self.commit(&options, owner, fence, interval));
                }
                Err(err) if err.is_busy() => saw_busy = true,
                Err(err) if err.is_transient() => last_store_fault = Some(err),
                Err(err) => return Err(err),
            }

            let now = Instant::now();
            if now >= deadline {
                // Distinguish "stayed busy" from "store was down the whole
                // time" so callers can apply different alerting policies.
                return match (saw_busy, last_store_fault) {
                    (false, Some(fault)) => {
                        metrics::counter!("plexlease_acquire_total", "result" => "store_unavailable")
                            .increment(1);
                        Err(fault)
                    }
                    _ => Err(self.timed_out(&options, start)),
                };
            }
            let delay = jittered(options.retry_interval).min(deadline - now);
            sleep(delay).await;
        }
    }

    /// Release a held lock.
    ///
    /// Stops the renewal watchdog first, then deletes the lease with an
    /// ownership check. Safe to call more than once.
    #[instrument(skip(self, handle), fields(lock_key = %handle.lock_key()))]
    pub async fn release(&self, handle: &mut LockHandle) -> LockResult<ReleaseOutcome> {
        match handle.state().await {
            RenewalState::Released => return Ok(ReleaseOutcome::AlreadyReleased),
            RenewalState::Expired => return Ok(ReleaseOutcome::AlreadyExpired),
            RenewalState::Held | RenewalState::Renewing => {}
        }

        // Stop scheduling renewals before touching the store so a racing
        // renewal cannot re-extend a lease the caller no longer wants.
        handle.stop_watchdog();

        match self.store.try_delete(handle.lock_key(), handle.owner_token()).await {
            Ok(()) => {
                handle.shared.set_state(RenewalState::Released).await;
                metrics::counter!("plexlease_release_total", "result" => "released").increment(1);
                info!(fencing_token = %handle.fencing_token(), "lock released");
                Ok(ReleaseOutcome::Released)
            }
            Err(LockError::NotFound(_)) => {
                handle.shared.set_state(RenewalState::Expired).await;
                metrics::counter!("plexlease_release_total", "result" => "already_expired")
                    .increment(1);
                warn!("lease already expired at release, mutual exclusion was lost earlier");
                Ok(ReleaseOutcome::AlreadyExpired)
            }
            Err(LockError::NotOwner { .. }) => {
                handle.shared.set_state(RenewalState::Expired).await;
                metrics::counter!("plexlease_release_total", "result" => "already_expired")
                    .increment(1);
                warn!("lease re-acquired by another holder before release");
                Ok(ReleaseOutcome::AlreadyExpired)
            }
            // Store fault: state is unchanged so the caller may retry;
            // even unreleased, the lease lapses via TTL once the watchdog
            // is stopped.
            Err(err) => Err(err),
        }
    }

    /// Diagnostic read of the current lease for `key`.
    pub async fn inspect(&self, lock_key: &str) -> LockResult<Option<crate::store::LeaseRecord>> {
        self.store.get(lock_key).await
    }

    async fn acquire_once_inner(
        &self,
        options: &AcquireOptions,
        interval: Duration,
    ) -> LockResult<LockHandle> {
        match self.attempt_create(options).await {
            Ok((owner, fence)) => Ok(self.commit(options, owner, fence, interval)),
            Err(err) => {
                let result = if err.is_busy() { "busy" } else { "error" };
                metrics::counter!("plexlease_acquire_total", "result" => result).increment(1);
                Err(err)
            }
        }
    }

    /// One `try_create` under a fresh owner token. Tokens are never reused
    /// across attempts, so a delayed response from an abandoned attempt can
    /// never be confused with a newer acquisition.
    async fn attempt_create(
        &self,
        options: &AcquireOptions,
    ) -> LockResult<(OwnerToken, crate::FencingToken)> {
        let owner = OwnerToken::generate();
        let fence = self
            .store
            .try_create(&options.lock_key, &owner, options.ttl, &options.metadata)
            .await?;
        Ok((owner, fence))
    }

    fn commit(
        &self,
        options: &AcquireOptions,
        owner: OwnerToken,
        fence: crate::FencingToken,
        interval: Duration,
    ) -> LockHandle {
        let shared = Arc::new(HandleShared::new());
        let task = watchdog::spawn(
            self.store.clone(),
            WatchdogParams {
                lock_key: options.lock_key.clone(),
                owner_token: owner.clone(),
                ttl: options.ttl,
                interval,
                retry_limit: self.config.renew_retry_limit,
            },
            shared.clone(),
        );
        metrics::counter!("plexlease_acquire_total", "result" => "acquired").increment(1);
        info!(
            lock_key = %options.lock_key,
            fencing_token = %fence,
            ttl_ms = options.ttl.as_millis() as u64,
            "lock acquired"
        );
        LockHandle::new(options.lock_key.clone(), owner, fence, options.ttl, shared, task)
    }

    /// Validate key and TTL; returns the renewal interval for the lease.
    fn validate(&self, options: &AcquireOptions) -> LockResult<Duration> {
        if options.lock_key.is_empty() {
            return Err(LockError::InvalidConfig("lock key must be non-empty".to_string()));
        }
        if options.ttl.is_zero() {
            return Err(LockError::InvalidConfig("lease TTL must be positive".to_string()));
        }
        if self.config.renewal_divisor < 2 {
            return Err(LockError::InvalidConfig(
                "renewal divisor must be at least 2".to_string(),
            ));
        }

        let interval = self
            .config
            .renewal_interval
            .unwrap_or(options.ttl / self.config.renewal_divisor);
        if interval >= options.ttl {
            return Err(LockError::InvalidConfig(format!(
                "renewal interval {}ms must be shorter than TTL {}ms",
                interval.as_millis(),
                options.ttl.as_millis()
            )));
        }
        if interval < self.config.min_renewal_interval {
            // A lock that cannot be renewed before it expires is a
            // configuration error, not a lock.
            return Err(LockError::InvalidConfig(format!(
                "TTL {}ms is too short for the renewal cadence (minimum interval {}ms)",
                options.ttl.as_millis(),
                self.config.min_renewal_interval.as_millis()
            )));
        }
        Ok(interval)
    }

    fn timed_out(&self, options: &AcquireOptions, start: Instant) -> LockError {
        metrics::counter!("plexlease_acquire_total", "result" => "timed_out").increment(1);
        LockError::TimedOut {
            lock_key: options.lock_key.clone(),
            waited_ms: start.elapsed().as_millis() as u64,
        }
    }
}
