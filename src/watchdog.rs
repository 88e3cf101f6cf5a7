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

//! Renewal watchdog: one lightweight task per held lock.
//!
//! ## Design
//! The watchdog extends an owned lease at a fraction of its TTL (default
//! TTL/3, so at least two renewal attempts fit within one lease lifetime
//! and a single transient failure does not lose ownership). Per renewal:
//!
//! - `Held → (timer fires) → Renewing → (extend ok) → Held`
//! - `Renewing → (NotOwner | NotFound) → Expired` — terminal, owner notified
//! - `Renewing → (store unreachable) → ` bounded jittered retries within the
//!   remaining TTL budget, then `Expired`
//!
//! `NotOwner` during renewal means another holder owns the lease — under
//! correct fencing this cannot happen, so it is treated as a fatal logic
//! error: logged, surfaced, never retried. `NotFound` means the lease
//! lapsed before the renewal landed. Both are terminal; the caller must
//! re-acquire from scratch.
//!
//! The watchdog stops scheduling immediately when the owner releases the
//! lock (shutdown is checked on every wait), so a renewal can never
//! silently re-extend a lock the caller thinks it no longer holds.

use crate::error::LockError;
use crate::handle::{HandleShared, RenewalState};
use crate::store::{LeaseStore, OwnerToken};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tracing::{debug, error, warn};

/// Parameters for one watchdog task.
pub(crate) struct WatchdogParams {
    pub lock_key: String,
    pub owner_token: OwnerToken,
    pub ttl: Duration,
    /// Renewal cadence, strictly less than `ttl`.
    pub interval: Duration,
    /// Bounded retry attempts per renewal for transient store faults.
    pub retry_limit: u32,
}

enum RenewOutcome {
    Renewed,
    /// Lease is gone; `&'static str` names the cause for logs/metrics.
    Lost(&'static str),
    /// Shutdown observed mid-renewal.
    Stopped,
}

/// Spawn the renewal task for a freshly acquired lease.
pub(crate) fn spawn(
    store: Arc<dyn LeaseStore>,
    params: WatchdogParams,
    shared: Arc<HandleShared>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        // The lease was created just before spawn, so the first deadline is
        // one full TTL out from here.
        let mut lease_deadline = Instant::now() + params.ttl;
        let mut ticker = interval_at(Instant::now() + params.interval, params.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shared.shutdown.notified() => {
                    debug!(lock_key = %params.lock_key, "renewal watchdog stopping");
                    return;
                }
                _ = ticker.tick() => {
                    shared.set_state(RenewalState::Renewing).await;
                    match renew(store.as_ref(), &params, &shared, lease_deadline).await {
                        RenewOutcome::Renewed => {
                            lease_deadline = Instant::now() + params.ttl;
                            shared.set_state(RenewalState::Held).await;
                            metrics::counter!("plexlease_renewals_total", "result" => "ok")
                                .increment(1);
                        }
                        RenewOutcome::Lost(cause) => {
                            shared.set_state(RenewalState::Expired).await;
                            metrics::counter!("plexlease_leases_expired_total", "cause" => cause)
                                .increment(1);
                            return;
                        }
                        RenewOutcome::Stopped => return,
                    }
                }
            }
        }
    })
}

/// One renewal, including bounded retry of transient store faults within
/// the remaining TTL budget.
async fn renew(
    store: &dyn LeaseStore,
    params: &WatchdogParams,
    shared: &HandleShared,
    lease_deadline: Instant,
) -> RenewOutcome {
    let mut attempts: u32 = 0;
    loop {
        match store.try_extend(&params.lock_key, &params.owner_token, params.ttl).await {
            Ok(()) => {
                debug!(lock_key = %params.lock_key, "lease renewed");
                return RenewOutcome::Renewed;
            }
            Err(LockError::NotOwner { .. }) => {
                // Impossible under correct fencing: our live lease is owned
                // by someone else. Surfaced, never retried.
                error!(
                    lock_key = %params.lock_key,
                    owner_token = %params.owner_token,
                    "renewal found lease owned by another holder, treating as fatal"
                );
                return RenewOutcome::Lost("not_owner");
            }
            Err(LockError::NotFound(_)) => {
                warn!(
                    lock_key = %params.lock_key,
                    "lease expired before renewal reached the store"
                );
                return RenewOutcome::Lost("not_found");
            }
            Err(err) if err.is_transient() => {
                attempts += 1;
                metrics::counter!("plexlease_renewals_total", "result" => "transient_error")
                    .increment(1);
                let budget = lease_deadline.saturating_duration_since(Instant::now());
                if attempts > params.retry_limit || budget.is_zero() {
                    warn!(
                        lock_key = %params.lock_key,
                        attempts,
                        "renewal retries exhausted, lease presumed lost"
                    );
                    return RenewOutcome::Lost("store_unavailable");
                }
                let delay = jittered(params.interval / 4).min(budget);
                warn!(
                    lock_key = %params.lock_key,
                    error = %err,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    "transient renewal failure, retrying"
                );
                tokio::select! {
                    _ = sleep(delay) => {}
                    _ = shared.shutdown.notified() => return RenewOutcome::Stopped,
                }
            }
            Err(err) => {
                error!(
                    lock_key = %params.lock_key,
                    error = %err,
                    "unexpected renewal error, lease presumed lost"
                );
                return RenewOutcome::Lost("error");
            }
        }
    }
}

/// Full jitter: uniform delay in `[0, max]`.
pub(crate) fn jittered(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    let ms = rand::thread_rng().gen_range(0..=max_ms);
    Duration::from_millis(ms)
}
