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

//! Per-acquisition lock handle.
//!
//! ## Purpose
//! A `LockHandle` is created only by a successful acquisition and tracks
//! one lease: key, owner token, fencing token, lease duration, and renewal
//! state. It transitions `held → renewing → released` or
//! `held → renewing → expired`; the terminal states are never left, and a
//! handle is never resurrected — after expiry the caller re-acquires from
//! scratch and receives a new owner token and fencing token.
//!
//! ## Ownership
//! A handle belongs to one logical caller. If several components in a
//! process need the same external resource, they coordinate through one
//! shared handle, not separate acquisitions.

use crate::fencing::FencingToken;
use crate::store::OwnerToken;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

/// Renewal lifecycle of a held lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalState {
    /// Lease is held; next renewal not yet due.
    Held,
    /// A renewal is in flight.
    Renewing,
    /// The owner released the lock.
    Released,
    /// The lease lapsed before it could be renewed. Terminal and
    /// irreversible.
    Expired,
}

impl RenewalState {
    /// Whether the lock is still usable (mutual exclusion holds).
    pub fn is_live(&self) -> bool {
        matches!(self, RenewalState::Held | RenewalState::Renewing)
    }

    /// Whether this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        !self.is_live()
    }
}

impl fmt::Display for RenewalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RenewalState::Held => "held",
            RenewalState::Renewing => "renewing",
            RenewalState::Released => "released",
            RenewalState::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

/// State shared between a handle, its renewal watchdog, and the release
/// path.
pub(crate) struct HandleShared {
    state: RwLock<RenewalState>,
    /// Notified on every transition into a terminal state.
    terminal: Notify,
    /// Notified once when the watchdog must stop scheduling renewals.
    pub(crate) shutdown: Notify,
}

impl HandleShared {
    pub(crate) fn new() -> Self {
        Self {
            state: RwLock::new(RenewalState::Held),
            terminal: Notify::new(),
            shutdown: Notify::new(),
        }
    }

    pub(crate) async fn state(&self) -> RenewalState {
        *self.state.read().await
    }

    /// Transition the renewal state. Terminal states stick: once the handle
    /// is `Released` or `Expired` no further transition is applied.
    pub(crate) async fn set_state(&self, next: RenewalState) {
        {
            let mut state = self.state.write().await;
            if state.is_terminal() {
                return;
            }
            *state = next;
        }
        if next.is_terminal() {
            self.terminal.notify_waiters();
        }
    }

    /// Wait until a terminal state is reached and return it.
    pub(crate) async fn wait_terminal(&self) -> RenewalState {
        loop {
            // Register with the notifier before reading the state, so a
            // transition landing in between still wakes this waiter.
            let mut notified = std::pin::pin!(self.terminal.notified());
            notified.as_mut().enable();
            let state = self.state().await;
            if state.is_terminal() {
                return state;
            }
            notified.await;
        }
    }
}

/// Handle for one held lock.
///
/// Obtained from [`LockService`](crate::LockService) acquisition methods.
/// Carries the fencing token that must accompany every write the lock is
/// meant to protect.
pub struct LockHandle {
    lock_key: String,
    owner_token: OwnerToken,
    fencing_token: FencingToken,
    lease_duration: Duration,
    pub(crate) shared: Arc<HandleShared>,
    pub(crate) watchdog: Option<JoinHandle<()>>,
}

impl LockHandle {
    pub(crate) fn new(
        lock_key: String,
        owner_token: OwnerToken,
        fencing_token: FencingToken,
        lease_duration: Duration,
        shared: Arc<HandleShared>,
        watchdog: JoinHandle<()>,
    ) -> Self {
        Self {
            lock_key,
            owner_token,
            fencing_token,
            lease_duration,
            shared,
            watchdog: Some(watchdog),
        }
    }

    /// Key of the protected resource.
    pub fn lock_key(&self) -> &str {
        &self.lock_key
    }

    /// Owner token for this acquisition.
    pub fn owner_token(&self) -> &OwnerToken {
        &self.owner_token
    }

    /// Fencing token for this acquisition. Attach to every protected write.
    pub fn fencing_token(&self) -> FencingToken {
        self.fencing_token
    }

    /// Lease duration granted at acquisition.
    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Current renewal state.
    pub async fn state(&self) -> RenewalState {
        self.shared.state().await
    }

    /// Whether the lock is still held (mutual exclusion guaranteed).
    pub async fn is_live(&self) -> bool {
        self.shared.state().await.is_live()
    }

    /// Wait until the handle reaches a terminal state and return it.
    ///
    /// Resolves with [`RenewalState::Expired`] when the watchdog loses the
    /// lease, or [`RenewalState::Released`] when the owner releases the
    /// lock concurrently. Returns immediately if the handle is already
    /// terminal. A caller that keeps mutating the protected resource
    /// without listening here (or checking [`is_live`](Self::is_live)) may
    /// be writing with a lease it no longer holds.
    pub async fn wait_expired(&self) -> RenewalState {
        self.shared.wait_terminal().await
    }

    /// Listener for terminal transitions, detached from the handle.
    ///
    /// Lets a supervising task await loss of the lease while the owning
    /// call-site keeps the handle itself.
    pub fn expiry_listener(&self) -> ExpiryListener {
        ExpiryListener { shared: self.shared.clone() }
    }

    /// Stop the renewal watchdog. Idempotent.
    pub(crate) fn stop_watchdog(&mut self) {
        self.shared.shutdown.notify_one();
        if let Some(task) = self.watchdog.take() {
            task.abort();
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        // An abandoned handle stops renewing; the lease then lapses via the
        // store's TTL and the key becomes acquirable again.
        if self.watchdog.is_some() {
            debug!(lock_key = %self.lock_key, "lock handle dropped without release, abandoning lease to TTL");
            self.stop_watchdog();
        }
    }
}

/// Awaits the terminal transition of one lock handle.
///
/// Obtained from [`LockHandle::expiry_listener`]; cheap to clone and safe
/// to move into a supervising task.
#[derive(Clone)]
pub struct ExpiryListener {
    shared: Arc<HandleShared>,
}

impl ExpiryListener {
    /// Current renewal state of the underlying handle.
    pub async fn state(&self) -> RenewalState {
        self.shared.state().await
    }

    /// Wait until the handle reaches a terminal state and return it.
    pub async fn wait(&self) -> RenewalState {
        self.shared.wait_terminal().await
    }
}

impl fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockHandle")
            .field("lock_key", &self.lock_key)
            .field("owner_token", &self.owner_token)
            .field("fencing_token", &self.fencing_token)
            .field("lease_duration", &self.lease_duration)
            .finish_non_exhaustive()
    }
}
