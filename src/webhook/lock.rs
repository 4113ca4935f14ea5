// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Expiring mutual-exclusion locks keyed by notification identity.
//!
//! A lock is a key in the [`KeyValueStore`] holding a random owner token. It
//! is taken with set-if-absent and released with compare-and-delete, so a
//! holder whose TTL lapsed can never remove a lock someone else now holds.
//! [`LockGuard`] releases on drop, which covers early returns and panics.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::error::WebhookError;
use super::run_bounded;
use crate::config::LOCK_OP_TIMEOUT;
use crate::storage::{CacheResult, KeyValueStore};

#[derive(Clone)]
pub struct LockService {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl LockService {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn lock_key(event: &str, reference: &str) -> String {
        format!("lock:webhook:{event}:{reference}")
    }

    /// Try once to take `key`. `None` means someone else holds it.
    pub fn try_acquire(&self, key: &str) -> CacheResult<Option<LockGuard>> {
        let token = Uuid::new_v4().to_string();
        if self.store.set_if_absent(key, &token, self.ttl)? {
            tracing::debug!(key = %key, "Lock acquired");
            Ok(Some(LockGuard {
                store: Arc::clone(&self.store),
                key: key.to_string(),
                token,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Run `f` while holding `key`.
    ///
    /// Fails with [`WebhookError::Conflict`] when the lock is held elsewhere.
    /// The lock is released whatever `f` returns.
    pub async fn with_lock<T, F, Fut>(&self, key: &str, f: F) -> Result<T, WebhookError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, WebhookError>>,
    {
        let service = self.clone();
        let owned_key = key.to_string();
        let guard = run_bounded(LOCK_OP_TIMEOUT, "lock acquisition", move || {
            service.try_acquire(&owned_key).map_err(WebhookError::from)
        })
        .await?
        .ok_or(WebhookError::Conflict)?;

        let result = f().await;

        match guard.release() {
            Ok(true) => {}
            Ok(false) => tracing::warn!(key = %key, "Lock expired before release"),
            Err(e) => tracing::warn!(key = %key, error = %e, "Failed to release lock"),
        }
        result
    }
}

/// Ownership of one lock. Dropping it releases the lock.
pub struct LockGuard {
    store: Arc<dyn KeyValueStore>,
    key: String,
    token: String,
    released: bool,
}

impl LockGuard {
    /// Release now. Returns `false` if the lock had already expired or
    /// changed owner.
    pub fn release(mut self) -> CacheResult<bool> {
        self.released = true;
        self.store.delete_if_equals(&self.key, &self.token)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.store.delete_if_equals(&self.key, &self.token) {
            tracing::warn!(key = %self.key, error = %e, "Failed to release lock on drop");
        }
    }
}
