// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Per-source delivery budget backed by the shared key-value store.

use std::sync::Arc;
use std::time::Duration;

use crate::storage::{CacheResult, KeyValueStore};

const KEY_PREFIX: &str = "ratelimit:webhook:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u64 },
    Limited { retry_after_secs: u64 },
}

/// Counts deliveries per source over a fixed window.
///
/// The counter lives in the [`KeyValueStore`], so every replica sharing the
/// store sees the same budget.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    limit: u64,
    window: Duration,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KeyValueStore>, limit: u64, window: Duration) -> Self {
        Self {
            store,
            limit,
            window,
        }
    }

    /// Count one delivery from `source` and decide whether it may proceed.
    pub fn check(&self, source: &str) -> CacheResult<RateDecision> {
        let key = format!("{KEY_PREFIX}{source}");
        let count = self.store.incr_with_expiry(&key, self.window)?;
        if count > self.limit {
            Ok(RateDecision::Limited {
                retry_after_secs: self.window.as_secs().max(1),
            })
        } else {
            Ok(RateDecision::Allowed {
                remaining: self.limit - count,
            })
        }
    }
}
