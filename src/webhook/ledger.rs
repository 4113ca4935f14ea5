// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Idempotency ledger for webhook deliveries.
//!
//! Each delivery is keyed by `(event, reference)` and carries a content hash
//! of `(event, reference, paid_at)`. A delivery whose key is completed with
//! the same hash is a duplicate.
//!
//! The ledger has two tiers. The key-value store answers the hot path; the
//! `IDEMPOTENCY` table in redb is authoritative and is consulted whenever the
//! store misses or is unavailable. Writes go to redb first, then the store.
//!
//! [`LedgerSweeper`] purges durable records older than the retention period.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use super::error::WebhookError;
use super::run_bounded;
use crate::clock::Clock;
use crate::config::LOCK_OP_TIMEOUT;
use crate::storage::{IdempotencyRecord, IdempotencyStatus, KeyValueStore, VenueDatabase};

const PROCESSING_PREFIX: &str = "processing:";
const COMPLETED_PREFIX: &str = "completed:";

pub fn ledger_key(event: &str, reference: &str) -> String {
    format!("idem:webhook:{event}:{reference}")
}

/// SHA-256 over `event|reference|paid_at`. A missing `paid_at` hashes as
/// the empty string.
pub fn content_hash(event: &str, reference: &str, paid_at: Option<DateTime<Utc>>) -> String {
    let paid_at = paid_at.map(|t| t.to_rfc3339()).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(event.as_bytes());
    hasher.update(b"|");
    hasher.update(reference.as_bytes());
    hasher.update(b"|");
    hasher.update(paid_at.as_bytes());
    hex::encode(hasher.finalize())
}

/// Result of claiming a key for processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// First attempt for this key and hash.
    Started,
    /// A previous attempt stopped while processing. Its side effects were
    /// rolled back, so processing starts over.
    Resumed,
    /// Completed by an earlier delivery.
    AlreadyCompleted,
}

#[derive(Clone)]
pub struct IdempotencyLedger {
    cache: Arc<dyn KeyValueStore>,
    db: Arc<VenueDatabase>,
    clock: Arc<dyn Clock>,
    retention: Duration,
}

impl IdempotencyLedger {
    pub fn new(
        cache: Arc<dyn KeyValueStore>,
        db: Arc<VenueDatabase>,
        clock: Arc<dyn Clock>,
        retention: Duration,
    ) -> Self {
        Self {
            cache,
            db,
            clock,
            retention,
        }
    }

    /// Whether `key` already completed with `hash`.
    pub async fn is_completed(&self, key: &str, hash: &str) -> Result<bool, WebhookError> {
        let ledger = self.clone();
        let key = key.to_string();
        let hash = hash.to_string();
        run_bounded(LOCK_OP_TIMEOUT, "idempotency lookup", move || {
            ledger.is_completed_blocking(&key, &hash)
        })
        .await
    }

    fn is_completed_blocking(&self, key: &str, hash: &str) -> Result<bool, WebhookError> {
        match self.cache.get(key) {
            Ok(Some(value)) if value == format!("{COMPLETED_PREFIX}{hash}") => return Ok(true),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Ledger cache unavailable, using database");
            }
        }
        let record = self.db.get_idempotency(key)?;
        let completed = record.is_some_and(|r| r.is_completed_for(hash));
        if completed {
            self.warm_cache(key, &format!("{COMPLETED_PREFIX}{hash}"));
        }
        Ok(completed)
    }

    /// Record that processing of `key` has begun. Call while holding the lock.
    pub async fn claim(&self, key: &str, hash: &str) -> Result<Claim, WebhookError> {
        let ledger = self.clone();
        let key = key.to_string();
        let hash = hash.to_string();
        run_bounded(LOCK_OP_TIMEOUT, "idempotency claim", move || {
            ledger.claim_blocking(&key, &hash)
        })
        .await
    }

    fn claim_blocking(&self, key: &str, hash: &str) -> Result<Claim, WebhookError> {
        let now = self.clock.now();
        let claim = self.db.transact(|txn| {
            let existing = txn.get_idempotency(key)?;
            let claim = match &existing {
                Some(record) if record.is_completed_for(hash) => {
                    return Ok::<_, WebhookError>(Claim::AlreadyCompleted)
                }
                Some(record)
                    if record.status == IdempotencyStatus::Processing
                        && record.content_hash == hash =>
                {
                    Claim::Resumed
                }
                _ => Claim::Started,
            };
            let record = IdempotencyRecord {
                key: key.to_string(),
                content_hash: hash.to_string(),
                status: IdempotencyStatus::Processing,
                created_at: existing.as_ref().map(|r| r.created_at).unwrap_or(now),
                updated_at: now,
            };
            txn.put_idempotency(&record)?;
            Ok(claim)
        })?;

        if claim != Claim::AlreadyCompleted {
            self.warm_cache(key, &format!("{PROCESSING_PREFIX}{hash}"));
        }
        Ok(claim)
    }

    /// Record that `key` finished. Later deliveries with the same hash are
    /// duplicates.
    pub async fn mark_completed(&self, key: &str, hash: &str) -> Result<(), WebhookError> {
        let ledger = self.clone();
        let key = key.to_string();
        let hash = hash.to_string();
        run_bounded(LOCK_OP_TIMEOUT, "idempotency completion", move || {
            ledger.mark_completed_blocking(&key, &hash)
        })
        .await
    }

    fn mark_completed_blocking(&self, key: &str, hash: &str) -> Result<(), WebhookError> {
        let now = self.clock.now();
        self.db.transact(|txn| {
            let created_at = txn
                .get_idempotency(key)?
                .map(|r| r.created_at)
                .unwrap_or(now);
            txn.put_idempotency(&IdempotencyRecord {
                key: key.to_string(),
                content_hash: hash.to_string(),
                status: IdempotencyStatus::Completed,
                created_at,
                updated_at: now,
            })?;
            Ok::<_, WebhookError>(())
        })?;
        self.warm_cache(key, &format!("{COMPLETED_PREFIX}{hash}"));
        Ok(())
    }

    fn warm_cache(&self, key: &str, value: &str) {
        if let Err(e) = self.cache.set(key, value, self.retention) {
            tracing::warn!(key = %key, error = %e, "Failed to update ledger cache");
        }
    }
}

// =============================================================================
// Retention sweeper
// =============================================================================

/// Background task deleting idempotency records past retention.
pub struct LedgerSweeper {
    db: Arc<VenueDatabase>,
    clock: Arc<dyn Clock>,
    retention: Duration,
    interval: Duration,
}

impl LedgerSweeper {
    pub fn new(
        db: Arc<VenueDatabase>,
        clock: Arc<dyn Clock>,
        retention: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            db,
            clock,
            retention,
            interval,
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            retention_secs = self.retention.as_secs(),
            "Idempotency ledger sweeper started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Idempotency ledger sweeper stopping");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    match self.sweep_once() {
                        Ok(0) => {}
                        Ok(purged) => tracing::info!(purged, "Purged expired idempotency records"),
                        Err(e) => tracing::warn!(error = %e, "Idempotency sweep failed"),
                    }
                }
            }
        }
    }

    pub fn sweep_once(&self) -> Result<usize, WebhookError> {
        let retention = chrono::Duration::from_std(self.retention)
            .map_err(|e| WebhookError::Infrastructure(format!("retention out of range: {e}")))?;
        let cutoff = self.clock.now() - retention;
        Ok(self.db.purge_idempotency_before(cutoff)?)
    }
}
