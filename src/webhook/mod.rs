// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Payment Webhook Processing
//!
//! [`WebhookProcessor`] takes one gateway delivery from raw bytes to a
//! committed state change. Checks run in this order, and each one rejects
//! the delivery before any state is touched:
//!
//! 1. Structural validation ([`payload`])
//! 2. Source allow-list, production only ([`guard`])
//! 3. Per-source rate limit ([`rate_limit`])
//! 4. Timestamp freshness ([`guard`])
//! 5. HMAC-SHA512 signature over the raw body ([`signature`])
//! 6. Idempotency lookup ([`ledger`])
//! 7. Distributed lock on `(event, reference)` ([`lock`])
//! 8. Ledger claim, then the event handler in one transaction ([`handlers`])
//! 9. Notification enqueue, then ledger completion
//!
//! The handler transaction runs under a deadline. Past it the transaction
//! either rolls back, and the delivery fails with a retryable timeout, or it
//! had already begun committing and processing continues with its result.
//!
//! The lock is released on every exit path. Authentication failures are
//! delayed by a random jitter before the response goes out.

pub mod error;
pub mod guard;
pub mod handlers;
pub mod ledger;
pub mod lock;
pub mod payload;
pub mod rate_limit;
pub mod reconcile;
pub mod signature;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::clock::Clock;
use crate::config::{
    Environment, WebhookSettings, AUTH_FAILURE_JITTER_MS, COMMIT_TIMEOUT, IDEMPOTENCY_RETENTION,
    LOCK_OP_TIMEOUT, LOCK_TTL,
};
use crate::credentials::CredentialIssuer;
use crate::notifications::NotificationQueue;
use crate::storage::{AuditEvent, AuditEventType, BoundedTxn, KeyValueStore, VenueDatabase};

pub use error::{BusinessRule, ErrorKind, WebhookError};
use guard::{FreshnessGuard, SourceAllowList};
use handlers::{Disposition, HandlerContext, HandlerOutcome};
use ledger::{content_hash, ledger_key, Claim, IdempotencyLedger};
use lock::LockService;
use payload::{EventKind, Notification};
use rate_limit::{RateDecision, RateLimiter};
use signature::SignatureVerifier;

/// Run a blocking store operation on the blocking pool, bounded by `limit`.
pub(crate) async fn run_bounded<T, F>(
    limit: Duration,
    operation: &'static str,
    f: F,
) -> Result<T, WebhookError>
where
    F: FnOnce() -> Result<T, WebhookError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::time::timeout(limit, tokio::task::spawn_blocking(f)).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(WebhookError::Infrastructure(format!(
            "{operation} task failed: {join_err}"
        ))),
        Err(_) => Err(WebhookError::Timeout(operation)),
    }
}

/// One delivery as received over HTTP.
#[derive(Debug, Clone, Copy)]
pub struct InboundWebhook<'a> {
    /// Exact bytes the signature covers.
    pub body: &'a [u8],
    pub signature: Option<&'a str>,
    pub algorithm: Option<&'a str>,
    pub source: Option<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Processed,
    Duplicate,
    Ignored,
}

/// Acknowledgement returned to the gateway.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProcessingResult {
    pub event: String,
    pub reference: String,
    pub status: ProcessingStatus,
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub tickets_activated: usize,
    pub requires_manual_review: bool,
}

impl ProcessingResult {
    fn new(notification: &Notification, status: ProcessingStatus) -> Self {
        Self {
            event: notification.event_name().to_string(),
            reference: notification.reference.clone(),
            status,
            duplicate: status == ProcessingStatus::Duplicate,
            order_id: None,
            tickets_activated: 0,
            requires_manual_review: false,
        }
    }

    fn from_outcome(notification: &Notification, outcome: &HandlerOutcome) -> Self {
        Self {
            order_id: outcome.order_id.clone(),
            tickets_activated: outcome.tickets_activated,
            requires_manual_review: outcome.requires_manual_review,
            ..Self::new(notification, ProcessingStatus::Processed)
        }
    }
}

pub struct WebhookProcessor {
    verifier: SignatureVerifier,
    allow_list: SourceAllowList,
    rate_limiter: RateLimiter,
    freshness: FreshnessGuard,
    ledger: IdempotencyLedger,
    locks: LockService,
    db: Arc<VenueDatabase>,
    credentials: Arc<dyn CredentialIssuer>,
    notifications: NotificationQueue,
    clock: Arc<dyn Clock>,
    auth_jitter_ms: (u64, u64),
    commit_timeout: Duration,
}

impl WebhookProcessor {
    pub fn new(
        settings: &WebhookSettings,
        environment: Environment,
        db: Arc<VenueDatabase>,
        cache: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        credentials: Arc<dyn CredentialIssuer>,
        notifications: NotificationQueue,
    ) -> Self {
        Self {
            verifier: SignatureVerifier::new(&settings.secret),
            allow_list: SourceAllowList::new(settings.allowed_sources.clone(), environment),
            rate_limiter: RateLimiter::new(
                Arc::clone(&cache),
                settings.rate_limit,
                settings.rate_window,
            ),
            freshness: FreshnessGuard::default(),
            ledger: IdempotencyLedger::new(
                Arc::clone(&cache),
                Arc::clone(&db),
                Arc::clone(&clock),
                IDEMPOTENCY_RETENTION,
            ),
            locks: LockService::new(cache, LOCK_TTL),
            db,
            credentials,
            notifications,
            clock,
            auth_jitter_ms: AUTH_FAILURE_JITTER_MS,
            commit_timeout: COMMIT_TIMEOUT,
        }
    }

    /// Override the delay range applied after authentication failures.
    pub fn with_auth_jitter(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.auth_jitter_ms = (min_ms, max_ms.max(min_ms));
        self
    }

    /// Override the deadline for the payment transaction.
    pub fn with_commit_timeout(mut self, limit: Duration) -> Self {
        self.commit_timeout = limit;
        self
    }

    pub fn locks(&self) -> &LockService {
        &self.locks
    }

    /// Process one delivery end to end.
    pub async fn process(
        &self,
        inbound: InboundWebhook<'_>,
    ) -> Result<ProcessingResult, WebhookError> {
        let notification = match Notification::parse(inbound.body) {
            Ok(notification) => notification,
            Err(err) => {
                self.on_rejected(&inbound, None, &err).await;
                return Err(err);
            }
        };

        match self.run_checks_and_apply(&inbound, &notification).await {
            Ok(result) => Ok(result),
            Err(err) => {
                self.on_rejected(&inbound, Some(&notification), &err).await;
                Err(err)
            }
        }
    }

    async fn run_checks_and_apply(
        &self,
        inbound: &InboundWebhook<'_>,
        notification: &Notification,
    ) -> Result<ProcessingResult, WebhookError> {
        self.allow_list.check(inbound.source)?;

        let limiter = self.rate_limiter.clone();
        let source_key = inbound
            .source
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let decision = run_bounded(LOCK_OP_TIMEOUT, "rate limit", move || {
            limiter.check(&source_key).map_err(WebhookError::from)
        })
        .await?;
        if let RateDecision::Limited { retry_after_secs } = decision {
            return Err(WebhookError::RateLimited { retry_after_secs });
        }

        if let Some(paid_at) = notification.paid_at {
            self.freshness.check(paid_at, self.clock.now())?;
        }

        self.verifier
            .verify(inbound.body, inbound.algorithm, inbound.signature)?;

        let event = notification.event_name();
        let key = ledger_key(event, &notification.reference);
        let hash = content_hash(event, &notification.reference, notification.paid_at);

        if self.ledger.is_completed(&key, &hash).await? {
            info!(event, reference = %notification.reference, "Duplicate delivery acknowledged");
            return Ok(ProcessingResult::new(
                notification,
                ProcessingStatus::Duplicate,
            ));
        }

        let lock_key = LockService::lock_key(event, &notification.reference);
        self.locks
            .with_lock(&lock_key, || {
                self.apply_locked(inbound.source, notification, &key, &hash)
            })
            .await
    }

    async fn apply_locked(
        &self,
        source: Option<IpAddr>,
        notification: &Notification,
        key: &str,
        hash: &str,
    ) -> Result<ProcessingResult, WebhookError> {
        match self.ledger.claim(key, hash).await? {
            Claim::AlreadyCompleted => {
                info!(key, "Delivery completed while waiting for lock");
                return Ok(ProcessingResult::new(
                    notification,
                    ProcessingStatus::Duplicate,
                ));
            }
            Claim::Resumed => warn!(key, "Resuming interrupted delivery"),
            Claim::Started => {}
        }

        let outcome = self.dispatch(source, notification).await?;

        // Committed; notifications are safe to send now
        for job in &outcome.notifications {
            self.notifications.enqueue(job.clone());
        }

        self.ledger.mark_completed(key, hash).await?;

        match outcome.disposition {
            Disposition::Applied => Ok(ProcessingResult::from_outcome(notification, &outcome)),
            Disposition::Ignored => Ok(ProcessingResult::new(
                notification,
                ProcessingStatus::Ignored,
            )),
            Disposition::Rejected(rule) => Err(WebhookError::Business(rule)),
        }
    }

    async fn dispatch(
        &self,
        source: Option<IpAddr>,
        notification: &Notification,
    ) -> Result<HandlerOutcome, WebhookError> {
        if let EventKind::Unknown(name) = &notification.event {
            info!(event = %name, reference = %notification.reference, "Unhandled event acknowledged");
            return Ok(HandlerOutcome::ignored());
        }

        let credentials = Arc::clone(&self.credentials);
        let notification = notification.clone();
        let now = self.clock.now();
        let source = source.map(|ip| ip.to_string());

        let outcome = self
            .db
            .transact_bounded(self.commit_timeout, move |txn| {
                let ctx = HandlerContext {
                    now,
                    credentials: credentials.as_ref(),
                    source,
                };
                handlers::handle(txn, &notification, &ctx)
            })
            .await;

        match outcome {
            BoundedTxn::Finished(result) => result,
            BoundedTxn::TimedOut => Err(WebhookError::Timeout("payment transaction")),
            BoundedTxn::Failed(e) => Err(WebhookError::Infrastructure(format!(
                "payment transaction task failed: {e}"
            ))),
        }
    }

    /// Log, audit, and delay a rejected delivery according to its kind.
    async fn on_rejected(
        &self,
        inbound: &InboundWebhook<'_>,
        notification: Option<&Notification>,
        err: &WebhookError,
    ) {
        let event = notification.map(|n| n.event_name().to_string());
        let reference = notification.map(|n| n.reference.clone());
        let source = inbound.source.map(|ip| ip.to_string());

        let audit_type = match err {
            WebhookError::Malformed(_) => Some(AuditEventType::MalformedNotification),
            WebhookError::Stale => Some(AuditEventType::StaleNotification),
            WebhookError::MissingSignature
            | WebhookError::UnsupportedAlgorithm
            | WebhookError::InvalidSignature => Some(AuditEventType::SignatureRejected),
            WebhookError::UntrustedSource => Some(AuditEventType::UntrustedSource),
            WebhookError::RateLimited { .. } => Some(AuditEventType::RateLimited),
            _ => None,
        };

        match err.kind() {
            ErrorKind::Authentication => warn!(
                target: "security",
                code = err.error_code(),
                source = source.as_deref().unwrap_or("unknown"),
                event = event.as_deref().unwrap_or(""),
                reference = reference.as_deref().unwrap_or(""),
                "Webhook authentication failed"
            ),
            ErrorKind::Validation => warn!(
                source = source.as_deref().unwrap_or("unknown"),
                error = %err,
                "Malformed webhook rejected"
            ),
            ErrorKind::RateLimited => warn!(
                source = source.as_deref().unwrap_or("unknown"),
                "Webhook rate limit exceeded"
            ),
            ErrorKind::Conflict => info!(
                event = event.as_deref().unwrap_or(""),
                reference = reference.as_deref().unwrap_or(""),
                "Webhook already in flight"
            ),
            // Logged and audited inside the handler transaction
            ErrorKind::BusinessRule => {}
            ErrorKind::Infrastructure => error!(
                event = event.as_deref().unwrap_or(""),
                reference = reference.as_deref().unwrap_or(""),
                error = %err,
                "Webhook processing failed"
            ),
        }

        if let Some(audit_type) = audit_type {
            let mut entry = AuditEvent::new(audit_type, self.clock.now())
                .with_details(json!({ "event": event }))
                .failed(err.error_code());
            if let Some(reference) = &reference {
                entry = entry.with_resource("payment", reference.as_str());
            }
            if let Some(source) = &source {
                entry = entry.with_ip(source.as_str());
            }
            let db = Arc::clone(&self.db);
            let written = run_bounded(LOCK_OP_TIMEOUT, "audit write", move || {
                db.append_audit(&entry).map_err(WebhookError::from)
            })
            .await;
            if let Err(e) = written {
                warn!(error = %e, "Failed to record webhook rejection");
            }
        }

        if err.kind() == ErrorKind::Authentication {
            tokio::time::sleep(self.auth_failure_delay()).await;
        }
    }

    fn auth_failure_delay(&self) -> Duration {
        let (min, max) = self.auth_jitter_ms;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::credentials::QrPathIssuer;
    use crate::notifications::NotificationJob;
    use crate::storage::{MemoryStore, Order, OrderStatus, Ticket, TicketStatus};
    use chrono::{DateTime, TimeZone, Utc};
    use std::net::Ipv4Addr;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    const SECRET: &str = "whsec_test_secret";

    struct Harness {
        _dir: TempDir,
        db: Arc<VenueDatabase>,
        cache: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        processor: Arc<WebhookProcessor>,
        jobs: UnboundedReceiver<NotificationJob>,
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap()
    }

    fn gateway_ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(52, 31, 139, 75))
    }

    fn harness_with(environment: Environment, rate_limit: u64) -> Harness {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(VenueDatabase::open(&dir.path().join("test.redb")).unwrap());
        db.transact(|txn| {
            txn.insert_order(&Order::new_pending("o1", "c1", "ref-1", 10_000, 2))?;
            for (id, code) in [("t1", "EVT-2026-AAAAAA"), ("t2", "EVT-2026-BBBBBB")] {
                txn.insert_ticket(&Ticket::new_pending(
                    id,
                    code,
                    "o1",
                    "s1",
                    now() + chrono::Duration::days(30),
                    1,
                    None,
                ))?;
            }
            Ok::<_, crate::storage::DbError>(())
        })
        .unwrap();

        let cache = Arc::new(MemoryStore::new(1024));
        let clock = Arc::new(ManualClock::new(now()));
        let (queue, jobs) = NotificationQueue::channel();
        let settings = WebhookSettings {
            secret: SECRET.to_string(),
            allowed_sources: vec![gateway_ip()],
            trust_forwarded_for: false,
            rate_limit,
            rate_window: Duration::from_secs(60),
        };
        let processor = WebhookProcessor::new(
            &settings,
            environment,
            db.clone(),
            cache.clone(),
            clock.clone(),
            Arc::new(QrPathIssuer::new("qr")),
            queue,
        )
        .with_auth_jitter(0, 0);

        Harness {
            _dir: dir,
            db,
            cache,
            clock,
            processor: Arc::new(processor),
            jobs,
        }
    }

    fn harness() -> Harness {
        harness_with(Environment::Development, 1_000)
    }

    fn body(event: &str, amount: i64, paid_at: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "event": event,
            "data": {
                "reference": "ref-1",
                "amount": amount,
                "status": "success",
                "paid_at": paid_at,
                "customer": { "email": "ada@example.com" }
            }
        }))
        .unwrap()
    }

    fn success_body() -> Vec<u8> {
        body("charge.success", 10_000, "2026-10-18T11:58:00Z")
    }

    fn sign(body: &[u8]) -> String {
        SignatureVerifier::new(SECRET).sign(body).unwrap()
    }

    async fn deliver(processor: &WebhookProcessor, body: &[u8]) -> Result<ProcessingResult, WebhookError> {
        let tag = sign(body);
        processor
            .process(InboundWebhook {
                body,
                signature: Some(&tag),
                algorithm: Some("hmac-sha512"),
                source: Some(gateway_ip()),
            })
            .await
    }

    fn drain(jobs: &mut UnboundedReceiver<NotificationJob>) -> Vec<NotificationJob> {
        let mut out = Vec::new();
        while let Ok(job) = jobs.try_recv() {
            out.push(job);
        }
        out
    }

    #[tokio::test]
    async fn processes_once_then_reports_duplicate() {
        let mut h = harness();
        let raw = success_body();

        let first = deliver(&h.processor, &raw).await.unwrap();
        assert_eq!(first.status, ProcessingStatus::Processed);
        assert!(!first.duplicate);
        assert_eq!(first.tickets_activated, 2);
        assert_eq!(first.order_id.as_deref(), Some("o1"));

        let second = deliver(&h.processor, &raw).await.unwrap();
        assert!(second.duplicate);

        assert_eq!(h.db.get_customer("c1").unwrap().unwrap().order_count, 1);
        let jobs = drain(&mut h.jobs);
        assert_eq!(jobs.len(), 1);
        assert!(matches!(jobs[0], NotificationJob::PaymentConfirmation { .. }));
    }

    #[tokio::test]
    async fn lock_is_released_after_success() {
        let h = harness();
        deliver(&h.processor, &success_body()).await.unwrap();
        let lock_key = LockService::lock_key("charge.success", "ref-1");
        assert!(h.cache.get(&lock_key).unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deliveries_apply_exactly_once() {
        let mut h = harness();
        let raw = Arc::new(success_body());
        let mut handles = Vec::new();

        for _ in 0..10 {
            let processor = h.processor.clone();
            let raw = raw.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    match deliver(&processor, &raw).await {
                        Err(WebhookError::Conflict) => {
                            tokio::time::sleep(Duration::from_millis(2)).await
                        }
                        other => return other,
                    }
                }
            }));
        }

        let mut processed = 0;
        let mut duplicates = 0;
        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            if result.duplicate {
                duplicates += 1;
            } else {
                processed += 1;
            }
        }
        assert_eq!(processed, 1);
        assert_eq!(duplicates, 9);

        let customer = h.db.get_customer("c1").unwrap().unwrap();
        assert_eq!(customer.order_count, 1);
        assert_eq!(customer.total_spent, 10_000);
        assert_eq!(drain(&mut h.jobs).len(), 1);
    }

    #[tokio::test]
    async fn held_lock_yields_conflict() {
        let h = harness();
        let lock_key = LockService::lock_key("charge.success", "ref-1");
        let guard = h.processor.locks().try_acquire(&lock_key).unwrap().unwrap();

        let err = deliver(&h.processor, &success_body()).await.unwrap_err();
        assert!(matches!(err, WebhookError::Conflict));
        assert_eq!(h.db.get_order("o1").unwrap().unwrap().status, OrderStatus::Pending);

        guard.release().unwrap();
        let result = deliver(&h.processor, &success_body()).await.unwrap();
        assert_eq!(result.status, ProcessingStatus::Processed);
    }

    #[tokio::test]
    async fn invalid_signature_is_rejected_and_audited() {
        let h = harness();
        let raw = success_body();
        let err = h
            .processor
            .process(InboundWebhook {
                body: &raw,
                signature: Some(&"0".repeat(128)),
                algorithm: Some("hmac-sha512"),
                source: Some(gateway_ip()),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, WebhookError::InvalidSignature));
        assert_eq!(h.db.get_order("o1").unwrap().unwrap().status, OrderStatus::Pending);
        let audit = h.db.recent_audit_events(10).unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].event_type, AuditEventType::SignatureRejected);
        assert_eq!(audit[0].ip_address.as_deref(), Some("52.31.139.75"));
    }

    #[tokio::test]
    async fn valid_tag_without_algorithm_is_refused() {
        let h = harness();
        let raw = success_body();
        let tag = sign(&raw);
        let err = h
            .processor
            .process(InboundWebhook {
                body: &raw,
                signature: Some(&tag),
                algorithm: None,
                source: Some(gateway_ip()),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, WebhookError::UnsupportedAlgorithm));
        assert_eq!(h.db.get_order("o1").unwrap().unwrap().status, OrderStatus::Pending);
        let audit = h.db.recent_audit_events(10).unwrap();
        assert_eq!(audit[0].event_type, AuditEventType::SignatureRejected);
    }

    #[tokio::test]
    async fn replayed_capture_is_stale_even_with_valid_signature() {
        let h = harness();
        h.clock.advance(chrono::Duration::hours(49));
        let err = deliver(&h.processor, &success_body()).await.unwrap_err();
        assert!(matches!(err, WebhookError::Stale));
        assert_eq!(err.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn underpayment_is_terminal_and_alerts() {
        let mut h = harness();
        let raw = body("charge.success", 9_899, "2026-10-18T11:58:00Z");

        let err = deliver(&h.processor, &raw).await.unwrap_err();
        assert!(matches!(
            err,
            WebhookError::Business(BusinessRule::Underpayment { .. })
        ));
        assert_eq!(h.db.get_order("o1").unwrap().unwrap().status, OrderStatus::Pending);
        assert!(h
            .db
            .tickets_for_order("o1")
            .unwrap()
            .iter()
            .all(|t| t.status == TicketStatus::Pending));
        assert!(matches!(
            drain(&mut h.jobs).as_slice(),
            [NotificationJob::PaymentMismatchAlert { .. }]
        ));

        // The ledger completed, so a redelivery is a duplicate
        let again = deliver(&h.processor, &raw).await.unwrap();
        assert!(again.duplicate);
    }

    #[tokio::test]
    async fn new_paid_at_is_not_a_duplicate() {
        let h = harness();
        deliver(&h.processor, &success_body()).await.unwrap();

        let later = body("charge.success", 10_000, "2026-10-18T11:59:00Z");
        let err = deliver(&h.processor, &later).await.unwrap_err();
        assert!(matches!(
            err,
            WebhookError::Business(BusinessRule::OrderAlreadyCompleted)
        ));
    }

    #[tokio::test]
    async fn unknown_event_is_acknowledged() {
        let h = harness();
        let raw = serde_json::to_vec(&json!({
            "event": "subscription.create",
            "data": { "reference": "sub-9", "amount": 0, "status": "active" }
        }))
        .unwrap();

        let result = deliver(&h.processor, &raw).await.unwrap();
        assert_eq!(result.status, ProcessingStatus::Ignored);
        let again = deliver(&h.processor, &raw).await.unwrap();
        assert!(again.duplicate);
    }

    #[tokio::test]
    async fn rate_limit_applies_per_source() {
        let h = harness_with(Environment::Development, 2);
        let raw = success_body();

        // Forged deliveries spend the budget too
        for _ in 0..2 {
            let err = h
                .processor
                .process(InboundWebhook {
                    body: &raw,
                    signature: Some("deadbeef"),
                    algorithm: Some("hmac-sha512"),
                    source: Some(gateway_ip()),
                })
                .await
                .unwrap_err();
            assert!(matches!(err, WebhookError::InvalidSignature));
        }

        let err = deliver(&h.processor, &raw).await.unwrap_err();
        assert!(matches!(err, WebhookError::RateLimited { .. }));
        assert_eq!(err.status_code(), axum::http::StatusCode::TOO_MANY_REQUESTS);
        let audit = h.db.recent_audit_events(1).unwrap();
        assert_eq!(audit[0].event_type, AuditEventType::RateLimited);
        assert_eq!(audit[0].ip_address.as_deref(), Some("52.31.139.75"));

        let tag = sign(&raw);
        let other = InboundWebhook {
            body: &raw,
            signature: Some(&tag),
            algorithm: Some("hmac-sha512"),
            source: Some(IpAddr::V4(Ipv4Addr::new(52, 31, 139, 76))),
        };
        assert!(h.processor.process(other).await.is_ok());
    }

    #[tokio::test]
    async fn production_rejects_untrusted_source() {
        let h = harness_with(Environment::Production, 1_000);
        let raw = success_body();
        let tag = sign(&raw);
        let err = h
            .processor
            .process(InboundWebhook {
                body: &raw,
                signature: Some(&tag),
                algorithm: Some("hmac-sha512"),
                source: Some(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9))),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::UntrustedSource));

        let ok = deliver(&h.processor, &raw).await.unwrap();
        assert_eq!(ok.status, ProcessingStatus::Processed);
    }

    #[tokio::test]
    async fn infrastructure_failure_releases_lock_and_allows_retry() {
        struct FlakyIssuer(std::sync::atomic::AtomicBool);
        impl CredentialIssuer for FlakyIssuer {
            fn issue(
                &self,
                ticket: &Ticket,
            ) -> Result<String, crate::credentials::CredentialError> {
                if self.0.swap(false, std::sync::atomic::Ordering::SeqCst) {
                    return Err(crate::credentials::CredentialError::IssueFailed {
                        code: ticket.code.clone(),
                        reason: "offline".into(),
                    });
                }
                Ok(format!("qr/{}.png", ticket.code))
            }
        }

        let h = harness();
        let (queue, _jobs) = NotificationQueue::channel();
        let settings = WebhookSettings {
            secret: SECRET.to_string(),
            allowed_sources: Vec::new(),
            trust_forwarded_for: false,
            rate_limit: 100,
            rate_window: Duration::from_secs(60),
        };
        let processor = WebhookProcessor::new(
            &settings,
            Environment::Development,
            h.db.clone(),
            h.cache.clone(),
            h.clock.clone(),
            Arc::new(FlakyIssuer(std::sync::atomic::AtomicBool::new(true))),
            queue,
        )
        .with_auth_jitter(0, 0);

        let err = deliver(&processor, &success_body()).await.unwrap_err();
        assert!(matches!(err, WebhookError::Infrastructure(_)));
        assert!(err.is_retryable());
        assert_eq!(h.db.get_order("o1").unwrap().unwrap().status, OrderStatus::Pending);

        let retried = deliver(&processor, &success_body()).await.unwrap();
        assert_eq!(retried.status, ProcessingStatus::Processed);
        assert_eq!(h.db.get_order("o1").unwrap().unwrap().status, OrderStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_commit_rolls_back_and_retry_notifies() {
        struct SlowOnceIssuer(std::sync::atomic::AtomicBool);
        impl CredentialIssuer for SlowOnceIssuer {
            fn issue(
                &self,
                ticket: &Ticket,
            ) -> Result<String, crate::credentials::CredentialError> {
                if self.0.swap(false, std::sync::atomic::Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(600));
                }
                Ok(format!("qr/{}.png", ticket.code))
            }
        }

        let h = harness();
        let (queue, mut jobs) = NotificationQueue::channel();
        let settings = WebhookSettings {
            secret: SECRET.to_string(),
            allowed_sources: Vec::new(),
            trust_forwarded_for: false,
            rate_limit: 100,
            rate_window: Duration::from_secs(60),
        };
        let processor = WebhookProcessor::new(
            &settings,
            Environment::Development,
            h.db.clone(),
            h.cache.clone(),
            h.clock.clone(),
            Arc::new(SlowOnceIssuer(std::sync::atomic::AtomicBool::new(true))),
            queue,
        )
        .with_auth_jitter(0, 0)
        .with_commit_timeout(Duration::from_millis(200));

        let err = deliver(&processor, &success_body()).await.unwrap_err();
        assert!(matches!(err, WebhookError::Timeout(_)));
        assert!(err.is_retryable());
        assert!(drain(&mut jobs).is_empty());

        // The abandoned transaction finishes and must not have committed
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(h.db.get_order("o1").unwrap().unwrap().status, OrderStatus::Pending);

        let retried = deliver(&processor, &success_body()).await.unwrap();
        assert_eq!(retried.status, ProcessingStatus::Processed);
        assert!(!retried.duplicate);
        assert_eq!(retried.tickets_activated, 2);

        let sent = drain(&mut jobs);
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], NotificationJob::PaymentConfirmation { .. }));
        assert_eq!(h.db.get_customer("c1").unwrap().unwrap().order_count, 1);
    }
}
