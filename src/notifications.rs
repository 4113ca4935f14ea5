// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Notification Queue
//!
//! Customer emails and operator alerts produced by webhook processing. Jobs
//! are enqueued only after the database transaction that caused them has
//! committed, and are delivered by a background [`NotificationWorker`] so
//! webhook acknowledgement never waits on an email provider.
//!
//! Delivery goes through the [`NotificationSink`] trait. [`LogSink`] writes
//! each job to the log and is the default until a mail provider is wired in.
//!
//! ## Shutdown
//!
//! The worker drains jobs until the `CancellationToken` fires or every
//! [`NotificationQueue`] handle is dropped.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertUrgency {
    High,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationJob {
    /// Payment confirmed. Carries the activated ticket codes.
    PaymentConfirmation {
        order_id: String,
        reference: String,
        email: Option<String>,
        ticket_codes: Vec<String>,
    },
    PaymentFailure {
        order_id: String,
        reference: String,
        email: Option<String>,
        reason: Option<String>,
    },
    /// Paid amount differs from the order total beyond tolerance.
    PaymentMismatchAlert {
        order_id: String,
        reference: String,
        expected: i64,
        paid: i64,
        urgency: AlertUrgency,
    },
    DisputeAlert {
        order_id: String,
        reference: String,
        amount: i64,
    },
}

impl NotificationJob {
    pub fn kind(&self) -> &'static str {
        match self {
            NotificationJob::PaymentConfirmation { .. } => "payment_confirmation",
            NotificationJob::PaymentFailure { .. } => "payment_failure",
            NotificationJob::PaymentMismatchAlert { .. } => "payment_mismatch_alert",
            NotificationJob::DisputeAlert { .. } => "dispute_alert",
        }
    }
}

/// Cloneable producer handle.
#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::UnboundedSender<NotificationJob>,
}

impl NotificationQueue {
    /// Create a queue and the receiver its worker consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NotificationJob>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Hand a job to the worker. Never blocks. A stopped worker loses the
    /// job, which is logged.
    pub fn enqueue(&self, job: NotificationJob) {
        let kind = job.kind();
        if self.tx.send(job).is_err() {
            warn!(kind, "Notification worker stopped; job dropped");
        }
    }
}

/// Delivery backend.
pub trait NotificationSink: Send + Sync {
    fn deliver(&self, job: &NotificationJob);
}

/// Writes jobs to the log.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn deliver(&self, job: &NotificationJob) {
        match serde_json::to_string(job) {
            Ok(payload) => info!(kind = job.kind(), payload = %payload, "Notification dispatched"),
            Err(e) => warn!(kind = job.kind(), error = %e, "Failed to encode notification"),
        }
    }
}

pub struct NotificationWorker {
    rx: mpsc::UnboundedReceiver<NotificationJob>,
    sink: Arc<dyn NotificationSink>,
}

impl NotificationWorker {
    pub fn new(rx: mpsc::UnboundedReceiver<NotificationJob>, sink: Arc<dyn NotificationSink>) -> Self {
        Self { rx, sink }
    }

    /// Deliver jobs until cancelled or every producer is gone.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Notification worker starting");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Notification worker shutting down");
                    return;
                }
                job = self.rx.recv() => match job {
                    Some(job) => self.sink.deliver(&job),
                    None => {
                        info!("Notification queue closed");
                        return;
                    }
                },
            }
        }
    }
}
