// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Persisted order, ticket, scan, and customer records.
//!
//! Records are stored as JSON values inside redb tables (see
//! [`super::database`]). Monetary amounts are integer minor units.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// =============================================================================
// Orders
// =============================================================================

/// Order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Completed,
    Cancelled,
}

impl OrderStatus {
    /// Whether moving from `self` to `next` is a legal lifecycle transition.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        matches!(
            (self, next),
            (OrderStatus::Pending, OrderStatus::Completed)
                | (OrderStatus::Pending, OrderStatus::Cancelled)
        )
    }
}

/// Free-form payment facts captured from gateway notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct PaymentMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_last4: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_response: Option<String>,
    /// Amount received above the expected total, in minor units.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overpayment: Option<i64>,
    #[serde(default)]
    pub requires_manual_review: bool,
    #[serde(default)]
    pub disputed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomaly_flags: Vec<String>,
}

/// A purchase of one or more tickets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Order {
    pub order_id: String,
    pub customer_id: String,
    /// Expected total in minor units. Never changes after creation.
    pub amount: i64,
    pub quantity: u32,
    pub status: OrderStatus,
    /// Gateway-assigned transaction reference.
    pub payment_reference: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_amount: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(default)]
    pub payment_metadata: PaymentMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Construct a new pending order awaiting payment.
    pub fn new_pending(
        order_id: impl Into<String>,
        customer_id: impl Into<String>,
        payment_reference: impl Into<String>,
        amount: i64,
        quantity: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            order_id: order_id.into(),
            customer_id: customer_id.into(),
            amount,
            quantity,
            status: OrderStatus::Pending,
            payment_reference: payment_reference.into(),
            payment_status: None,
            paid_amount: None,
            paid_at: None,
            payment_method: None,
            payment_metadata: PaymentMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

// =============================================================================
// Tickets
// =============================================================================

/// Ticket lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Pending,
    Active,
    Scanned,
    Cancelled,
    Expired,
}

impl TicketStatus {
    /// Terminal statuses are never left again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TicketStatus::Scanned | TicketStatus::Cancelled | TicketStatus::Expired
        )
    }
}

/// One admission credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Ticket {
    pub ticket_id: String,
    /// Unique code presented at the gate (`PREFIX-YYYY-XXXXXX`).
    pub code: String,
    pub order_id: String,
    pub session_id: String,
    pub valid_until: DateTime<Utc>,
    pub status: TicketStatus,
    pub scan_count: u32,
    pub max_scans: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_scan_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_scan_at: Option<DateTime<Utc>>,
    /// Days after the first scan during which re-entry is allowed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_window_days: Option<u32>,
    /// Storage path of the QR credential, set on activation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Ticket {
    /// Construct a ticket awaiting payment confirmation.
    pub fn new_pending(
        ticket_id: impl Into<String>,
        code: impl Into<String>,
        order_id: impl Into<String>,
        session_id: impl Into<String>,
        valid_until: DateTime<Utc>,
        max_scans: u32,
        scan_window_days: Option<u32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            ticket_id: ticket_id.into(),
            code: code.into(),
            order_id: order_id.into(),
            session_id: session_id.into(),
            valid_until,
            status: TicketStatus::Pending,
            scan_count: 0,
            max_scans,
            first_scan_at: None,
            last_scan_at: None,
            scan_window_days,
            credential_path: None,
            activated_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn remaining_scans(&self) -> u32 {
        self.max_scans.saturating_sub(self.scan_count)
    }
}

// =============================================================================
// Scans
// =============================================================================

/// Append-only record of one admission attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TicketScan {
    pub scan_id: String,
    /// Code as presented at the gate, even when it matched no ticket.
    pub ticket_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket_id: Option<String>,
    pub scanner_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub scanned_at: DateTime<Utc>,
    pub allowed: bool,
    pub reason: String,
}

// =============================================================================
// Customers
// =============================================================================

/// Purchase aggregates kept per customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Customer {
    pub customer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub total_spent: i64,
    pub order_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_order_at: Option<DateTime<Utc>>,
}

impl Customer {
    pub fn new(customer_id: impl Into<String>, email: Option<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            email,
            total_spent: 0,
            order_count: 0,
            last_order_at: None,
        }
    }
}

// =============================================================================
// Idempotency
// =============================================================================

/// Progress of a webhook delivery in the idempotency ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Processing,
    Completed,
}

/// Ledger entry keyed by (event type, external reference).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    /// Content hash of (event, reference, paid_at).
    pub content_hash: String,
    pub status: IdempotencyStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_completed_for(&self, content_hash: &str) -> bool {
        self.status == IdempotencyStatus::Completed && self.content_hash == content_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_transitions() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Completed));
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Completed.can_transition_to(OrderStatus::Pending));
        assert!(!OrderStatus::Completed.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Cancelled.can_transition_to(OrderStatus::Completed));
    }

    #[test]
    fn status_serializes_uppercase() {
        let json = serde_json::to_string(&TicketStatus::Scanned).unwrap();
        assert_eq!(json, "\"SCANNED\"");
        let json = serde_json::to_string(&OrderStatus::Pending).unwrap();
        assert_eq!(json, "\"PENDING\"");
    }

    #[test]
    fn remaining_scans_saturates() {
        let mut ticket = Ticket::new_pending(
            "t1",
            "VEN-2026-ABC123",
            "o1",
            "s1",
            Utc::now(),
            2,
            Some(14),
        );
        assert_eq!(ticket.remaining_scans(), 2);
        ticket.scan_count = 3;
        assert_eq!(ticket.remaining_scans(), 0);
    }
}
