// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Audit events for payment, security, and ticket lifecycle operations.
//!
//! Events are appended to the `audit_log` table, either inside the same
//! write transaction as the state change they describe or on their own for
//! rejected deliveries. Nothing on the processing path reads them back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Types of auditable events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // Payment events
    PaymentConfirmed,
    PaymentFailed,
    PaymentRejected,
    PaymentDisputed,
    PaymentRefunded,
    TransferSucceeded,
    TransferFailed,

    // Ticket events
    TicketsActivated,
    TicketCancelled,

    // Security events
    SignatureRejected,
    UntrustedSource,
    StaleNotification,
    RateLimited,
    MalformedNotification,
}

/// An audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuditEvent {
    /// Unique event ID.
    pub event_id: String,
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Type of event.
    pub event_type: AuditEventType,
    /// Resource affected (order_id, ticket code, payment reference).
    pub resource_id: Option<String>,
    /// Resource type (order, ticket, webhook).
    pub resource_type: Option<String>,
    /// Source address of the request, when known.
    pub ip_address: Option<String>,
    /// Additional details as JSON.
    #[schema(value_type = Option<Object>)]
    pub details: Option<serde_json::Value>,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Error message if the operation failed.
    pub error: Option<String>,
}

impl AuditEvent {
    /// Create a new audit event.
    pub fn new(event_type: AuditEventType, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            event_type,
            resource_id: None,
            resource_type: None,
            ip_address: None,
            details: None,
            success: true,
            error: None,
        }
    }

    /// Set the resource.
    pub fn with_resource(
        mut self,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        self.resource_type = Some(resource_type.into());
        self.resource_id = Some(resource_id.into());
        self
    }

    /// Set the IP address.
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    /// Add details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Mark as failed with error message.
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }

    /// Key used in the audit table: timestamp-ordered, unique per event.
    pub(crate) fn storage_key(&self) -> String {
        format!(
            "{:020}|{}",
            self.timestamp.timestamp_micros().max(0),
            self.event_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_audit_event() {
        let event = AuditEvent::new(AuditEventType::PaymentConfirmed, Utc::now())
            .with_resource("order", "order_abc")
            .with_ip("192.168.1.1");

        assert_eq!(event.event_type, AuditEventType::PaymentConfirmed);
        assert_eq!(event.resource_type, Some("order".to_string()));
        assert_eq!(event.resource_id, Some("order_abc".to_string()));
        assert_eq!(event.ip_address, Some("192.168.1.1".to_string()));
        assert!(event.success);
    }

    #[test]
    fn failed_event() {
        let event = AuditEvent::new(AuditEventType::SignatureRejected, Utc::now())
            .with_resource("webhook", "ref_1")
            .failed("signature mismatch");

        assert!(!event.success);
        assert_eq!(event.error, Some("signature mismatch".to_string()));
    }

    #[test]
    fn storage_keys_sort_by_time() {
        let earlier = AuditEvent::new(AuditEventType::RateLimited, Utc::now());
        let later = AuditEvent::new(
            AuditEventType::RateLimited,
            earlier.timestamp + chrono::Duration::seconds(1),
        );
        assert!(earlier.storage_key() < later.storage_key());
    }
}
