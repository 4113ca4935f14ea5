// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Structural validation of gateway notifications.
//!
//! The body is decoded into a `serde_json::Value` first and the required
//! fields are extracted by hand, so every malformed payload produces a precise
//! message instead of a generic deserializer error. No I/O happens here.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::error::WebhookError;

const MAX_REFERENCE_LEN: usize = 128;

/// Event names understood by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    PaymentSucceeded,
    PaymentFailed,
    PaymentDisputed,
    TransferSucceeded,
    TransferFailed,
    RefundProcessed,
    /// Acknowledged but not acted upon.
    Unknown(String),
}

impl EventKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "charge.success" => EventKind::PaymentSucceeded,
            "charge.failed" => EventKind::PaymentFailed,
            "charge.dispute.create" => EventKind::PaymentDisputed,
            "transfer.success" => EventKind::TransferSucceeded,
            "transfer.failed" => EventKind::TransferFailed,
            "refund.processed" => EventKind::RefundProcessed,
            other => EventKind::Unknown(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            EventKind::PaymentSucceeded => "charge.success",
            EventKind::PaymentFailed => "charge.failed",
            EventKind::PaymentDisputed => "charge.dispute.create",
            EventKind::TransferSucceeded => "transfer.success",
            EventKind::TransferFailed => "transfer.failed",
            EventKind::RefundProcessed => "refund.processed",
            EventKind::Unknown(name) => name,
        }
    }
}

/// Card/authorization details attached to a charge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Authorization {
    pub channel: Option<String>,
    pub card_type: Option<String>,
    pub last4: Option<String>,
    pub bank: Option<String>,
    /// Gateway-stable fingerprint of the card.
    pub signature: Option<String>,
}

/// A structurally valid notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub event: EventKind,
    pub reference: String,
    /// Minor units.
    pub amount: i64,
    pub status: String,
    pub paid_at: Option<DateTime<Utc>>,
    pub channel: Option<String>,
    pub gateway_response: Option<String>,
    pub customer_email: Option<String>,
    pub authorization: Option<Authorization>,
}

impl Notification {
    /// Parse and validate raw webhook bytes.
    pub fn parse(raw: &[u8]) -> Result<Self, WebhookError> {
        let root: Value = serde_json::from_slice(raw)
            .map_err(|e| WebhookError::Malformed(format!("body is not valid JSON: {e}")))?;

        let event_name = required_str(&root, "event")?;
        let data = root
            .get("data")
            .filter(|v| v.is_object())
            .ok_or_else(|| WebhookError::Malformed("`data` must be an object".into()))?;

        let reference = required_str(data, "reference")?;
        if reference.len() > MAX_REFERENCE_LEN
            || !reference
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(WebhookError::Malformed(
                "`data.reference` contains unsupported characters".into(),
            ));
        }

        let amount = match data.get("amount") {
            Some(Value::Number(n)) => n.as_i64().ok_or_else(|| {
                WebhookError::Malformed("`data.amount` must be an integer in minor units".into())
            })?,
            Some(_) => {
                return Err(WebhookError::Malformed(
                    "`data.amount` must be an integer in minor units".into(),
                ))
            }
            None => return Err(WebhookError::Malformed("`data.amount` is required".into())),
        };
        if amount < 0 {
            return Err(WebhookError::Malformed(
                "`data.amount` must not be negative".into(),
            ));
        }

        let status = required_str(data, "status")?;

        let paid_at = match data.get("paid_at") {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| {
                        WebhookError::Malformed(format!("`data.paid_at` is not RFC 3339: {e}"))
                    })?
                    .with_timezone(&Utc),
            ),
            Some(_) => {
                return Err(WebhookError::Malformed(
                    "`data.paid_at` must be a timestamp string".into(),
                ))
            }
        };

        let event = EventKind::from_name(&event_name);
        if event == EventKind::PaymentSucceeded && paid_at.is_none() {
            return Err(WebhookError::Malformed(
                "`data.paid_at` is required for charge.success".into(),
            ));
        }

        let customer_email = data
            .get("customer")
            .and_then(|c| optional_str(c, "email"));

        let authorization = data
            .get("authorization")
            .filter(|v| v.is_object())
            .map(|auth| Authorization {
                channel: optional_str(auth, "channel"),
                card_type: optional_str(auth, "card_type"),
                last4: optional_str(auth, "last4"),
                bank: optional_str(auth, "bank"),
                signature: optional_str(auth, "signature"),
            });

        Ok(Self {
            event,
            reference,
            amount,
            status,
            paid_at,
            channel: optional_str(data, "channel"),
            gateway_response: optional_str(data, "gateway_response"),
            customer_email,
            authorization,
        })
    }

    pub fn event_name(&self) -> &str {
        self.event.name()
    }

    /// Payment channel, preferring the authorization's own value.
    pub fn payment_channel(&self) -> Option<String> {
        self.authorization
            .as_ref()
            .and_then(|a| a.channel.clone())
            .or_else(|| self.channel.clone())
    }
}

fn required_str(value: &Value, field: &str) -> Result<String, WebhookError> {
    match value.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::String(_)) => Err(WebhookError::Malformed(format!(
            "`{field}` must not be empty"
        ))),
        Some(_) => Err(WebhookError::Malformed(format!("`{field}` must be a string"))),
        None => Err(WebhookError::Malformed(format!("`{field}` is required"))),
    }
}

fn optional_str(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
