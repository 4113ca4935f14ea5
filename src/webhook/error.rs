// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Typed failures of the webhook pipeline.

use axum::http::StatusCode;

use crate::storage::{CacheError, DbError};

/// Coarse classification used for logging, retries, and audit decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed payload. Retrying cannot help.
    Validation,
    /// Bad signature, untrusted source, or stale timestamp.
    Authentication,
    /// Another delivery holds the lock. Retry with backoff.
    Conflict,
    /// Source exceeded its delivery budget. Back off.
    RateLimited,
    /// Terminal for this delivery; the ledger still completes.
    BusinessRule,
    /// Ledger, lock, or database unavailable. Fails closed.
    Infrastructure,
}

/// Business rules that reject an otherwise authentic notification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusinessRule {
    #[error("no order matches the payment reference")]
    OrderNotFound,

    #[error("order is already completed")]
    OrderAlreadyCompleted,

    #[error("order is not awaiting payment")]
    OrderNotPending,

    #[error("payment status `{0}` does not confirm payment")]
    UnexpectedStatus(String),

    #[error("paid amount {paid} is below expected amount {expected}")]
    Underpayment { expected: i64, paid: i64 },
}

impl BusinessRule {
    pub fn code(&self) -> &'static str {
        match self {
            BusinessRule::OrderNotFound => "order_not_found",
            BusinessRule::OrderAlreadyCompleted => "order_already_completed",
            BusinessRule::OrderNotPending => "order_not_pending",
            BusinessRule::UnexpectedStatus(_) => "unexpected_status",
            BusinessRule::Underpayment { .. } => "underpayment",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("malformed notification: {0}")]
    Malformed(String),

    #[error("notification timestamp is outside the accepted window")]
    Stale,

    #[error("signature header is missing")]
    MissingSignature,

    #[error("unsupported signature algorithm")]
    UnsupportedAlgorithm,

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("notification source is not trusted")]
    UntrustedSource,

    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("another delivery of this notification is in flight")]
    Conflict,

    #[error("notification rejected: {0}")]
    Business(BusinessRule),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("infrastructure failure: {0}")]
    Infrastructure(String),
}

impl WebhookError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WebhookError::Malformed(_) => ErrorKind::Validation,
            WebhookError::Stale
            | WebhookError::MissingSignature
            | WebhookError::UnsupportedAlgorithm
            | WebhookError::InvalidSignature
            | WebhookError::UntrustedSource => ErrorKind::Authentication,
            WebhookError::RateLimited { .. } => ErrorKind::RateLimited,
            WebhookError::Conflict => ErrorKind::Conflict,
            WebhookError::Business(_) => ErrorKind::BusinessRule,
            WebhookError::Timeout(_) | WebhookError::Infrastructure(_) => {
                ErrorKind::Infrastructure
            }
        }
    }

    /// Stable machine-readable code returned to the caller.
    pub fn error_code(&self) -> &'static str {
        match self {
            WebhookError::Malformed(_) => "malformed_notification",
            WebhookError::Stale => "stale_notification",
            WebhookError::MissingSignature => "missing_signature",
            WebhookError::UnsupportedAlgorithm => "unsupported_algorithm",
            WebhookError::InvalidSignature => "invalid_signature",
            WebhookError::UntrustedSource => "untrusted_source",
            WebhookError::RateLimited { .. } => "rate_limited",
            WebhookError::Conflict => "processing_conflict",
            WebhookError::Business(rule) => rule.code(),
            WebhookError::Timeout(_) | WebhookError::Infrastructure(_) => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            WebhookError::Malformed(_) | WebhookError::Stale => StatusCode::BAD_REQUEST,
            WebhookError::MissingSignature
            | WebhookError::UnsupportedAlgorithm
            | WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
            WebhookError::UntrustedSource => StatusCode::FORBIDDEN,
            WebhookError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            WebhookError::Conflict => StatusCode::CONFLICT,
            WebhookError::Business(_) => StatusCode::UNPROCESSABLE_ENTITY,
            WebhookError::Timeout(_) | WebhookError::Infrastructure(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to return to the caller. Infrastructure details stay in
    /// the logs.
    pub fn public_message(&self) -> String {
        match self.kind() {
            ErrorKind::Infrastructure => "internal error".to_string(),
            _ => self.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Conflict | ErrorKind::RateLimited | ErrorKind::Infrastructure
        )
    }
}

impl From<DbError> for WebhookError {
    fn from(e: DbError) -> Self {
        WebhookError::Infrastructure(format!("database: {e}"))
    }
}

impl From<CacheError> for WebhookError {
    fn from(e: CacheError) -> Self {
        WebhookError::Infrastructure(format!("cache: {e}"))
    }
}

impl From<BusinessRule> for WebhookError {
    fn from(rule: BusinessRule) -> Self {
        WebhookError::Business(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert_eq!(
            WebhookError::Malformed("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(WebhookError::Stale.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            WebhookError::InvalidSignature.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            WebhookError::UntrustedSource.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(WebhookError::Conflict.status_code(), StatusCode::CONFLICT);
        assert_eq!(
            WebhookError::RateLimited { retry_after_secs: 5 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            WebhookError::Timeout("commit").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn stale_counts_as_authentication() {
        assert_eq!(WebhookError::Stale.kind(), ErrorKind::Authentication);
    }

    #[test]
    fn infrastructure_details_are_hidden() {
        let err = WebhookError::Infrastructure("redb commit error: disk full".into());
        assert_eq!(err.public_message(), "internal error");
        assert!(err.is_retryable());
    }

    #[test]
    fn business_rule_codes_are_specific() {
        let err = WebhookError::from(BusinessRule::Underpayment {
            expected: 10_000,
            paid: 9_899,
        });
        assert_eq!(err.error_code(), "underpayment");
        assert_eq!(err.kind(), ErrorKind::BusinessRule);
        assert!(!err.is_retryable());
    }
}
