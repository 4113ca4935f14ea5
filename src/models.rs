// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # API Data Models
//!
//! Request and response bodies of the gate endpoints. Webhook
//! acknowledgements use [`crate::webhook::ProcessingResult`] directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::admission::ScanOutcome;
use crate::storage::TicketScan;

/// Default and ceiling for scan history pages.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;
pub const MAX_HISTORY_LIMIT: usize = 500;

/// A code read at the gate.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ScanTicketRequest {
    /// Code in `PREFIX-YYYY-XXXXXX` form. Case and whitespace are normalized.
    pub ticket_code: String,
    pub scanner_id: String,
    pub location: Option<String>,
}

/// Admission decision for one scan.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ScanResponse {
    pub valid: bool,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_scans: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_days: Option<i64>,
    pub scan_id: String,
    pub scanned_at: DateTime<Utc>,
}

impl From<ScanOutcome> for ScanResponse {
    fn from(outcome: ScanOutcome) -> Self {
        Self {
            valid: outcome.decision.allowed,
            reason: outcome.decision.reason,
            remaining_scans: outcome.decision.remaining_scans,
            remaining_days: outcome.decision.remaining_days,
            scan_id: outcome.scan.scan_id,
            scanned_at: outcome.scan.scanned_at,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ScanHistoryQuery {
    /// Maximum rows to return (default 50, at most 500).
    pub limit: Option<usize>,
}

impl ScanHistoryQuery {
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT)
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ScanHistoryResponse {
    pub ticket_code: String,
    /// Newest first.
    pub scans: Vec<TicketScan>,
}
