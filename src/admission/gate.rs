// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Gate-side scan recording.
//!
//! Each scan runs read, decide, and write inside one redb write transaction.
//! redb admits a single writer at a time, so two gates scanning the same
//! ticket are serialized and cannot both consume its last scan.
//!
//! The gate never waits undecided: storage errors and timeouts produce a
//! denial with [`REASON_UNAVAILABLE`]. Scans from an unidentified scanner are
//! denied without looking at the ticket, and still recorded.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::code::TicketCode;
use super::engine::{
    self, AdmissionDecision, REASON_INVALID_FORMAT, REASON_SCANNER_MISSING, REASON_UNAVAILABLE,
};
use crate::clock::Clock;
use crate::config::SCAN_TIMEOUT;
use crate::storage::{BoundedTxn, DbResult, TicketScan, VenueDatabase, VenueTxn};

/// Longest presented code kept on a scan row.
const MAX_RECORDED_CODE_LEN: usize = 64;

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub code: String,
    pub scanner_id: String,
    pub location: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub scan: TicketScan,
    pub decision: AdmissionDecision,
    /// Whether the scan row reached durable storage.
    pub recorded: bool,
}

#[derive(Clone)]
pub struct GateService {
    db: Arc<VenueDatabase>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl GateService {
    pub fn new(db: Arc<VenueDatabase>, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            clock,
            timeout: SCAN_TIMEOUT,
        }
    }

    /// Decide and record one admission attempt.
    ///
    /// A timed-out attempt is rolled back, never committed late, so the
    /// ticket is untouched whenever the gate is told the service is
    /// unavailable.
    pub async fn scan(&self, request: ScanRequest) -> ScanOutcome {
        let now = self.clock.now();
        let scan_id = Uuid::new_v4().to_string();

        if request.scanner_id.trim().is_empty() {
            tracing::warn!(code = %request.code, "Scan without scanner id denied");
            return self
                .record_denial(request, scan_id, now, REASON_SCANNER_MISSING)
                .await;
        }

        let attempt = request.clone();
        let id = scan_id.clone();

        let result = self
            .db
            .transact_bounded(self.timeout, move |txn| {
                record_attempt(txn, &attempt, id, now)
            })
            .await;

        let failure = match result {
            BoundedTxn::Finished(Ok(outcome)) => {
                tracing::info!(
                    scan_id = %outcome.scan.scan_id,
                    code = %outcome.scan.ticket_code,
                    scanner_id = %outcome.scan.scanner_id,
                    allowed = outcome.decision.allowed,
                    reason = %outcome.decision.reason,
                    "Ticket scanned"
                );
                return outcome;
            }
            BoundedTxn::Finished(Err(e)) => e.to_string(),
            BoundedTxn::Failed(e) => e,
            BoundedTxn::TimedOut => "scan timed out".to_string(),
        };

        tracing::error!(code = %request.code, error = %failure, "Admission failed closed");
        self.record_denial(request, scan_id, now, REASON_UNAVAILABLE)
            .await
    }

    /// Scan rows for a code, newest first.
    pub async fn history(&self, code: &str, limit: usize) -> DbResult<Vec<TicketScan>> {
        let db = Arc::clone(&self.db);
        let code = recorded_code(code);
        tokio::task::spawn_blocking(move || db.scans_for_code(&code, limit))
            .await
            .map_err(|e| crate::storage::DbError::Io(std::io::Error::other(e.to_string())))?
    }

    /// Best-effort durable row for a denial decided without the ticket.
    ///
    /// The write is left running past the deadline: the row matches what the
    /// gate was told, so landing late is harmless. `recorded` reports whether
    /// it was confirmed before the reply.
    async fn record_denial(
        &self,
        request: ScanRequest,
        scan_id: String,
        now: DateTime<Utc>,
        reason: &str,
    ) -> ScanOutcome {
        let decision = AdmissionDecision::denied(reason);
        let scan = scan_row(&request, scan_id, None, now, &decision);

        let db = Arc::clone(&self.db);
        let row = scan.clone();
        let written = tokio::time::timeout(
            self.timeout,
            tokio::task::spawn_blocking(move || db.transact(|txn| txn.append_scan(&row))),
        )
        .await;
        let recorded = matches!(written, Ok(Ok(Ok(()))));
        if !recorded {
            tracing::error!(scan_id = %scan.scan_id, "Denied scan could not be recorded");
        }

        ScanOutcome {
            scan,
            decision,
            recorded,
        }
    }
}

/// Read, decide, and write within the caller's transaction.
fn record_attempt(
    txn: &VenueTxn<'_>,
    request: &ScanRequest,
    scan_id: String,
    now: DateTime<Utc>,
) -> DbResult<ScanOutcome> {
    let (ticket, decision) = match TicketCode::parse(&request.code) {
        Ok(code) => {
            let ticket = txn.get_ticket_by_code(&code.to_string())?;
            let decision = engine::evaluate(ticket.as_ref(), now);
            (ticket, decision)
        }
        Err(_) => (None, AdmissionDecision::denied(REASON_INVALID_FORMAT)),
    };

    let ticket_id = match ticket {
        Some(mut ticket) => {
            if engine::apply(&mut ticket, &decision, now) {
                txn.put_ticket(&ticket)?;
            }
            Some(ticket.ticket_id)
        }
        None => None,
    };

    let scan = scan_row(request, scan_id, ticket_id, now, &decision);
    txn.append_scan(&scan)?;
    Ok(ScanOutcome {
        scan,
        decision,
        recorded: true,
    })
}

fn scan_row(
    request: &ScanRequest,
    scan_id: String,
    ticket_id: Option<String>,
    now: DateTime<Utc>,
    decision: &AdmissionDecision,
) -> TicketScan {
    TicketScan {
        scan_id,
        ticket_code: recorded_code(&request.code),
        ticket_id,
        scanner_id: request.scanner_id.trim().to_string(),
        location: request.location.clone(),
        scanned_at: now,
        allowed: decision.allowed,
        reason: decision.reason.clone(),
    }
}

/// Normalized form of a presented code, safe to use as an index prefix.
fn recorded_code(raw: &str) -> String {
    raw.trim()
        .to_ascii_uppercase()
        .chars()
        .filter(|c| c.is_ascii_graphic() && *c != '|')
        .take(MAX_RECORDED_CODE_LEN)
        .collect()
}
