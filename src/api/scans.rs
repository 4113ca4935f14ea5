// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    extract::{Path, Query, State},
    Json,
};

use crate::admission::ScanRequest;
use crate::error::{ApiError, ErrorBody};
use crate::models::{ScanHistoryQuery, ScanHistoryResponse, ScanResponse, ScanTicketRequest};
use crate::state::AppState;

/// Scan a ticket at the gate.
///
/// Always answers with a decision and records the attempt. Storage trouble
/// or a missing scanner id yields a denial, never an error.
#[utoipa::path(
    post,
    path = "/v1/tickets/scan",
    tag = "Admission",
    request_body = ScanTicketRequest,
    responses(
        (status = 200, description = "Admission decision", body = ScanResponse)
    )
)]
pub async fn scan_ticket(
    State(state): State<AppState>,
    Json(request): Json<ScanTicketRequest>,
) -> Json<ScanResponse> {
    let outcome = state
        .gate
        .scan(ScanRequest {
            code: request.ticket_code,
            scanner_id: request.scanner_id,
            location: request
                .location
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty()),
        })
        .await;

    Json(outcome.into())
}

/// List recorded scans for a ticket code, newest first.
#[utoipa::path(
    get,
    path = "/v1/tickets/{code}/scans",
    tag = "Admission",
    params(
        ("code" = String, Path, description = "Ticket code"),
        ScanHistoryQuery
    ),
    responses(
        (status = 200, description = "Scan history", body = ScanHistoryResponse),
        (status = 500, description = "Storage unavailable", body = ErrorBody)
    )
)]
pub async fn scan_history(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(query): Query<ScanHistoryQuery>,
) -> Result<Json<ScanHistoryResponse>, ApiError> {
    let scans = state
        .gate
        .history(&code, query.effective_limit())
        .await
        .map_err(|e| {
            tracing::error!(code = %code, error = %e, "Failed to load scan history");
            ApiError::internal("scan history unavailable")
        })?;

    Ok(Json(ScanHistoryResponse {
        ticket_code: code.trim().to_ascii_uppercase(),
        scans,
    }))
}
