// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    http::HeaderName,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    error::ErrorBody,
    models::{ScanHistoryResponse, ScanResponse, ScanTicketRequest},
    state::AppState,
    storage::TicketScan,
    webhook::{ProcessingResult, ProcessingStatus},
};

pub mod health;
pub mod scans;
pub mod webhooks;

const REQUEST_ID_HEADER: &str = "x-request-id";

pub fn router(state: AppState) -> Router {
    let v1_routes = Router::new()
        .route("/webhooks/payments", post(webhooks::receive_payment_webhook))
        .route("/tickets/scan", post(scans::scan_ticket))
        .route("/tickets/{code}/scans", get(scans::scan_history))
        .with_state(state.clone());

    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .with_state(state);

    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);

    Router::new()
        .nest("/v1", v1_routes)
        .merge(health_routes)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id)),
        )
        .layer(CorsLayer::permissive())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        webhooks::receive_payment_webhook,
        scans::scan_ticket,
        scans::scan_history,
        health::health,
        health::liveness,
        health::readiness
    ),
    components(
        schemas(
            ProcessingResult,
            ProcessingStatus,
            ErrorBody,
            ScanTicketRequest,
            ScanResponse,
            ScanHistoryResponse,
            TicketScan,
            health::ReadyResponse,
            health::HealthChecks,
            health::HealthResponse
        )
    ),
    tags(
        (name = "Webhooks", description = "Payment gateway notifications"),
        (name = "Admission", description = "Ticket scanning at the gate"),
        (name = "Health", description = "Liveness and readiness checks")
    )
)]
struct ApiDoc;
