// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::net::{IpAddr, SocketAddr};

use axum::{
    body::to_bytes,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap},
    Json,
};

use crate::config::MAX_WEBHOOK_BODY_BYTES;
use crate::error::{ApiError, ErrorBody};
use crate::state::AppState;
use crate::webhook::{InboundWebhook, ProcessingResult};

pub const SIGNATURE_HEADER: &str = "x-gateway-signature";
pub const ALGORITHM_HEADER: &str = "x-gateway-signature-algorithm";
const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Address the delivery came from.
///
/// Behind a trusted proxy this is the last `x-forwarded-for` hop, the one
/// the proxy appended itself. Earlier hops come from the client and are
/// ignored. Without a trusted proxy it is the peer address of the connection.
fn source_address(state: &AppState, request: &Request) -> Option<IpAddr> {
    if state.trust_forwarded_for {
        let forwarded = header_str(request.headers(), FORWARDED_FOR_HEADER)
            .and_then(|v| v.rsplit(',').next())
            .and_then(|v| v.trim().parse().ok());
        if forwarded.is_some() {
            return forwarded;
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

/// Receive a payment gateway notification.
///
/// The signature covers the raw body, so the body is read as bytes and
/// parsed only after the size check.
#[utoipa::path(
    post,
    path = "/v1/webhooks/payments",
    tag = "Webhooks",
    params(
        ("x-gateway-signature" = String, Header, description = "Hex HMAC-SHA512 of the raw body"),
        ("x-gateway-signature-algorithm" = String, Header, description = "Must be hmac-sha512")
    ),
    request_body(content = serde_json::Value, description = "Gateway notification", content_type = "application/json"),
    responses(
        (status = 200, description = "Processed, duplicate, or ignored", body = ProcessingResult),
        (status = 400, description = "Malformed or stale notification", body = ErrorBody),
        (status = 401, description = "Missing or invalid signature or algorithm", body = ErrorBody),
        (status = 403, description = "Untrusted source", body = ErrorBody),
        (status = 409, description = "Delivery already in flight, retry later", body = ErrorBody),
        (status = 413, description = "Body too large", body = ErrorBody),
        (status = 422, description = "Rejected by a business rule", body = ErrorBody),
        (status = 429, description = "Rate limit exceeded", body = ErrorBody),
        (status = 500, description = "Internal error, retry later", body = ErrorBody)
    )
)]
pub async fn receive_payment_webhook(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<ProcessingResult>, ApiError> {
    let declared_len = header_str(request.headers(), header::CONTENT_LENGTH.as_str())
        .and_then(|v| v.parse::<usize>().ok());
    if declared_len.is_some_and(|len| len > MAX_WEBHOOK_BODY_BYTES) {
        return Err(ApiError::payload_too_large("webhook body exceeds size limit")
            .with_code("payload_too_large"));
    }

    let source = source_address(&state, &request);
    let signature = header_str(request.headers(), SIGNATURE_HEADER).map(str::to_owned);
    let algorithm = header_str(request.headers(), ALGORITHM_HEADER).map(str::to_owned);

    let body = to_bytes(request.into_body(), MAX_WEBHOOK_BODY_BYTES)
        .await
        .map_err(|e| {
            tracing::warn!(error = %e, "Failed to read webhook body");
            ApiError::bad_request("webhook body could not be read").with_code("unreadable_body")
        })?;

    let result = state
        .processor
        .process(InboundWebhook {
            body: &body,
            signature: signature.as_deref(),
            algorithm: algorithm.as_deref(),
            source,
        })
        .await?;

    Ok(Json(result))
}
