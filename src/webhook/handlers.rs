// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Per-event state changes, each run inside one write transaction.
//!
//! Handlers never enqueue notifications themselves. They return the jobs in
//! [`HandlerOutcome`] and the processor enqueues them after commit.
//!
//! A business-rule rejection is a successful handler run: nothing but the
//! audit row is written and the outcome carries [`Disposition::Rejected`].
//! Returning `Err` aborts the transaction.

use chrono::{DateTime, Utc};
use serde_json::json;

use super::error::{BusinessRule, WebhookError};
use super::payload::{EventKind, Notification};
use super::reconcile::{reconcile, Reconciliation};
use crate::credentials::CredentialIssuer;
use crate::notifications::{AlertUrgency, NotificationJob};
use crate::storage::{
    AuditEvent, AuditEventType, Customer, Order, OrderStatus, TicketStatus, VenueTxn,
};

pub struct HandlerContext<'a> {
    pub now: DateTime<Utc>,
    pub credentials: &'a dyn CredentialIssuer,
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    /// Acknowledged without changes.
    Ignored,
    Rejected(BusinessRule),
}

#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    pub disposition: Disposition,
    pub order_id: Option<String>,
    pub tickets_activated: usize,
    pub tickets_cancelled: usize,
    pub requires_manual_review: bool,
    pub notifications: Vec<NotificationJob>,
}

impl HandlerOutcome {
    fn applied(order_id: Option<String>) -> Self {
        Self {
            disposition: Disposition::Applied,
            order_id,
            tickets_activated: 0,
            tickets_cancelled: 0,
            requires_manual_review: false,
            notifications: Vec::new(),
        }
    }

    pub fn ignored() -> Self {
        Self {
            disposition: Disposition::Ignored,
            ..Self::applied(None)
        }
    }

    fn rejected(rule: BusinessRule, order_id: Option<String>) -> Self {
        Self {
            disposition: Disposition::Rejected(rule),
            ..Self::applied(order_id)
        }
    }
}

pub fn handle(
    txn: &VenueTxn<'_>,
    notification: &Notification,
    ctx: &HandlerContext<'_>,
) -> Result<HandlerOutcome, WebhookError> {
    match notification.event {
        EventKind::PaymentSucceeded => payment_succeeded(txn, notification, ctx),
        EventKind::PaymentFailed => payment_failed(txn, notification, ctx),
        EventKind::PaymentDisputed => payment_disputed(txn, notification, ctx),
        EventKind::RefundProcessed => refund_processed(txn, notification, ctx),
        EventKind::TransferSucceeded | EventKind::TransferFailed => {
            transfer_settled(txn, notification, ctx)
        }
        EventKind::Unknown(_) => Ok(HandlerOutcome::ignored()),
    }
}

fn audit(
    event_type: AuditEventType,
    notification: &Notification,
    ctx: &HandlerContext<'_>,
) -> AuditEvent {
    let event = AuditEvent::new(event_type, ctx.now).with_resource("payment", &notification.reference);
    match &ctx.source {
        Some(ip) => event.with_ip(ip.as_str()),
        None => event,
    }
}

fn reject(
    txn: &VenueTxn<'_>,
    notification: &Notification,
    ctx: &HandlerContext<'_>,
    rule: BusinessRule,
    order: Option<&Order>,
) -> Result<HandlerOutcome, WebhookError> {
    tracing::warn!(
        event = notification.event_name(),
        reference = %notification.reference,
        rule = rule.code(),
        "Notification rejected by business rule"
    );
    txn.append_audit(
        &audit(AuditEventType::PaymentRejected, notification, ctx)
            .with_details(json!({
                "event": notification.event_name(),
                "order_id": order.map(|o| o.order_id.as_str()),
                "amount": notification.amount,
            }))
            .failed(rule.to_string()),
    )?;
    Ok(HandlerOutcome::rejected(
        rule,
        order.map(|o| o.order_id.clone()),
    ))
}

// =============================================================================
// charge.success
// =============================================================================

fn payment_succeeded(
    txn: &VenueTxn<'_>,
    notification: &Notification,
    ctx: &HandlerContext<'_>,
) -> Result<HandlerOutcome, WebhookError> {
    let Some(mut order) = txn.get_order_by_reference(&notification.reference)? else {
        return reject(txn, notification, ctx, BusinessRule::OrderNotFound, None);
    };

    match order.status {
        OrderStatus::Pending => {}
        OrderStatus::Completed => {
            return reject(
                txn,
                notification,
                ctx,
                BusinessRule::OrderAlreadyCompleted,
                Some(&order),
            )
        }
        OrderStatus::Cancelled => {
            return reject(txn, notification, ctx, BusinessRule::OrderNotPending, Some(&order))
        }
    }

    if !notification.status.eq_ignore_ascii_case("success") {
        let rule = BusinessRule::UnexpectedStatus(notification.status.clone());
        return reject(txn, notification, ctx, rule, Some(&order));
    }

    let paid = notification.amount;
    let reconciliation = reconcile(order.amount, paid);
    if let Reconciliation::Underpaid { .. } = reconciliation {
        let rule = BusinessRule::Underpayment {
            expected: order.amount,
            paid,
        };
        let mut outcome = reject(txn, notification, ctx, rule, Some(&order))?;
        outcome.notifications.push(NotificationJob::PaymentMismatchAlert {
            order_id: order.order_id.clone(),
            reference: notification.reference.clone(),
            expected: order.amount,
            paid,
            urgency: AlertUrgency::High,
        });
        return Ok(outcome);
    }

    // Order
    order.status = OrderStatus::Completed;
    order.payment_status = Some("success".to_string());
    order.paid_amount = Some(paid);
    order.paid_at = notification.paid_at;
    order.payment_method = notification.payment_channel();
    order.updated_at = ctx.now;

    let metadata = &mut order.payment_metadata;
    metadata.channel = notification.payment_channel();
    metadata.gateway_response = notification.gateway_response.clone();
    if let Some(auth) = &notification.authorization {
        metadata.card_fingerprint = auth.signature.clone();
        metadata.card_last4 = auth.last4.clone();
    }
    let mut requires_review = false;
    if let Reconciliation::Overpaid { excess } = reconciliation {
        metadata.overpayment = Some(excess);
        metadata.requires_manual_review = true;
        metadata.anomaly_flags.push("overpayment".to_string());
        requires_review = true;
    }
    txn.put_order(&order)?;

    // Customer aggregates
    let mut customer = txn
        .get_customer(&order.customer_id)?
        .unwrap_or_else(|| Customer::new(&order.customer_id, None));
    if customer.email.is_none() {
        customer.email = notification.customer_email.clone();
    }
    customer.total_spent = customer.total_spent.saturating_add(paid);
    customer.order_count = customer.order_count.saturating_add(1);
    customer.last_order_at = Some(ctx.now);
    txn.put_customer(&customer)?;

    // Tickets
    let mut activated = Vec::new();
    for mut ticket in txn.tickets_for_order(&order.order_id)? {
        if ticket.status != TicketStatus::Pending {
            continue;
        }
        let credential = ctx
            .credentials
            .issue(&ticket)
            .map_err(|e| WebhookError::Infrastructure(e.to_string()))?;
        ticket.status = TicketStatus::Active;
        ticket.credential_path = Some(credential);
        ticket.activated_at = Some(ctx.now);
        ticket.updated_at = ctx.now;
        txn.put_ticket(&ticket)?;
        activated.push(ticket.code);
    }

    txn.append_audit(
        &audit(AuditEventType::PaymentConfirmed, notification, ctx).with_details(json!({
            "order_id": order.order_id,
            "expected": order.amount,
            "paid": paid,
            "requires_manual_review": requires_review,
        })),
    )?;
    if !activated.is_empty() {
        txn.append_audit(
            &AuditEvent::new(AuditEventType::TicketsActivated, ctx.now)
                .with_resource("order", &order.order_id)
                .with_details(json!({ "ticket_codes": activated })),
        )?;
    }

    tracing::info!(
        order_id = %order.order_id,
        reference = %notification.reference,
        tickets = activated.len(),
        requires_manual_review = requires_review,
        "Payment confirmed"
    );

    let mut outcome = HandlerOutcome::applied(Some(order.order_id.clone()));
    outcome.tickets_activated = activated.len();
    outcome.requires_manual_review = requires_review;
    if let Reconciliation::Overpaid { .. } = reconciliation {
        outcome.notifications.push(NotificationJob::PaymentMismatchAlert {
            order_id: order.order_id.clone(),
            reference: notification.reference.clone(),
            expected: order.amount,
            paid,
            urgency: AlertUrgency::Low,
        });
    }
    outcome.notifications.push(NotificationJob::PaymentConfirmation {
        order_id: order.order_id,
        reference: notification.reference.clone(),
        email: customer.email,
        ticket_codes: activated,
    });
    Ok(outcome)
}

// =============================================================================
// charge.failed
// =============================================================================

fn payment_failed(
    txn: &VenueTxn<'_>,
    notification: &Notification,
    ctx: &HandlerContext<'_>,
) -> Result<HandlerOutcome, WebhookError> {
    let Some(mut order) = txn.get_order_by_reference(&notification.reference)? else {
        return reject(txn, notification, ctx, BusinessRule::OrderNotFound, None);
    };
    if order.status != OrderStatus::Pending {
        return reject(txn, notification, ctx, BusinessRule::OrderNotPending, Some(&order));
    }

    order.payment_status = Some("failed".to_string());
    order.payment_metadata.gateway_response = notification.gateway_response.clone();
    order.payment_metadata.channel = notification.payment_channel();
    order.updated_at = ctx.now;
    txn.put_order(&order)?;

    txn.append_audit(
        &audit(AuditEventType::PaymentFailed, notification, ctx)
            .with_details(json!({ "order_id": order.order_id }))
            .failed(
                notification
                    .gateway_response
                    .clone()
                    .unwrap_or_else(|| "payment failed".to_string()),
            ),
    )?;

    let email = txn
        .get_customer(&order.customer_id)?
        .and_then(|c| c.email)
        .or_else(|| notification.customer_email.clone());

    let mut outcome = HandlerOutcome::applied(Some(order.order_id.clone()));
    outcome.notifications.push(NotificationJob::PaymentFailure {
        order_id: order.order_id,
        reference: notification.reference.clone(),
        email,
        reason: notification.gateway_response.clone(),
    });
    Ok(outcome)
}

// =============================================================================
// charge.dispute.create
// =============================================================================

fn payment_disputed(
    txn: &VenueTxn<'_>,
    notification: &Notification,
    ctx: &HandlerContext<'_>,
) -> Result<HandlerOutcome, WebhookError> {
    let Some(mut order) = txn.get_order_by_reference(&notification.reference)? else {
        return reject(txn, notification, ctx, BusinessRule::OrderNotFound, None);
    };

    let metadata = &mut order.payment_metadata;
    metadata.disputed = true;
    metadata.requires_manual_review = true;
    if !metadata.anomaly_flags.iter().any(|f| f == "dispute") {
        metadata.anomaly_flags.push("dispute".to_string());
    }
    order.payment_status = Some("disputed".to_string());
    order.updated_at = ctx.now;
    txn.put_order(&order)?;

    txn.append_audit(
        &audit(AuditEventType::PaymentDisputed, notification, ctx)
            .with_details(json!({ "order_id": order.order_id, "amount": notification.amount })),
    )?;
    tracing::warn!(order_id = %order.order_id, reference = %notification.reference, "Payment disputed");

    let mut outcome = HandlerOutcome::applied(Some(order.order_id.clone()));
    outcome.requires_manual_review = true;
    outcome.notifications.push(NotificationJob::DisputeAlert {
        order_id: order.order_id,
        reference: notification.reference.clone(),
        amount: notification.amount,
    });
    Ok(outcome)
}

// =============================================================================
// refund.processed
// =============================================================================

fn refund_processed(
    txn: &VenueTxn<'_>,
    notification: &Notification,
    ctx: &HandlerContext<'_>,
) -> Result<HandlerOutcome, WebhookError> {
    let Some(mut order) = txn.get_order_by_reference(&notification.reference)? else {
        return reject(txn, notification, ctx, BusinessRule::OrderNotFound, None);
    };

    // A completed order stays completed; the refund shows in payment_status
    if order.status == OrderStatus::Pending {
        order.status = OrderStatus::Cancelled;
    }
    order.payment_status = Some("refunded".to_string());
    order.updated_at = ctx.now;
    txn.put_order(&order)?;

    let mut cancelled = Vec::new();
    for mut ticket in txn.tickets_for_order(&order.order_id)? {
        if ticket.status.is_terminal() {
            continue;
        }
        ticket.status = TicketStatus::Cancelled;
        ticket.updated_at = ctx.now;
        txn.put_ticket(&ticket)?;
        txn.append_audit(
            &AuditEvent::new(AuditEventType::TicketCancelled, ctx.now)
                .with_resource("ticket", &ticket.ticket_id)
                .with_details(json!({ "code": ticket.code, "reason": "refund" })),
        )?;
        cancelled.push(ticket.code);
    }

    txn.append_audit(
        &audit(AuditEventType::PaymentRefunded, notification, ctx).with_details(json!({
            "order_id": order.order_id,
            "amount": notification.amount,
            "tickets_cancelled": cancelled.len(),
        })),
    )?;

    let mut outcome = HandlerOutcome::applied(Some(order.order_id));
    outcome.tickets_cancelled = cancelled.len();
    Ok(outcome)
}

// =============================================================================
// transfer.success / transfer.failed
// =============================================================================

fn transfer_settled(
    txn: &VenueTxn<'_>,
    notification: &Notification,
    ctx: &HandlerContext<'_>,
) -> Result<HandlerOutcome, WebhookError> {
    let event_type = match notification.event {
        EventKind::TransferSucceeded => AuditEventType::TransferSucceeded,
        _ => AuditEventType::TransferFailed,
    };
    let mut event = audit(event_type, notification, ctx).with_details(json!({
        "amount": notification.amount,
        "status": notification.status,
    }));
    if event_type == AuditEventType::TransferFailed {
        event = event.failed(
            notification
                .gateway_response
                .clone()
                .unwrap_or_else(|| notification.status.clone()),
        );
    }
    txn.append_audit(&event)?;
    Ok(HandlerOutcome::applied(None))
}
