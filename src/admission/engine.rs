// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Admission rules.
//!
//! [`evaluate`] is pure: it looks at a ticket (or its absence) and the
//! current time and returns a decision. [`apply`] folds a decision back into
//! the ticket. Rules are checked in a fixed order and the first match wins:
//!
//! | # | Condition | Reason |
//! |---|-----------|--------|
//! | 1 | no ticket | `ticket not found` |
//! | 2 | `CANCELLED` | `ticket cancelled` |
//! | 3 | `EXPIRED` | `ticket expired` |
//! | 3a | `PENDING` | `ticket not active` |
//! | 4 | `now > valid_until` | `validity period expired` (ticket becomes `EXPIRED`) |
//! | 5 | `scan_count >= max_scans` | `maximum scan limit reached` |
//! | 6 | scan window elapsed | `scan window expired` |
//! | 7 | otherwise | allowed |

use chrono::{DateTime, Utc};

use crate::storage::{Ticket, TicketStatus};

pub const REASON_NOT_FOUND: &str = "ticket not found";
pub const REASON_CANCELLED: &str = "ticket cancelled";
pub const REASON_EXPIRED: &str = "ticket expired";
pub const REASON_NOT_ACTIVE: &str = "ticket not active";
pub const REASON_VALIDITY_EXPIRED: &str = "validity period expired";
pub const REASON_MAX_SCANS: &str = "maximum scan limit reached";
pub const REASON_WINDOW_EXPIRED: &str = "scan window expired";
pub const REASON_INVALID_FORMAT: &str = "invalid ticket code format";
pub const REASON_UNAVAILABLE: &str = "admission service unavailable";
pub const REASON_SCANNER_MISSING: &str = "scanner not identified";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: String,
    /// Scans left after this one, when a ticket was found.
    pub remaining_scans: Option<u32>,
    /// Days left in the re-entry window, when one applies.
    pub remaining_days: Option<i64>,
    /// The ticket passed its validity deadline and must be marked expired.
    pub expire_ticket: bool,
}

impl AdmissionDecision {
    pub fn denied(reason: &str) -> Self {
        Self {
            allowed: false,
            reason: reason.to_string(),
            remaining_scans: None,
            remaining_days: None,
            expire_ticket: false,
        }
    }
}

/// Whole days from `from` to `to`, rounded toward zero.
pub fn days_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_days()
}

pub fn evaluate(ticket: Option<&Ticket>, now: DateTime<Utc>) -> AdmissionDecision {
    let Some(ticket) = ticket else {
        return AdmissionDecision::denied(REASON_NOT_FOUND);
    };

    match ticket.status {
        TicketStatus::Cancelled => return AdmissionDecision::denied(REASON_CANCELLED),
        TicketStatus::Expired => return AdmissionDecision::denied(REASON_EXPIRED),
        TicketStatus::Pending => return AdmissionDecision::denied(REASON_NOT_ACTIVE),
        TicketStatus::Active | TicketStatus::Scanned => {}
    }

    if now > ticket.valid_until {
        return AdmissionDecision {
            expire_ticket: true,
            ..AdmissionDecision::denied(REASON_VALIDITY_EXPIRED)
        };
    }

    if ticket.scan_count >= ticket.max_scans {
        return AdmissionDecision::denied(REASON_MAX_SCANS);
    }

    let mut remaining_days = None;
    if let Some(window) = ticket.scan_window_days {
        let elapsed = ticket
            .first_scan_at
            .map(|first| days_between(first, now))
            .unwrap_or(0);
        if elapsed > i64::from(window) {
            return AdmissionDecision::denied(REASON_WINDOW_EXPIRED);
        }
        remaining_days = Some(i64::from(window) - elapsed);
    }

    let remaining_scans = ticket.remaining_scans() - 1;
    let mut reason = format!("entry allowed, {remaining_scans} scans remaining");
    if let Some(days) = remaining_days {
        reason.push_str(&format!(", {days} days left in scan window"));
    }

    AdmissionDecision {
        allowed: true,
        reason,
        remaining_scans: Some(remaining_scans),
        remaining_days,
        expire_ticket: false,
    }
}

/// Apply `decision` to `ticket`. Returns whether the ticket changed.
///
/// Denials leave the ticket alone, except for the transition to `EXPIRED`.
pub fn apply(ticket: &mut Ticket, decision: &AdmissionDecision, now: DateTime<Utc>) -> bool {
    if decision.expire_ticket {
        ticket.status = TicketStatus::Expired;
        ticket.updated_at = now;
        return true;
    }
    if !decision.allowed {
        return false;
    }

    ticket.scan_count += 1;
    ticket.last_scan_at = Some(now);
    if ticket.first_scan_at.is_none() {
        ticket.first_scan_at = Some(now);
    }
    if ticket.scan_count >= ticket.max_scans {
        ticket.status = TicketStatus::Scanned;
    }
    ticket.updated_at = now;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 18, 19, 0, 0).unwrap()
    }

    fn active(max_scans: u32, window: Option<u32>) -> Ticket {
        let mut ticket = Ticket::new_pending(
            "t1",
            "EVT-2026-AAAAAA",
            "o1",
            "s1",
            now() + Duration::days(30),
            max_scans,
            window,
        );
        ticket.status = TicketStatus::Active;
        ticket
    }

    #[test]
    fn missing_ticket() {
        let decision = evaluate(None, now());
        assert!(!decision.allowed);
        assert_eq!(decision.reason, REASON_NOT_FOUND);
    }

    #[test]
    fn status_rules_precede_deadline() {
        for (status, reason) in [
            (TicketStatus::Cancelled, REASON_CANCELLED),
            (TicketStatus::Expired, REASON_EXPIRED),
            (TicketStatus::Pending, REASON_NOT_ACTIVE),
        ] {
            let mut ticket = active(1, None);
            ticket.status = status;
            ticket.valid_until = now() - Duration::days(1);
            let decision = evaluate(Some(&ticket), now());
            assert_eq!(decision.reason, reason);
            assert!(!decision.expire_ticket);
        }
    }

    #[test]
    fn past_deadline_expires_ticket() {
        let mut ticket = active(1, None);
        ticket.valid_until = now() - Duration::seconds(1);

        let decision = evaluate(Some(&ticket), now());
        assert_eq!(decision.reason, REASON_VALIDITY_EXPIRED);
        assert!(decision.expire_ticket);

        assert!(apply(&mut ticket, &decision, now()));
        assert_eq!(ticket.status, TicketStatus::Expired);
        assert_eq!(ticket.scan_count, 0);

        // Next scan hits the status rule
        assert_eq!(evaluate(Some(&ticket), now()).reason, REASON_EXPIRED);
    }

    #[test]
    fn deadline_is_inclusive() {
        let mut ticket = active(1, None);
        ticket.valid_until = now();
        assert!(evaluate(Some(&ticket), now()).allowed);
    }

    #[test]
    fn single_use_ticket_scans_once() {
        let mut ticket = active(1, None);

        let first = evaluate(Some(&ticket), now());
        assert!(first.allowed);
        assert_eq!(first.remaining_scans, Some(0));
        apply(&mut ticket, &first, now());
        assert_eq!(ticket.status, TicketStatus::Scanned);
        assert_eq!(ticket.first_scan_at, Some(now()));

        let second = evaluate(Some(&ticket), now() + Duration::minutes(1));
        assert!(!second.allowed);
        assert_eq!(second.reason, REASON_MAX_SCANS);
        assert!(!apply(&mut ticket, &second, now()));
        assert_eq!(ticket.scan_count, 1);
    }

    #[test]
    fn multi_entry_ticket_stays_active_until_exhausted() {
        let mut ticket = active(3, None);
        for expected_remaining in [2, 1, 0] {
            let decision = evaluate(Some(&ticket), now());
            assert_eq!(decision.remaining_scans, Some(expected_remaining));
            apply(&mut ticket, &decision, now());
        }
        assert_eq!(ticket.status, TicketStatus::Scanned);
        assert_eq!(ticket.scan_count, 3);
    }

    #[test]
    fn scan_window_counts_whole_days_from_first_scan() {
        let mut ticket = active(10, Some(14));
        let first = evaluate(Some(&ticket), now());
        assert_eq!(first.remaining_days, Some(14));
        assert!(first.reason.contains("14 days left"));
        apply(&mut ticket, &first, now());

        let day14 = now() + Duration::days(14) + Duration::hours(23);
        let decision = evaluate(Some(&ticket), day14);
        assert!(decision.allowed);
        assert_eq!(decision.remaining_days, Some(0));

        let day15 = now() + Duration::days(15);
        let decision = evaluate(Some(&ticket), day15);
        assert!(!decision.allowed);
        assert_eq!(decision.reason, REASON_WINDOW_EXPIRED);
        assert!(!apply(&mut ticket, &decision, day15));
        assert_eq!(ticket.status, TicketStatus::Active);
    }

    #[test]
    fn days_between_truncates() {
        assert_eq!(days_between(now(), now() + Duration::hours(47)), 1);
        assert_eq!(days_between(now(), now()), 0);
    }
}
