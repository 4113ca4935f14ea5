// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Source allow-list and timestamp freshness checks.

use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};

use super::error::WebhookError;
use crate::config::{Environment, MAX_NOTIFICATION_AGE_HOURS, MAX_NOTIFICATION_SKEW_HOURS};

/// Restricts deliveries to the gateway's published addresses.
///
/// Enforced in production only. An empty list in production admits nothing.
#[derive(Debug, Clone)]
pub struct SourceAllowList {
    allowed: Vec<IpAddr>,
    enforce: bool,
}

impl SourceAllowList {
    pub fn new(allowed: Vec<IpAddr>, environment: Environment) -> Self {
        Self {
            allowed,
            enforce: environment.is_production(),
        }
    }

    pub fn check(&self, source: Option<IpAddr>) -> Result<(), WebhookError> {
        if !self.enforce {
            return Ok(());
        }
        match source {
            Some(ip) if self.allowed.contains(&canonical(ip)) => Ok(()),
            _ => Err(WebhookError::UntrustedSource),
        }
    }
}

/// IPv4-mapped IPv6 addresses compare as their IPv4 form.
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// Rejects notifications whose payment timestamp is too old or too far ahead.
#[derive(Debug, Clone, Copy)]
pub struct FreshnessGuard {
    max_age: Duration,
    max_skew: Duration,
}

impl Default for FreshnessGuard {
    fn default() -> Self {
        Self {
            max_age: Duration::hours(MAX_NOTIFICATION_AGE_HOURS),
            max_skew: Duration::hours(MAX_NOTIFICATION_SKEW_HOURS),
        }
    }
}

impl FreshnessGuard {
    pub fn check(&self, paid_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<(), WebhookError> {
        if paid_at < now - self.max_age || paid_at > now + self.max_skew {
            return Err(WebhookError::Stale);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::net::{Ipv4Addr, Ipv6Addr};

    fn gateway() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(52, 31, 139, 75))
    }

    #[test]
    fn production_enforces_list() {
        let list = SourceAllowList::new(vec![gateway()], Environment::Production);
        assert!(list.check(Some(gateway())).is_ok());
        assert!(matches!(
            list.check(Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))),
            Err(WebhookError::UntrustedSource)
        ));
        assert!(list.check(None).is_err());
    }

    #[test]
    fn mapped_ipv6_matches_ipv4_entry() {
        let list = SourceAllowList::new(vec![gateway()], Environment::Production);
        let mapped = IpAddr::V6(Ipv4Addr::new(52, 31, 139, 75).to_ipv6_mapped());
        assert!(list.check(Some(mapped)).is_ok());
        assert!(list.check(Some(IpAddr::V6(Ipv6Addr::LOCALHOST))).is_err());
    }

    #[test]
    fn empty_list_in_production_rejects_everything() {
        let list = SourceAllowList::new(Vec::new(), Environment::Production);
        assert!(list.check(Some(gateway())).is_err());
    }

    #[test]
    fn development_bypasses_list() {
        let list = SourceAllowList::new(Vec::new(), Environment::Development);
        assert!(list.check(Some(IpAddr::V4(Ipv4Addr::LOCALHOST))).is_ok());
        assert!(list.check(None).is_ok());
    }

    #[test]
    fn freshness_window_bounds() {
        let guard = FreshnessGuard::default();
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap();

        assert!(guard.check(now, now).is_ok());
        assert!(guard.check(now - Duration::hours(48), now).is_ok());
        assert!(guard.check(now + Duration::hours(1), now).is_ok());

        // Replay of a two-day-old capture
        assert!(matches!(
            guard.check(now - Duration::hours(49), now),
            Err(WebhookError::Stale)
        ));
        assert!(guard.check(now + Duration::minutes(61), now).is_err());
    }
}
