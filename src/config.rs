// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Environment variable names, policy constants, and the [`ServiceConfig`]
//! loader used at startup.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `DATA_DIR` | Directory holding the redb database | `/data` |
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `APP_ENV` | `production` or `development` | `production` |
//! | `GATEWAY_WEBHOOK_SECRET` | Shared secret for webhook signatures | Required |
//! | `GATEWAY_ALLOWED_IPS` | Comma-separated gateway source addresses | Empty |
//! | `TRUST_FORWARDED_FOR` | Take the source address from `x-forwarded-for` | `false` |
//! | `WEBHOOK_RATE_LIMIT` | Deliveries allowed per source per window | `60` |
//! | `WEBHOOK_RATE_WINDOW_SECS` | Rate-limit window length | `60` |
//! | `CREDENTIALS_DIR` | Prefix for generated QR credential paths | `qr` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |

use std::{env, net::IpAddr, path::PathBuf, time::Duration};

/// Environment variable name for the data directory path.
pub const DATA_DIR_ENV: &str = "DATA_DIR";
pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";
pub const APP_ENV_ENV: &str = "APP_ENV";
pub const WEBHOOK_SECRET_ENV: &str = "GATEWAY_WEBHOOK_SECRET";
pub const ALLOWED_IPS_ENV: &str = "GATEWAY_ALLOWED_IPS";
pub const TRUST_FORWARDED_FOR_ENV: &str = "TRUST_FORWARDED_FOR";
pub const RATE_LIMIT_ENV: &str = "WEBHOOK_RATE_LIMIT";
pub const RATE_WINDOW_ENV: &str = "WEBHOOK_RATE_WINDOW_SECS";
pub const CREDENTIALS_DIR_ENV: &str = "CREDENTIALS_DIR";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

pub const DEFAULT_DATA_DIR: &str = "/data";
pub const DEFAULT_LOG_FILTER: &str = "info,tower_http=debug";

/// Name of the redb file inside `DATA_DIR`.
pub const DATABASE_FILE: &str = "venue.redb";

// =============================================================================
// Policy constants
// =============================================================================

/// TTL of a webhook processing lock.
pub const LOCK_TTL: Duration = Duration::from_secs(120);

/// Retention of idempotency records.
pub const IDEMPOTENCY_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Oldest accepted notification timestamp, in hours.
pub const MAX_NOTIFICATION_AGE_HOURS: i64 = 48;

/// Furthest accepted future skew of a notification timestamp, in hours.
pub const MAX_NOTIFICATION_SKEW_HOURS: i64 = 1;

/// Allowed deviation between paid and expected amount, in percent.
pub const AMOUNT_TOLERANCE_PERCENT: i64 = 1;

/// Bounds of the random delay added after an authentication failure.
pub const AUTH_FAILURE_JITTER_MS: (u64, u64) = (100, 300);

/// Upper bound on the payment-success transaction.
pub const COMMIT_TIMEOUT: Duration = Duration::from_secs(15);

/// Upper bound on lock and ledger operations.
pub const LOCK_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on one gate scan before the gate fails closed.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between idempotency retention sweeps.
pub const LEDGER_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Only accepted value of the signature algorithm header.
pub const SIGNATURE_ALGORITHM: &str = "hmac-sha512";

pub const DEFAULT_RATE_LIMIT: u64 = 60;
pub const DEFAULT_RATE_WINDOW_SECS: u64 = 60;

/// Largest accepted webhook body.
pub const MAX_WEBHOOK_BODY_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Deployment flavour. Only development relaxes the source allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Development,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

/// Settings consumed by the webhook guards.
#[derive(Debug, Clone)]
pub struct WebhookSettings {
    pub secret: String,
    pub allowed_sources: Vec<IpAddr>,
    pub trust_forwarded_for: bool,
    pub rate_limit: u64,
    pub rate_window: Duration,
}

/// Fully resolved service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub environment: Environment,
    pub credentials_dir: String,
    pub webhook: WebhookSettings,
}

impl ServiceConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary lookup function.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let environment = match get(APP_ENV_ENV).as_deref() {
            None | Some("production") => Environment::Production,
            Some("development") | Some("dev") => Environment::Development,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: APP_ENV_ENV,
                    reason: format!("expected `production` or `development`, got `{other}`"),
                })
            }
        };

        let secret = get(WEBHOOK_SECRET_ENV).ok_or(ConfigError::Missing(WEBHOOK_SECRET_ENV))?;

        let allowed_sources = match get(ALLOWED_IPS_ENV) {
            Some(raw) => parse_ip_list(&raw)?,
            None => Vec::new(),
        };

        let port = match get(PORT_ENV) {
            Some(raw) => raw.parse::<u16>().map_err(|e| ConfigError::Invalid {
                name: PORT_ENV,
                reason: e.to_string(),
            })?,
            None => 8080,
        };

        Ok(Self {
            host: get(HOST_ENV).unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            data_dir: PathBuf::from(get(DATA_DIR_ENV).unwrap_or_else(|| DEFAULT_DATA_DIR.into())),
            environment,
            credentials_dir: get(CREDENTIALS_DIR_ENV).unwrap_or_else(|| "qr".to_string()),
            webhook: WebhookSettings {
                secret,
                allowed_sources,
                trust_forwarded_for: parse_bool(get(TRUST_FORWARDED_FOR_ENV).as_deref()),
                rate_limit: parse_u64(get(RATE_LIMIT_ENV), RATE_LIMIT_ENV, DEFAULT_RATE_LIMIT)?,
                rate_window: Duration::from_secs(parse_u64(
                    get(RATE_WINDOW_ENV),
                    RATE_WINDOW_ENV,
                    DEFAULT_RATE_WINDOW_SECS,
                )?),
            },
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }
}

fn parse_ip_list(raw: &str) -> Result<Vec<IpAddr>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpAddr>().map_err(|e| ConfigError::Invalid {
                name: ALLOWED_IPS_ENV,
                reason: format!("`{s}`: {e}"),
            })
        })
        .collect()
}

fn parse_bool(raw: Option<&str>) -> bool {
    matches!(raw, Some("1") | Some("true") | Some("yes"))
}

fn parse_u64(raw: Option<String>, name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => match value.parse::<u64>() {
            Ok(0) => Err(ConfigError::Invalid {
                name,
                reason: "must be greater than zero".to_string(),
            }),
            Ok(n) => Ok(n),
            Err(e) => Err(ConfigError::Invalid {
                name,
                reason: e.to_string(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn secret_is_required() {
        let err = ServiceConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(WEBHOOK_SECRET_ENV)));
    }

    #[test]
    fn defaults_apply() {
        let config =
            ServiceConfig::from_lookup(lookup(&[(WEBHOOK_SECRET_ENV, "sk_test")])).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.webhook.rate_limit, DEFAULT_RATE_LIMIT);
        assert!(config.webhook.allowed_sources.is_empty());
        assert_eq!(config.database_path(), PathBuf::from("/data/venue.redb"));
    }

    #[test]
    fn parses_allow_list_and_environment() {
        let config = ServiceConfig::from_lookup(lookup(&[
            (WEBHOOK_SECRET_ENV, "sk_test"),
            (ALLOWED_IPS_ENV, "52.31.139.75, 52.49.173.169"),
            (APP_ENV_ENV, "development"),
            (RATE_LIMIT_ENV, "10"),
        ]))
        .unwrap();
        assert_eq!(config.webhook.allowed_sources.len(), 2);
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.webhook.rate_limit, 10);
    }

    #[test]
    fn rejects_bad_ip() {
        let err = ServiceConfig::from_lookup(lookup(&[
            (WEBHOOK_SECRET_ENV, "sk_test"),
            (ALLOWED_IPS_ENV, "not-an-ip"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: ALLOWED_IPS_ENV, .. }));
    }

    #[test]
    fn rejects_zero_rate_limit() {
        let err = ServiceConfig::from_lookup(lookup(&[
            (WEBHOOK_SECRET_ENV, "sk_test"),
            (RATE_LIMIT_ENV, "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: RATE_LIMIT_ENV, .. }));
    }
}
