// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use crate::admission::GateService;
use crate::clock::Clock;
use crate::config::ServiceConfig;
use crate::credentials::QrPathIssuer;
use crate::notifications::NotificationQueue;
use crate::storage::{KeyValueStore, VenueDatabase};
use crate::webhook::WebhookProcessor;

#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<WebhookProcessor>,
    pub gate: GateService,
    pub db: Arc<VenueDatabase>,
    pub cache: Arc<dyn KeyValueStore>,
    /// Take the webhook source address from `x-forwarded-for`.
    pub trust_forwarded_for: bool,
}

impl AppState {
    pub fn new(
        config: &ServiceConfig,
        db: Arc<VenueDatabase>,
        cache: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        notifications: NotificationQueue,
    ) -> Self {
        let processor = WebhookProcessor::new(
            &config.webhook,
            config.environment,
            Arc::clone(&db),
            Arc::clone(&cache),
            Arc::clone(&clock),
            Arc::new(QrPathIssuer::new(config.credentials_dir.clone())),
            notifications,
        );
        Self {
            processor: Arc::new(processor),
            gate: GateService::new(Arc::clone(&db), clock),
            db,
            cache,
            trust_forwarded_for: config.webhook.trust_forwarded_for,
        }
    }
}
