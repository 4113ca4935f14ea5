// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Venue Gate Server - Payment Confirmation & Ticket Admission
//!
//! Turns signed payment-gateway notifications into authoritative order and
//! ticket state, and decides admission when a ticket is scanned at the gate.
//!
//! ## Modules
//!
//! - `api` - HTTP API handlers (Axum)
//! - `webhook` - Notification verification, deduplication, and dispatch
//! - `admission` - Ticket codes, admission rules, and the scan ledger
//! - `notifications` - Post-commit customer and operator notices
//! - `credentials` - QR credential issuance on ticket activation
//! - `storage` - redb tables and the expiring key-value store

pub mod admission;
pub mod api;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod error;
pub mod models;
pub mod notifications;
pub mod state;
pub mod storage;
pub mod webhook;
