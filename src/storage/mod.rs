// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Storage Module
//!
//! Two tiers back the service:
//!
//! - **redb** ([`VenueDatabase`]): durable, ACID storage for orders, tickets,
//!   the append-only scan ledger, customer aggregates, the durable side of the
//!   idempotency ledger, and the audit log.
//! - **Fast store** ([`KeyValueStore`]): expiring keys for locks, rate
//!   counters, and the cached side of the idempotency ledger.
//!
//! ## Storage Layout
//!
//! ```text
//! $DATA_DIR/
//!   venue.redb     # All durable tables
//! ```

pub mod audit;
pub mod cache;
pub mod database;
pub mod records;

pub use audit::{AuditEvent, AuditEventType};
pub use cache::{CacheError, CacheResult, KeyValueStore, MemoryStore};
pub use database::{BoundedTxn, DbError, DbResult, VenueDatabase, VenueTxn};
pub use records::{
    Customer, IdempotencyRecord, IdempotencyStatus, Order, OrderStatus, PaymentMetadata, Ticket,
    TicketScan, TicketStatus,
};
