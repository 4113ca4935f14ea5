// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded venue database backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `orders`: order_id → serialized Order
//! - `order_references`: payment reference → order_id
//! - `tickets`: ticket_id → serialized Ticket
//! - `ticket_codes`: ticket code → ticket_id
//! - `order_tickets`: `order_id|ticket_id` → ticket_id
//! - `ticket_scans`: scan_id → serialized TicketScan (append-only)
//! - `ticket_scan_index`: `code|!timestamp|scan_id` → scan_id
//! - `customers`: customer_id → serialized Customer
//! - `idempotency`: ledger key → serialized IdempotencyRecord
//! - `audit_log`: `timestamp|event_id` → serialized AuditEvent
//!
//! redb admits a single write transaction at a time, so every
//! read-decide-write performed inside [`VenueDatabase::transact`] is
//! serialized against all other writers.
//!
//! [`VenueDatabase::transact_bounded`] runs a transaction on the blocking
//! pool under a deadline. Caller and worker race for a single commit window:
//! either the caller gives up first and the worker rolls back, or the worker
//! starts committing first and the caller waits for the real result. A reply
//! never disagrees with what was written.

use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition,
    WriteTransaction,
};
use serde::{de::DeserializeOwned, Serialize};

use super::audit::AuditEvent;
use super::records::{Customer, IdempotencyRecord, Order, Ticket, TicketScan};

// =============================================================================
// Table Definitions
// =============================================================================

const ORDERS: TableDefinition<&str, &[u8]> = TableDefinition::new("orders");
const ORDER_REFERENCES: TableDefinition<&str, &str> = TableDefinition::new("order_references");
const TICKETS: TableDefinition<&str, &[u8]> = TableDefinition::new("tickets");
const TICKET_CODES: TableDefinition<&str, &str> = TableDefinition::new("ticket_codes");
const ORDER_TICKETS: TableDefinition<&str, &str> = TableDefinition::new("order_tickets");
const TICKET_SCANS: TableDefinition<&str, &[u8]> = TableDefinition::new("ticket_scans");

/// Key format: `code|!timestamp_be|scan_id` for newest-first range scans.
const TICKET_SCAN_INDEX: TableDefinition<&[u8], &str> = TableDefinition::new("ticket_scan_index");

const CUSTOMERS: TableDefinition<&str, &[u8]> = TableDefinition::new("customers");
const IDEMPOTENCY: TableDefinition<&str, &[u8]> = TableDefinition::new("idempotency");
const AUDIT_LOG: TableDefinition<&str, &[u8]> = TableDefinition::new("audit_log");

// =============================================================================
// Error Type
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transaction abandoned after its deadline")]
    Abandoned,
}

pub type DbResult<T> = Result<T, DbError>;

// =============================================================================
// Bounded Transactions
// =============================================================================

const WINDOW_OPEN: u8 = 0;
const WINDOW_COMMITTING: u8 = 1;
const WINDOW_ABANDONED: u8 = 2;

/// One-shot handshake between a waiting caller and a blocking transaction.
#[derive(Debug, Default)]
struct CommitWindow(AtomicU8);

impl CommitWindow {
    /// Worker side: reserve the right to commit.
    fn claim(&self) -> bool {
        self.0
            .compare_exchange(WINDOW_OPEN, WINDOW_COMMITTING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Caller side: give up on the transaction. False once a commit began.
    fn abandon(&self) -> bool {
        self.0
            .compare_exchange(WINDOW_OPEN, WINDOW_ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Result of [`VenueDatabase::transact_bounded`].
#[derive(Debug)]
pub enum BoundedTxn<T, E> {
    /// The closure ran; `Ok` values were committed, errors rolled back.
    Finished(Result<T, E>),
    /// The deadline passed before any commit began. Nothing was written.
    TimedOut,
    /// The blocking task panicked. Nothing was written.
    Failed(String),
}

// =============================================================================
// Key Helpers
// =============================================================================

fn order_ticket_key(order_id: &str, ticket_id: &str) -> String {
    format!("{order_id}|{ticket_id}")
}

/// Half-open `&str` range covering every `prefix|...` key.
/// `}` is the byte after `|`, so it bounds the prefix exactly.
fn prefix_bounds(prefix: &str) -> (String, String) {
    (format!("{prefix}|"), format!("{prefix}}}"))
}

fn make_scan_index_key(code: &str, timestamp: DateTime<Utc>, scan_id: &str) -> Vec<u8> {
    let micros = timestamp.timestamp_micros();
    let mut key = Vec::with_capacity(code.len() + 1 + 8 + 1 + scan_id.len());
    key.extend_from_slice(code.as_bytes());
    key.push(b'|');
    // Inverted for newest-first ordering
    key.extend_from_slice(&(!(micros as u64)).to_be_bytes());
    key.push(b'|');
    key.extend_from_slice(scan_id.as_bytes());
    key
}

fn make_scan_prefix(code: &str) -> (Vec<u8>, Vec<u8>) {
    let mut start = Vec::with_capacity(code.len() + 1);
    start.extend_from_slice(code.as_bytes());
    start.push(b'|');
    let mut end = start.clone();
    end.extend_from_slice(&[0xFF; 20]);
    (start, end)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> DbResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn encode<T: Serialize>(value: &T) -> DbResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

// =============================================================================
// VenueDatabase
// =============================================================================

/// Embedded ACID store for orders, tickets, scans, and the durable ledger.
pub struct VenueDatabase {
    db: Database,
}

impl VenueDatabase {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> DbResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ORDERS)?;
            let _ = write_txn.open_table(ORDER_REFERENCES)?;
            let _ = write_txn.open_table(TICKETS)?;
            let _ = write_txn.open_table(TICKET_CODES)?;
            let _ = write_txn.open_table(ORDER_TICKETS)?;
            let _ = write_txn.open_table(TICKET_SCANS)?;
            let _ = write_txn.open_table(TICKET_SCAN_INDEX)?;
            let _ = write_txn.open_table(CUSTOMERS)?;
            let _ = write_txn.open_table(IDEMPOTENCY)?;
            let _ = write_txn.open_table(AUDIT_LOG)?;
        }
        write_txn.commit()?;

        Ok(Self { db })
    }

    /// Run `f` inside one write transaction.
    ///
    /// The transaction commits only when `f` returns `Ok`; any error aborts
    /// it and leaves every table untouched.
    pub fn transact<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&VenueTxn<'_>) -> Result<T, E>,
        E: From<DbError>,
    {
        let write_txn = self.db.begin_write().map_err(DbError::from)?;
        let outcome = f(&VenueTxn { txn: &write_txn });
        match outcome {
            Ok(value) => {
                write_txn.commit().map_err(DbError::from)?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort_err) = write_txn.abort() {
                    tracing::warn!(error = %abort_err, "Failed to abort write transaction");
                }
                Err(e)
            }
        }
    }

    /// Like [`transact`](Self::transact), but only commits while `window`
    /// is still open.
    fn transact_within<T, E, F>(&self, window: &CommitWindow, f: F) -> Result<T, E>
    where
        F: FnOnce(&VenueTxn<'_>) -> Result<T, E>,
        E: From<DbError>,
    {
        self.transact(|txn| {
            let value = f(txn)?;
            if window.claim() {
                Ok(value)
            } else {
                Err(E::from(DbError::Abandoned))
            }
        })
    }

    /// Run `f` in a write transaction on the blocking pool, bounded by `limit`.
    pub async fn transact_bounded<T, E, F>(self: &Arc<Self>, limit: Duration, f: F) -> BoundedTxn<T, E>
    where
        F: FnOnce(&VenueTxn<'_>) -> Result<T, E> + Send + 'static,
        E: From<DbError> + Send + 'static,
        T: Send + 'static,
    {
        let window = Arc::new(CommitWindow::default());
        let worker_window = Arc::clone(&window);
        let db = Arc::clone(self);
        let mut handle =
            tokio::task::spawn_blocking(move || db.transact_within(&worker_window, f));

        let joined = match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_) if window.abandon() => return BoundedTxn::TimedOut,
            // Commit already under way; its outcome is the answer
            Err(_) => handle.await,
        };

        match joined {
            Ok(result) => BoundedTxn::Finished(result),
            Err(e) => BoundedTxn::Failed(e.to_string()),
        }
    }

    /// Cheap read used by readiness checks.
    pub fn ping(&self) -> DbResult<()> {
        let read_txn = self.db.begin_read()?;
        let _ = read_txn.open_table(ORDERS)?;
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn get_order(&self, order_id: &str) -> DbResult<Option<Order>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ORDERS)?;
        match table.get(order_id)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn get_order_by_reference(&self, reference: &str) -> DbResult<Option<Order>> {
        let order_id = {
            let read_txn = self.db.begin_read()?;
            let refs = read_txn.open_table(ORDER_REFERENCES)?;
            match refs.get(reference)? {
                Some(v) => v.value().to_string(),
                None => return Ok(None),
            }
        };
        self.get_order(&order_id)
    }

    pub fn get_ticket_by_code(&self, code: &str) -> DbResult<Option<Ticket>> {
        let read_txn = self.db.begin_read()?;
        let codes = read_txn.open_table(TICKET_CODES)?;
        let Some(ticket_id) = codes.get(code)?.map(|v| v.value().to_string()) else {
            return Ok(None);
        };
        let tickets = read_txn.open_table(TICKETS)?;
        match tickets.get(ticket_id.as_str())? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn tickets_for_order(&self, order_id: &str) -> DbResult<Vec<Ticket>> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(ORDER_TICKETS)?;
        let tickets = read_txn.open_table(TICKETS)?;
        let (start, end) = prefix_bounds(order_id);

        let mut result = Vec::new();
        for entry in index.range(start.as_str()..end.as_str())? {
            let (_, ticket_id) = entry?;
            if let Some(value) = tickets.get(ticket_id.value())? {
                result.push(decode(value.value())?);
            }
        }
        Ok(result)
    }

    pub fn get_customer(&self, customer_id: &str) -> DbResult<Option<Customer>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CUSTOMERS)?;
        match table.get(customer_id)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    /// Scan history for a ticket code, newest first.
    pub fn scans_for_code(&self, code: &str, limit: usize) -> DbResult<Vec<TicketScan>> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(TICKET_SCAN_INDEX)?;
        let scans = read_txn.open_table(TICKET_SCANS)?;
        let (start, end) = make_scan_prefix(code);

        let mut result = Vec::new();
        for entry in index.range(start.as_slice()..end.as_slice())? {
            let (_, scan_id) = entry?;
            if let Some(value) = scans.get(scan_id.value())? {
                result.push(decode(value.value())?);
            }
            if result.len() >= limit {
                break;
            }
        }
        Ok(result)
    }

    /// Total number of scan rows ever recorded.
    pub fn scan_count(&self) -> DbResult<u64> {
        let read_txn = self.db.begin_read()?;
        let scans = read_txn.open_table(TICKET_SCANS)?;
        Ok(scans.len()?)
    }

    /// Most recent audit events, newest first.
    pub fn recent_audit_events(&self, limit: usize) -> DbResult<Vec<AuditEvent>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(AUDIT_LOG)?;
        let mut result = Vec::new();
        for entry in table.iter()?.rev() {
            let (_, value) = entry?;
            result.push(decode(value.value())?);
            if result.len() >= limit {
                break;
            }
        }
        Ok(result)
    }

    pub fn get_idempotency(&self, key: &str) -> DbResult<Option<IdempotencyRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(IDEMPOTENCY)?;
        match table.get(key)? {
            Some(value) => Ok(Some(decode(value.value())?)),
            None => Ok(None),
        }
    }

    // =========================================================================
    // Single-statement writes
    // =========================================================================

    pub fn append_audit(&self, event: &AuditEvent) -> DbResult<()> {
        self.transact(|txn| txn.append_audit(event))
    }

    pub fn put_idempotency(&self, record: &IdempotencyRecord) -> DbResult<()> {
        self.transact(|txn| txn.put_idempotency(record))
    }

    /// Remove ledger records last touched before `cutoff`.
    pub fn purge_idempotency_before(&self, cutoff: DateTime<Utc>) -> DbResult<usize> {
        self.transact(|txn| {
            let mut table = txn.txn.open_table(IDEMPOTENCY)?;
            let mut stale = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                let record: IdempotencyRecord = decode(value.value())?;
                if record.updated_at < cutoff {
                    stale.push(key.value().to_string());
                }
            }
            for key in &stale {
                table.remove(key.as_str())?;
            }
            Ok(stale.len())
        })
    }
}

// =============================================================================
// VenueTxn
// =============================================================================

/// Typed view over an open write transaction.
pub struct VenueTxn<'a> {
    txn: &'a WriteTransaction,
}

impl VenueTxn<'_> {
    // ----- orders -----

    pub fn get_order(&self, order_id: &str) -> DbResult<Option<Order>> {
        let table = self.txn.open_table(ORDERS)?;
        let result = match table.get(order_id)? {
            Some(value) => Some(decode(value.value())?),
            None => None,
        };
        Ok(result)
    }

    pub fn get_order_by_reference(&self, reference: &str) -> DbResult<Option<Order>> {
        let order_id = {
            let refs = self.txn.open_table(ORDER_REFERENCES)?;
            let id = refs.get(reference)?.map(|v| v.value().to_string());
            id
        };
        match order_id {
            Some(id) => self.get_order(&id),
            None => Ok(None),
        }
    }

    /// Insert a new order. Fails if the id or payment reference is taken.
    pub fn insert_order(&self, order: &Order) -> DbResult<()> {
        if self.get_order(&order.order_id)?.is_some() {
            return Err(DbError::AlreadyExists(format!("Order {}", order.order_id)));
        }
        {
            let refs = self.txn.open_table(ORDER_REFERENCES)?;
            if refs.get(order.payment_reference.as_str())?.is_some() {
                return Err(DbError::AlreadyExists(format!(
                    "Payment reference {}",
                    order.payment_reference
                )));
            }
        }
        self.put_order(order)
    }

    pub fn put_order(&self, order: &Order) -> DbResult<()> {
        let json = encode(order)?;
        let mut orders = self.txn.open_table(ORDERS)?;
        orders.insert(order.order_id.as_str(), json.as_slice())?;
        let mut refs = self.txn.open_table(ORDER_REFERENCES)?;
        refs.insert(order.payment_reference.as_str(), order.order_id.as_str())?;
        Ok(())
    }

    // ----- tickets -----

    pub fn get_ticket_by_code(&self, code: &str) -> DbResult<Option<Ticket>> {
        let ticket_id = {
            let codes = self.txn.open_table(TICKET_CODES)?;
            let id = codes.get(code)?.map(|v| v.value().to_string());
            id
        };
        let Some(ticket_id) = ticket_id else {
            return Ok(None);
        };
        let tickets = self.txn.open_table(TICKETS)?;
        let result = match tickets.get(ticket_id.as_str())? {
            Some(value) => Some(decode(value.value())?),
            None => None,
        };
        Ok(result)
    }

    pub fn tickets_for_order(&self, order_id: &str) -> DbResult<Vec<Ticket>> {
        let ids: Vec<String> = {
            let index = self.txn.open_table(ORDER_TICKETS)?;
            let (start, end) = prefix_bounds(order_id);
            let mut ids = Vec::new();
            for entry in index.range(start.as_str()..end.as_str())? {
                let (_, ticket_id) = entry?;
                ids.push(ticket_id.value().to_string());
            }
            ids
        };
        let tickets = self.txn.open_table(TICKETS)?;
        let mut result = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(value) = tickets.get(id.as_str())? {
                result.push(decode(value.value())?);
            }
        }
        Ok(result)
    }

    /// Insert a new ticket. Fails if the ticket code is already in use.
    pub fn insert_ticket(&self, ticket: &Ticket) -> DbResult<()> {
        {
            let codes = self.txn.open_table(TICKET_CODES)?;
            if codes.get(ticket.code.as_str())?.is_some() {
                return Err(DbError::AlreadyExists(format!("Ticket code {}", ticket.code)));
            }
        }
        self.put_ticket(ticket)?;
        let mut index = self.txn.open_table(ORDER_TICKETS)?;
        let key = order_ticket_key(&ticket.order_id, &ticket.ticket_id);
        index.insert(key.as_str(), ticket.ticket_id.as_str())?;
        Ok(())
    }

    pub fn put_ticket(&self, ticket: &Ticket) -> DbResult<()> {
        let json = encode(ticket)?;
        let mut tickets = self.txn.open_table(TICKETS)?;
        tickets.insert(ticket.ticket_id.as_str(), json.as_slice())?;
        let mut codes = self.txn.open_table(TICKET_CODES)?;
        codes.insert(ticket.code.as_str(), ticket.ticket_id.as_str())?;
        Ok(())
    }

    // ----- scans -----

    /// Append a scan row. Scan rows are never rewritten.
    pub fn append_scan(&self, scan: &TicketScan) -> DbResult<()> {
        let json = encode(scan)?;
        let mut scans = self.txn.open_table(TICKET_SCANS)?;
        if scans.get(scan.scan_id.as_str())?.is_some() {
            return Err(DbError::AlreadyExists(format!("Scan {}", scan.scan_id)));
        }
        scans.insert(scan.scan_id.as_str(), json.as_slice())?;
        let mut index = self.txn.open_table(TICKET_SCAN_INDEX)?;
        let key = make_scan_index_key(&scan.ticket_code, scan.scanned_at, &scan.scan_id);
        index.insert(key.as_slice(), scan.scan_id.as_str())?;
        Ok(())
    }

    // ----- customers -----

    pub fn get_customer(&self, customer_id: &str) -> DbResult<Option<Customer>> {
        let table = self.txn.open_table(CUSTOMERS)?;
        let result = match table.get(customer_id)? {
            Some(value) => Some(decode(value.value())?),
            None => None,
        };
        Ok(result)
    }

    pub fn put_customer(&self, customer: &Customer) -> DbResult<()> {
        let json = encode(customer)?;
        let mut table = self.txn.open_table(CUSTOMERS)?;
        table.insert(customer.customer_id.as_str(), json.as_slice())?;
        Ok(())
    }

    // ----- ledger & audit -----

    pub fn get_idempotency(&self, key: &str) -> DbResult<Option<IdempotencyRecord>> {
        let table = self.txn.open_table(IDEMPOTENCY)?;
        let result = match table.get(key)? {
            Some(value) => Some(decode(value.value())?),
            None => None,
        };
        Ok(result)
    }

    pub fn put_idempotency(&self, record: &IdempotencyRecord) -> DbResult<()> {
        let json = encode(record)?;
        let mut table = self.txn.open_table(IDEMPOTENCY)?;
        table.insert(record.key.as_str(), json.as_slice())?;
        Ok(())
    }

    pub fn append_audit(&self, event: &AuditEvent) -> DbResult<()> {
        let json = encode(event)?;
        let key = event.storage_key();
        let mut table = self.txn.open_table(AUDIT_LOG)?;
        table.insert(key.as_str(), json.as_slice())?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
