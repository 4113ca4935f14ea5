// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Ticket Admission
//!
//! - [`code`]: ticket code parsing and generation
//! - [`engine`]: pure admission rules
//! - [`gate`]: transactional scan recording with fail-closed behaviour

pub mod code;
pub mod engine;
pub mod gate;

pub use code::{CodeError, TicketCode};
pub use engine::{days_between, AdmissionDecision};
pub use gate::{GateService, ScanOutcome, ScanRequest};
