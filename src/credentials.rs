// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Admission credential issuance for activated tickets.

use crate::storage::Ticket;

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential for {code} could not be issued: {reason}")]
    IssueFailed { code: String, reason: String },
}

/// Produces the credential a holder presents at the gate.
///
/// Called inside the payment transaction, so it must not perform slow I/O.
/// The returned path is stored on the ticket.
pub trait CredentialIssuer: Send + Sync {
    fn issue(&self, ticket: &Ticket) -> Result<String, CredentialError>;
}

/// Assigns each ticket a QR image path under a base directory:
/// `{base}/{session_id}/{code}.png`. Rendering happens out of band.
#[derive(Debug, Clone)]
pub struct QrPathIssuer {
    base_dir: String,
}

impl QrPathIssuer {
    pub fn new(base_dir: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into().trim_end_matches('/').to_string(),
        }
    }
}

fn path_safe(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
}

impl CredentialIssuer for QrPathIssuer {
    fn issue(&self, ticket: &Ticket) -> Result<String, CredentialError> {
        for segment in [&ticket.session_id, &ticket.code] {
            if !path_safe(segment) {
                return Err(CredentialError::IssueFailed {
                    code: ticket.code.clone(),
                    reason: format!("`{segment}` is not a safe path segment"),
                });
            }
        }
        Ok(format!(
            "{}/{}/{}.png",
            self.base_dir, ticket.session_id, ticket.code
        ))
    }
}
