// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! HMAC-SHA512 verification of raw webhook bodies.

use hmac::{Hmac, Mac};
use sha2::Sha512;
use subtle::ConstantTimeEq;

use super::error::WebhookError;
use crate::config::SIGNATURE_ALGORITHM;

type HmacSha512 = Hmac<Sha512>;

/// Verifies the gateway's signature over the exact bytes received.
#[derive(Clone)]
pub struct SignatureVerifier {
    secret: Vec<u8>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Hex-encoded tag for `body`.
    pub fn sign(&self, body: &[u8]) -> Result<String, WebhookError> {
        let mut mac = HmacSha512::new_from_slice(&self.secret)
            .map_err(|_| WebhookError::Infrastructure("invalid webhook secret".into()))?;
        mac.update(body);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check `tag` against the body.
    ///
    /// Both the tag and the algorithm name are required, and the algorithm
    /// must be HMAC-SHA512. Comparison runs in constant time over the hex
    /// digests.
    pub fn verify(
        &self,
        body: &[u8],
        algorithm: Option<&str>,
        tag: Option<&str>,
    ) -> Result<(), WebhookError> {
        let provided = tag
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(WebhookError::MissingSignature)?
            .to_ascii_lowercase();

        match algorithm.map(str::trim) {
            Some(name) if name.eq_ignore_ascii_case(SIGNATURE_ALGORITHM) => {}
            _ => return Err(WebhookError::UnsupportedAlgorithm),
        }

        let expected = self.sign(body)?;

        // Length is public: a SHA-512 hex digest is always 128 chars
        if expected.len() != provided.len() {
            return Err(WebhookError::InvalidSignature);
        }
        if bool::from(expected.as_bytes().ct_eq(provided.as_bytes())) {
            Ok(())
        } else {
            Err(WebhookError::InvalidSignature)
        }
    }
}
