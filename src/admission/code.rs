// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Ticket codes of the form `PREFIX-YYYY-XXXXXX`.

use std::fmt;
use std::str::FromStr;

use rand::Rng;

const SERIAL_LEN: usize = 6;
const MAX_PREFIX_LEN: usize = 10;

/// Serial alphabet for generated codes. Omits 0/O and 1/I.
const SERIAL_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodeError {
    #[error("ticket code must have the form PREFIX-YYYY-XXXXXX")]
    Shape,

    #[error("prefix must be 2 to 10 uppercase letters")]
    Prefix,

    #[error("year must be four digits")]
    Year,

    #[error("serial must be 6 uppercase letters or digits")]
    Serial,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TicketCode {
    prefix: String,
    year: u16,
    serial: String,
}

impl TicketCode {
    pub fn new(prefix: &str, year: u16, serial: &str) -> Result<Self, CodeError> {
        if !(2..=MAX_PREFIX_LEN).contains(&prefix.len())
            || !prefix.bytes().all(|b| b.is_ascii_uppercase())
        {
            return Err(CodeError::Prefix);
        }
        if !(1000..=9999).contains(&year) {
            return Err(CodeError::Year);
        }
        if serial.len() != SERIAL_LEN
            || !serial
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
        {
            return Err(CodeError::Serial);
        }
        Ok(Self {
            prefix: prefix.to_string(),
            year,
            serial: serial.to_string(),
        })
    }

    /// Parse a code as read by a scanner. Surrounding whitespace and letter
    /// case are normalized first.
    pub fn parse(raw: &str) -> Result<Self, CodeError> {
        let normalized = raw.trim().to_ascii_uppercase();
        let mut parts = normalized.split('-');
        let (Some(prefix), Some(year), Some(serial), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CodeError::Shape);
        };
        if year.len() != 4 || !year.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CodeError::Year);
        }
        let year = year.parse().map_err(|_| CodeError::Year)?;
        Self::new(prefix, year, serial)
    }

    /// Random code for a new ticket. Uniqueness is enforced by the ticket
    /// code index on insert.
    pub fn generate<R: Rng + ?Sized>(prefix: &str, year: u16, rng: &mut R) -> Result<Self, CodeError> {
        let serial: String = (0..SERIAL_LEN)
            .map(|_| SERIAL_ALPHABET[rng.gen_range(0..SERIAL_ALPHABET.len())] as char)
            .collect();
        Self::new(prefix, year, &serial)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn year(&self) -> u16 {
        self.year
    }
}

impl fmt::Display for TicketCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:04}-{}", self.prefix, self.year, self.serial)
    }
}

impl FromStr for TicketCode {
    type Err = CodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_normalizes() {
        let code = TicketCode::parse("  evt-2026-a1b2c3 \n").unwrap();
        assert_eq!(code.to_string(), "EVT-2026-A1B2C3");
        assert_eq!(code.prefix(), "EVT");
        assert_eq!(code.year(), 2026);
    }

    #[test]
    fn rejects_malformed_codes() {
        assert_eq!(TicketCode::parse("EVT2026A1B2C3"), Err(CodeError::Shape));
        assert_eq!(TicketCode::parse("EVT-2026-A1B2C3-X"), Err(CodeError::Shape));
        assert_eq!(TicketCode::parse("E-2026-A1B2C3"), Err(CodeError::Prefix));
        assert_eq!(TicketCode::parse("EV7-2026-A1B2C3"), Err(CodeError::Prefix));
        assert_eq!(TicketCode::parse("EVT-26-A1B2C3"), Err(CodeError::Year));
        assert_eq!(TicketCode::parse("EVT-+026-A1B2C3"), Err(CodeError::Year));
        assert_eq!(TicketCode::parse("EVT-2026-A1B2"), Err(CodeError::Serial));
        assert_eq!(TicketCode::parse("EVT-2026-A1B2C|"), Err(CodeError::Serial));
    }

    #[test]
    fn generated_codes_parse_back() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let code = TicketCode::generate("GALA", 2026, &mut rng).unwrap();
            let text = code.to_string();
            assert_eq!(text.len(), "GALA-2026-XXXXXX".len());
            assert_eq!(text.parse::<TicketCode>().unwrap(), code);
        }
    }

    #[test]
    fn generate_validates_prefix() {
        let mut rng = rand::thread_rng();
        assert_eq!(
            TicketCode::generate("gala", 2026, &mut rng),
            Err(CodeError::Prefix)
        );
    }
}
