//! Invoice numbers: `INV-YYYYMM-NNNN`, sequential within a calendar month.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};

const PREFIX: &str = "INV-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InvoiceNumber {
    year: i32,
    month: u32,
    sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invoice number '{0}' does not match INV-YYYYMM-NNNN")]
pub struct InvalidInvoiceNumber(String);

impl InvoiceNumber {
    pub fn new(year: i32, month: u32, sequence: u32) -> Option<Self> {
        let valid = (1000..=9999).contains(&year) && (1..=12).contains(&month) && sequence > 0;
        valid.then_some(Self {
            year,
            month,
            sequence,
        })
    }

    /// Number `sequence` in the month containing `date`.
    pub fn for_date(date: NaiveDate, sequence: u32) -> Option<Self> {
        Self::new(date.year(), date.month(), sequence)
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Sequence key, `YYYYMM`.
    pub fn period(&self) -> String {
        format!("{:04}{:02}", self.year, self.month)
    }
}

/// Sequence key for the month containing `date`.
pub fn period_of(date: NaiveDate) -> String {
    format!("{:04}{:02}", date.year(), date.month())
}

impl fmt::Display for InvoiceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:04}{:02}-{:04}",
            PREFIX, self.year, self.month, self.sequence
        )
    }
}

impl FromStr for InvoiceNumber {
    type Err = InvalidInvoiceNumber;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidInvoiceNumber(s.to_string());

        let rest = s.strip_prefix(PREFIX).ok_or_else(invalid)?;
        let (period, sequence) = rest.split_once('-').ok_or_else(invalid)?;

        let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if period.len() != 6 || sequence.len() < 4 || !all_digits(period) || !all_digits(sequence) {
            return Err(invalid());
        }

        let year = period[..4].parse().map_err(|_| invalid())?;
        let month = period[4..].parse().map_err(|_| invalid())?;
        let sequence = sequence.parse().map_err(|_| invalid())?;

        InvoiceNumber::new(year, month, sequence).ok_or_else(invalid)
    }
}
