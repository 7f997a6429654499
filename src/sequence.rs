//! Document numbering.
//!
//! Counters live in the `document_counters` tree as big-endian `u64`s. An increment is a
//! compare-and-swap loop on the stored value, so two callers racing on the same key can never
//! both observe the same "before" value and every caller gets a distinct number.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use tracing::{debug, instrument};

use crate::error::CoreError;
use crate::store::{self, Result};
use crate::utils::{composite_key, u64_from_be, u64_to_be, validate_key_part};

/// Fiscal years start on the first day of this calendar month.
pub const FISCAL_YEAR_START_MONTH: u32 = 4;

const FISCAL_KEY_NAMESPACE: &str = "fy";
const DAILY_KEY_NAMESPACE: &str = "day";

/// `2025-02-14` belongs to the fiscal year starting 2024, code `2425`.
pub fn fiscal_year_code(date: NaiveDate) -> String {
    let start = if date.month() >= FISCAL_YEAR_START_MONTH {
        date.year()
    } else {
        date.year() - 1
    };
    format!(
        "{:02}{:02}",
        start.rem_euclid(100),
        (start + 1).rem_euclid(100)
    )
}

/// A parsed `PREFIX/BRANCH/FY/0001` identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentNumber {
    pub document_type: String,
    pub branch_code: String,
    pub fiscal_year_code: String,
    pub sequence: u64,
    /// Digits the sequence was written with, zero padding included.
    pub width: usize,
}

impl DocumentNumber {
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        let [document_type, branch_code, fiscal_year_code, sequence] = parts.as_slice() else {
            return Err(CoreError::validation(format!(
                "document number `{s}` must have four `/` separated parts"
            )));
        };
        validate_series_part("document_type", document_type)?;
        validate_series_part("branch_code", branch_code)?;
        validate_fiscal_year_code(fiscal_year_code)?;
        if sequence.is_empty() || !sequence.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CoreError::validation(format!(
                "sequence `{sequence}` is not a number"
            )));
        }
        let width = sequence.len();
        let sequence = sequence
            .parse()
            .map_err(|e| CoreError::validation(format!("sequence `{sequence}`: {e}")))?;

        Ok(Self {
            document_type: document_type.to_string(),
            branch_code: branch_code.to_string(),
            fiscal_year_code: fiscal_year_code.to_string(),
            sequence,
            width,
        })
    }
}

impl FromStr for DocumentNumber {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        DocumentNumber::parse(s)
    }
}

impl fmt::Display for DocumentNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{:0width$}",
            self.document_type,
            self.branch_code,
            self.fiscal_year_code,
            self.sequence,
            width = self.width
        )
    }
}

pub struct SequenceGenerator {
    counters: sled::Tree,
    padding: usize,
}

impl SequenceGenerator {
    pub fn new(instance: Arc<sled::Db>, padding: usize) -> Result<Self> {
        let counters = instance.open_tree(store::DOCUMENT_COUNTERS)?;
        Ok(Self { counters, padding })
    }

    /// Allocates the next number for `(document_type, branch_code, fiscal_year_code)`.
    /// The first call for a key returns 1.
    #[instrument(skip(self))]
    pub fn next(
        &self,
        document_type: &str,
        branch_code: &str,
        fiscal_year_code: &str,
    ) -> Result<u64> {
        let key = fiscal_key(document_type, branch_code, fiscal_year_code)?;
        let sequence = self.increment(&key)?;
        debug!(sequence, "allocated document sequence");
        Ok(sequence)
    }

    /// Current value of a counter without consuming a number; 0 if never used.
    pub fn peek(
        &self,
        document_type: &str,
        branch_code: &str,
        fiscal_year_code: &str,
    ) -> Result<u64> {
        let key = fiscal_key(document_type, branch_code, fiscal_year_code)?;
        match self.counters.get(&key)? {
            Some(bytes) => u64_from_be(&bytes),
            None => Ok(0),
        }
    }

    pub fn format(
        &self,
        document_type: &str,
        branch_code: &str,
        fiscal_year_code: &str,
        sequence: u64,
        prefix_override: Option<&str>,
    ) -> String {
        let prefix = prefix_override.unwrap_or(document_type);
        format!(
            "{prefix}/{branch_code}/{fiscal_year_code}/{sequence:0width$}",
            width = self.padding
        )
    }

    /// Fiscal year derivation, allocation and formatting in one call.
    pub fn next_formatted(
        &self,
        document_type: &str,
        branch_code: &str,
        date: NaiveDate,
    ) -> Result<String> {
        let fy = fiscal_year_code(date);
        let sequence = self.next(document_type, branch_code, &fy)?;
        Ok(self.format(document_type, branch_code, &fy, sequence, None))
    }

    /// Day-scoped series for documents without branch-wise numbering: `PREFIX-YYYYMMDD-0001`.
    #[instrument(skip(self))]
    pub fn simple_next(&self, document_type: &str, date: NaiveDate) -> Result<String> {
        validate_series_part("document_type", document_type)?;
        if document_type.contains('-') {
            return Err(CoreError::validation(format!(
                "document_type `{document_type}` must not contain `-`"
            )));
        }
        let day = date.format("%Y%m%d").to_string();
        let key = composite_key(&[DAILY_KEY_NAMESPACE, document_type, &day]);
        let sequence = self.increment(&key)?;
        debug!(sequence, "allocated daily sequence");

        Ok(format!(
            "{document_type}-{day}-{sequence:0width$}",
            width = self.padding
        ))
    }

    fn increment(&self, key: &[u8]) -> Result<u64> {
        loop {
            let current = self.counters.get(key)?;
            let next = match &current {
                Some(bytes) => u64_from_be(bytes)?.checked_add(1).ok_or_else(|| {
                    CoreError::CorruptData("document counter overflowed".into())
                })?,
                None => 1,
            };

            let swapped = self
                .counters
                .compare_and_swap(key, current, Some(u64_to_be(next).to_vec()))?;
            if swapped.is_ok() {
                return Ok(next);
            }
            // another caller won the swap; re-read and try again
        }
    }
}

fn fiscal_key(document_type: &str, branch_code: &str, fiscal_year_code: &str) -> Result<Vec<u8>> {
    validate_series_part("document_type", document_type)?;
    validate_series_part("branch_code", branch_code)?;
    validate_fiscal_year_code(fiscal_year_code)?;
    Ok(composite_key(&[
        FISCAL_KEY_NAMESPACE,
        document_type,
        branch_code,
        fiscal_year_code,
    ]))
}

fn validate_series_part(field: &str, value: &str) -> Result<()> {
    validate_key_part(field, value)?;
    if value.contains('/') {
        return Err(CoreError::validation(format!(
            "{field} `{value}` must not contain `/`"
        )));
    }
    Ok(())
}

fn validate_fiscal_year_code(code: &str) -> Result<()> {
    if code.len() != 4 || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CoreError::validation(format!(
            "fiscal year code `{code}` must be four digits"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn fiscal_year_starts_in_april() {
        assert_eq!(fiscal_year_code(date(2025, 2, 14)), "2425");
        assert_eq!(fiscal_year_code(date(2025, 3, 31)), "2425");
        assert_eq!(fiscal_year_code(date(2025, 4, 1)), "2526");
        assert_eq!(fiscal_year_code(date(1999, 12, 1)), "9900");
    }

    #[test]
    fn parse_inverts_format() {
        let db = Arc::new(sled::Config::new().temporary(true).open().unwrap());
        let generator = SequenceGenerator::new(db, 4).unwrap();

        let formatted = generator.format("INV", "MH", "2425", 7, None);
        assert_eq!(formatted, "INV/MH/2425/0007");

        let parsed = DocumentNumber::parse(&formatted).unwrap();
        assert_eq!(parsed.document_type, "INV");
        assert_eq!(parsed.branch_code, "MH");
        assert_eq!(parsed.fiscal_year_code, "2425");
        assert_eq!(parsed.sequence, 7);
        assert_eq!(parsed.to_string(), formatted);
    }

    #[test]
    fn parsed_number_keeps_configured_padding() {
        let db = Arc::new(sled::Config::new().temporary(true).open().unwrap());
        let generator = SequenceGenerator::new(db, 6).unwrap();

        let formatted = generator.format("INV", "MH", "2425", 1, None);
        assert_eq!(formatted, "INV/MH/2425/000001");

        let parsed = DocumentNumber::parse(&formatted).unwrap();
        assert_eq!(parsed.width, 6);
        assert_eq!(parsed.to_string(), formatted);

        // numbers that outgrew the padding keep all their digits
        let wide = DocumentNumber::parse("INV/MH/2425/12345").unwrap();
        assert_eq!(wide.to_string(), "INV/MH/2425/12345");
    }

    #[test]
    fn prefix_override_replaces_document_type() {
        let db = Arc::new(sled::Config::new().temporary(true).open().unwrap());
        let generator = SequenceGenerator::new(db, 5).unwrap();

        assert_eq!(
            generator.format("sales_invoice", "MH", "2425", 12, Some("SI")),
            "SI/MH/2425/00012"
        );
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        for bad in ["INV/MH/2425", "INV/MH/24/0001", "INV//2425/0001", "INV/MH/2425/00x1"] {
            let err = DocumentNumber::parse(bad).unwrap_err();
            assert!(matches!(err, CoreError::Validation(_)), "{bad}");
        }
    }

    #[test]
    fn counters_start_at_one_per_key() {
        let db = Arc::new(sled::Config::new().temporary(true).open().unwrap());
        let generator = SequenceGenerator::new(db, 4).unwrap();

        assert_eq!(generator.peek("INV", "MH", "2425").unwrap(), 0);
        assert_eq!(generator.next("INV", "MH", "2425").unwrap(), 1);
        assert_eq!(generator.next("INV", "MH", "2425").unwrap(), 2);
        assert_eq!(generator.next("INV", "KA", "2425").unwrap(), 1);
        assert_eq!(generator.next("INV", "MH", "2526").unwrap(), 1);
        assert_eq!(generator.peek("INV", "MH", "2425").unwrap(), 2);
    }

    #[test]
    fn daily_series_is_keyed_by_day() {
        let db = Arc::new(sled::Config::new().temporary(true).open().unwrap());
        let generator = SequenceGenerator::new(db, 4).unwrap();

        let day = date(2025, 2, 14);
        assert_eq!(generator.simple_next("GRN", day).unwrap(), "GRN-20250214-0001");
        assert_eq!(generator.simple_next("GRN", day).unwrap(), "GRN-20250214-0002");
        assert_eq!(
            generator.simple_next("GRN", date(2025, 2, 15)).unwrap(),
            "GRN-20250215-0001"
        );
        assert!(generator.simple_next("G-RN", day).is_err());
    }
}
