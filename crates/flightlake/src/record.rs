//! Flight record parsing and partition key derivation
//!
//! Input lines carry seven comma-separated fields:
//! `date,depTime,arrTime,carrier,flightNum,origin,dest`.
//! The date field accepts `YYYY-MM-DD`, `YYYYMMDD` or a bare `YYYY`
//! (month and day default to 01).

use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const FIELD_COUNT: usize = 7;
const OUTPUT_DELIMITER: &str = "|";

/// Why a raw line was rejected
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseFailure {
    #[error("expected 7 fields, found {0}")]
    FieldCount(usize),
    #[error("invalid date: {0:?}")]
    InvalidDate(String),
    #[error("empty field: {0}")]
    EmptyField(&'static str),
    #[error("field {0} contains the output delimiter")]
    ReservedCharacter(&'static str),
}

/// Calendar date a flight belongs to. Always a valid date with a 4-digit year.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlightDate {
    year: i32,
    month: u32,
    day: u32,
}

impl FlightDate {
    pub fn new(year: i32, month: u32, day: u32) -> Option<Self> {
        if !(0..=9999).contains(&year) {
            return None;
        }
        NaiveDate::from_ymd_opt(year, month, day)?;
        Some(Self { year, month, day })
    }

    fn parse(raw: &str) -> Result<Self, ParseFailure> {
        let invalid = || ParseFailure::InvalidDate(raw.to_string());

        let date = match raw.len() {
            4 if raw.bytes().all(|b| b.is_ascii_digit()) => {
                let year = raw.parse().map_err(|_| invalid())?;
                NaiveDate::from_ymd_opt(year, 1, 1)
            }
            8 => NaiveDate::parse_from_str(raw, "%Y%m%d").ok(),
            10 => NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok(),
            _ => None,
        }
        .ok_or_else(invalid)?;

        Self::new(date.year(), date.month(), date.day()).ok_or_else(invalid)
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn day(&self) -> u32 {
        self.day
    }
}

/// One successfully parsed flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRecord {
    pub dep_time: String,
    pub arr_time: String,
    pub carrier: String,
    pub flight_num: String,
    pub origin: String,
    pub dest: String,
    pub date: FlightDate,
}

impl ParsedRecord {
    /// Pipe-delimited output row. Partition key fields are never included.
    pub fn to_row(&self) -> String {
        [
            self.dep_time.as_str(),
            self.arr_time.as_str(),
            self.carrier.as_str(),
            self.flight_num.as_str(),
            self.origin.as_str(),
            self.dest.as_str(),
        ]
        .join(OUTPUT_DELIMITER)
    }
}

/// (year, month, day) grouping key, rendered as `yyyy-mm-dd`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl PartitionKey {
    /// Project a record onto its partition key
    pub fn of(record: &ParsedRecord) -> Self {
        Self {
            year: record.date.year(),
            month: record.date.month(),
            day: record.date.day(),
        }
    }

    /// Directory name for this partition, e.g. `2008-01-03`
    pub fn dir_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

/// Turns raw text lines into [`ParsedRecord`]s. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordParser;

impl RecordParser {
    pub fn parse(&self, line: &str) -> Result<ParsedRecord, ParseFailure> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != FIELD_COUNT {
            return Err(ParseFailure::FieldCount(fields.len()));
        }

        let date = FlightDate::parse(fields[0])?;

        Ok(ParsedRecord {
            dep_time: text_field("dep_time", fields[1])?,
            arr_time: text_field("arr_time", fields[2])?,
            carrier: text_field("carrier", fields[3])?,
            flight_num: text_field("flight_num", fields[4])?,
            origin: text_field("origin", fields[5])?,
            dest: text_field("dest", fields[6])?,
            date,
        })
    }
}

fn text_field(name: &'static str, value: &str) -> Result<String, ParseFailure> {
    if value.is_empty() {
        return Err(ParseFailure::EmptyField(name));
    }
    if value.contains(OUTPUT_DELIMITER) {
        return Err(ParseFailure::ReservedCharacter(name));
    }
    Ok(value.to_string())
}
