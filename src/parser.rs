//! Parser for ZRXP-style hydrographic feed exports.
//!
//! The feed is a concatenation of per-station blocks, each starting with the
//! `#ZRXPVERSION` marker. Within a block, fields are pipe-separated and carry
//! their attribute as a key prefix. The time series is the field that holds
//! sample lines.
//!
//! # Feed Format
//!
//! ```text
//! #ZRXPVERSION2300.100|*|ZRXPCREATORKiIOSystem|*|
//! #SANR5402|*|SNAMEStrobl|*|SWATERWolfgangsee|*|CNAMEWT|*|
//! #LAYOUT(timestamp,value)|*|
//! 20230615120000 18.4
//! 20230615110000 18.1
//! ```
//!
//! Sample lines are parsed with `nom`. The parser never fails as a whole:
//! broken blocks and lines are skipped and reported as [`ParseWarning`]s.

use chrono::{DateTime, NaiveDate, Utc};
use nom::{
    IResult, Parser,
    bytes::complete::{take_while_m_n, take_while1},
    character::complete::{space0, space1},
    combinator::{eof, map_res},
};
use thiserror::Error;
use tracing::{debug, warn};

use crate::station::{SampleRecord, StationRecord, is_plausible_temperature};

/// Marker that starts every station block.
pub const BLOCK_MARKER: &str = "#ZRXPVERSION";

/// Field prefix of the station number.
pub const NUMBER_PREFIX: &str = "SANR";

/// Field prefix of the station name.
pub const NAME_PREFIX: &str = "SNAME";

/// Field prefix of the water body.
pub const WATER_PREFIX: &str = "SWATER";

/// Length of the `YYYYMMDDHHMMSS` timestamp token.
const TIMESTAMP_LEN: usize = 14;

/// Maximum number of characters of a block quoted in warnings.
const EXCERPT_LEN: usize = 120;

/// Errors that can occur while parsing a single sample line.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("Invalid sample line: {0}")]
    InvalidFormat(String),

    #[error("Invalid temperature: {0}")]
    InvalidTemperature(String),

    #[error("Implausible temperature: {0}")]
    ImplausibleTemperature(f64),
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Soft problems found while parsing a feed. None of them abort parsing.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ParseWarning {
    #[error("SNAME is missing in: {excerpt} ...")]
    MissingName { excerpt: String },

    #[error("SWATER is missing for station {station}")]
    MissingWater { station: String },

    #[error("Samples are missing for station {station}")]
    MissingSamples { station: String },

    #[error("Invalid line for station {station}: {line}")]
    MalformedLine { station: String, line: String },
}

/// What happened while parsing one feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseReport {
    /// Station blocks found in the feed.
    pub blocks: usize,

    /// Station records produced.
    pub stations: usize,

    /// Samples accepted.
    pub samples: usize,

    /// Values dropped because they were not numeric or not plausible.
    pub rejected_values: usize,

    /// Soft warnings, in the order they were found.
    pub warnings: Vec<ParseWarning>,
}

impl ParseReport {
    /// Blocks that produced no station record.
    pub fn dropped_blocks(&self) -> usize {
        self.blocks - self.stations
    }

    /// Lines inside a time series that did not have the sample shape.
    pub fn malformed_lines(&self) -> usize {
        self.warnings
            .iter()
            .filter(|w| matches!(w, ParseWarning::MalformedLine { .. }))
            .count()
    }

    fn warn(&mut self, warning: ParseWarning) {
        warn!("{}", warning);
        self.warnings.push(warning);
    }
}

/// Parse the 14 digit `YYYYMMDDHHMMSS` timestamp token.
fn parse_timestamp(input: &str) -> IResult<&str, DateTime<Utc>> {
    map_res(
        take_while_m_n(TIMESTAMP_LEN, TIMESTAMP_LEN, |c: char| c.is_ascii_digit()),
        |s: &str| {
            let year: i32 = s[0..4].parse().map_err(|_| "Invalid year")?;
            let month: u32 = s[4..6].parse().map_err(|_| "Invalid month")?;
            let day: u32 = s[6..8].parse().map_err(|_| "Invalid day")?;
            let hour: u32 = s[8..10].parse().map_err(|_| "Invalid hour")?;
            let minute: u32 = s[10..12].parse().map_err(|_| "Invalid minute")?;
            let second: u32 = s[12..14].parse().map_err(|_| "Invalid second")?;
            NaiveDate::from_ymd_opt(year, month, day)
                .and_then(|date| date.and_hms_opt(hour, minute, second))
                .map(|datetime| datetime.and_utc())
                .ok_or("Invalid timestamp values")
        },
    )
    .parse(input)
}

/// Parse the value token following the timestamp.
fn parse_value_token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace()).parse(input)
}

/// Split a sample line into its timestamp and raw value token.
///
/// The line must consist of exactly two tokens: a 14 digit timestamp and a
/// value. The value is not interpreted here.
///
/// # Example
///
/// ```
/// use water_temp::parser::parse_sample_line;
///
/// let (timestamp, value) = parse_sample_line("20230615120000 18.4").unwrap();
/// assert_eq!(timestamp.to_rfc3339(), "2023-06-15T12:00:00+00:00");
/// assert_eq!(value, "18.4");
/// ```
pub fn parse_sample_line(input: &str) -> ParseResult<(DateTime<Utc>, &str)> {
    let input = input.trim();

    let result: IResult<&str, (DateTime<Utc>, &str)> = (|input| {
        let (input, timestamp) = parse_timestamp(input)?;
        let (input, _) = space1(input)?;
        let (input, value) = parse_value_token(input)?;
        let (input, _) = space0(input)?;
        let (input, _) = eof(input)?;

        Ok((input, (timestamp, value)))
    })(input);

    match result {
        Ok((_, parsed)) => Ok(parsed),
        Err(_) => Err(ParseError::InvalidFormat(input.to_string())),
    }
}

/// Parse a sample line into a validated [`SampleRecord`].
pub fn parse_sample(line: &str) -> ParseResult<SampleRecord> {
    let (timestamp, value) = parse_sample_line(line)?;

    let temperature: f64 = value
        .parse()
        .map_err(|_| ParseError::InvalidTemperature(value.to_string()))?;

    if !is_plausible_temperature(temperature) {
        return Err(ParseError::ImplausibleTemperature(temperature));
    }

    Ok(SampleRecord::new(timestamp, temperature))
}

/// Check if a line looks like a sample line (quick pre-filter).
///
/// Used to find the time series field: 14 digits, one whitespace, then
/// another token.
#[inline]
pub fn looks_like_sample_line(line: &str) -> bool {
    let bytes = line.trim().as_bytes();
    bytes.len() > TIMESTAMP_LEN + 1
        && bytes[..TIMESTAMP_LEN].iter().all(u8::is_ascii_digit)
        && (bytes[TIMESTAMP_LEN] == b' ' || bytes[TIMESTAMP_LEN] == b'\t')
        && !bytes[TIMESTAMP_LEN + 1].is_ascii_whitespace()
}

/// Find a prefixed field and return its value with the prefix stripped.
///
/// Tolerates a leading `#` before the prefix and an `=` after it.
fn find_field<'a>(fields: &[&'a str], prefix: &str) -> Option<&'a str> {
    fields.iter().find_map(|field| {
        let field = field.trim().trim_start_matches('#');
        field
            .strip_prefix(prefix)
            .map(|value| value.strip_prefix('=').unwrap_or(value).trim())
    })
}

fn excerpt(block: &str) -> String {
    block.chars().take(EXCERPT_LEN).collect()
}

/// Parse one station block (the text following a block marker).
fn parse_block(block: &str, report: &mut ParseReport) -> Option<StationRecord> {
    let fields: Vec<&str> = block.split('|').collect();

    let Some(name) = find_field(&fields, NAME_PREFIX) else {
        report.warn(ParseWarning::MissingName {
            excerpt: excerpt(block),
        });
        return None;
    };

    let site = find_field(&fields, WATER_PREFIX).unwrap_or_else(|| {
        report.warn(ParseWarning::MissingWater {
            station: name.to_string(),
        });
        ""
    });

    let mut station = StationRecord::new(name, site);
    if let Some(number) = find_field(&fields, NUMBER_PREFIX) {
        station = station.with_number(number);
    }

    let series = fields
        .iter()
        .find(|field| field.lines().any(looks_like_sample_line));

    let Some(series) = series else {
        report.warn(ParseWarning::MissingSamples {
            station: name.to_string(),
        });
        return Some(station);
    };

    for line in series.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match parse_sample(line) {
            Ok(sample) => {
                station.add_sample(sample);
                report.samples += 1;
            }
            Err(ParseError::InvalidFormat(_)) => {
                report.warn(ParseWarning::MalformedLine {
                    station: name.to_string(),
                    line: line.to_string(),
                });
            }
            Err(e) => {
                debug!("Dropping value for station {}: {}", name, e);
                report.rejected_values += 1;
            }
        }
    }

    Some(station)
}

/// Parse a complete feed into station records and a report.
///
/// Records are unbound (no source) and their samples are accessible most
/// recent first.
pub fn parse_feed_with_report(text: &str) -> (Vec<StationRecord>, ParseReport) {
    let mut report = ParseReport::default();

    let blocks = text
        .split(BLOCK_MARKER)
        .map(str::trim)
        .filter(|block| !block.is_empty());

    let mut stations = Vec::new();
    for block in blocks {
        report.blocks += 1;
        if let Some(station) = parse_block(block, &mut report) {
            stations.push(station);
        }
    }
    report.stations = stations.len();

    (stations, report)
}

/// Parse a complete feed into station records.
///
/// # Example
///
/// ```
/// use water_temp::parser::parse_feed;
///
/// let feed = "#ZRXPVERSION2300.100|*|SNAMEStrobl|*|SWATERWolfgangsee|*|\n20230615120000 18.4\n";
/// let stations = parse_feed(feed);
/// assert_eq!(stations.len(), 1);
/// assert_eq!(stations[0].name, "Strobl");
/// assert_eq!(stations[0].most_recent_temperature(), Some(18.4));
/// ```
pub fn parse_feed(text: &str) -> Vec<StationRecord> {
    parse_feed_with_report(text).0
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    /// Generate a well-formed sample line with a plausible temperature.
    fn arb_sample_line() -> impl Strategy<Value = String> {
        (
            2000i32..2100,
            1u32..=12,
            1u32..=28,
            0u32..24,
            0u32..60,
            0u32..60,
            -199i32..999,
        )
            .prop_map(|(y, mo, d, h, mi, s, t)| {
                format!("{:04}{:02}{:02}{:02}{:02}{:02} {:.1}", y, mo, d, h, mi, s, t as f64 / 10.0)
            })
    }

    /// Generate a line that does not have the sample shape.
    fn arb_malformed_line() -> impl Strategy<Value = String> {
        prop_oneof![
            "[0-9]{1,13} [0-9]{1,2}\\.[0-9]",
            "[0-9]{15,18} [0-9]{1,2}\\.[0-9]",
            "[0-9]{14} [0-9]{1,2} [0-9]{1,2}",
            "[a-z]{3,10}",
        ]
    }

    fn expected_samples(lines: &[String]) -> Vec<SampleRecord> {
        let mut station = StationRecord::new("Strobl", "Wolfgangsee");
        station.add_samples(lines.iter().filter_map(|l| parse_sample(l).ok()));
        station.samples()
    }

    fn block(lines: &[String]) -> String {
        format!(
            "#ZRXPVERSION2300.100|*|SNAMEStrobl|*|SWATERWolfgangsee|*|\n{}\n",
            lines.join("\n")
        )
    }

    proptest! {
        /// Parsing is deterministic and never panics
        #[test]
        fn parse_is_deterministic(text in ".{0,400}") {
            let first = parse_feed_with_report(&text);
            let second = parse_feed_with_report(&text);
            prop_assert_eq!(first, second);
        }

        /// Malformed lines contribute no samples and do not stop later lines
        #[test]
        fn malformed_lines_contribute_nothing(
            good in prop::collection::vec(arb_sample_line(), 1..10),
            bad in prop::collection::vec(arb_malformed_line(), 0..10),
        ) {
            let mut lines = good.clone();
            lines.extend(bad.iter().cloned());
            lines.extend(good.iter().cloned());

            let expected = expected_samples(&good);
            let stations = parse_feed(&block(&lines));

            prop_assert_eq!(stations.len(), 1);
            prop_assert_eq!(stations[0].samples(), expected);
        }

        /// Blocks without a name never produce a record
        #[test]
        fn nameless_blocks_are_dropped(good in prop::collection::vec(arb_sample_line(), 0..10)) {
            let feed = format!(
                "#ZRXPVERSION2300.100|*|SWATERWolfgangsee|*|\n{}\n",
                good.join("\n")
            );
            prop_assert!(parse_feed(&feed).is_empty());
        }
    }
}
