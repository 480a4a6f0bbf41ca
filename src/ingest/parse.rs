//! Log-line parsing into [`LogRecord`] values.
//!
//! The pattern is a regex with named capture groups, validated once at
//! construction so a misconfigured pattern fails at startup instead of
//! silently matching nothing.

use std::time::Duration;

use chrono::NaiveDateTime;
use regex::Regex;
use thiserror::Error;

use crate::candle::LogRecord;

/// Capture groups every pattern must define.
const REQUIRED_GROUPS: [&str; 4] = ["SourceIP", "FileName", "DestNode", "Date"];

/// Optional capture group for the answer-time-aware schema.
const ANSWER_TIME_GROUP: &str = "AnswerTime";

/// Errors raised while building a parser or parsing a line.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid log pattern")]
    InvalidPattern(#[from] regex::Error),

    #[error("pattern is missing the '{0}' capture group")]
    MissingGroup(&'static str),

    #[error("line does not match the log pattern")]
    NoMatch,

    #[error("invalid date '{value}'")]
    InvalidDate {
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("invalid answer time '{0}'")]
    InvalidAnswerTime(String),
}

/// Validated log-line parser.
#[derive(Debug)]
pub struct Parser {
    pattern: Regex,
    date_format: String,
    has_answer_time: bool,
}

impl Parser {
    /// Compiles and validates the pattern.
    ///
    /// `SourceIP`, `FileName`, `DestNode` and `Date` groups are required;
    /// `AnswerTime` is optional and defaults to zero when absent.
    pub fn new(pattern: &str, date_format: &str) -> Result<Self, ParseError> {
        let pattern = Regex::new(pattern)?;

        for group in REQUIRED_GROUPS {
            if !pattern.capture_names().flatten().any(|name| name == group) {
                return Err(ParseError::MissingGroup(group));
            }
        }
        let has_answer_time = pattern
            .capture_names()
            .flatten()
            .any(|name| name == ANSWER_TIME_GROUP);

        Ok(Self {
            pattern,
            date_format: date_format.to_string(),
            has_answer_time,
        })
    }

    /// Parses a single log line.
    pub fn parse(&self, line: &str) -> Result<LogRecord, ParseError> {
        let caps = self.pattern.captures(line).ok_or(ParseError::NoMatch)?;

        let group = |name: &'static str| -> Result<&str, ParseError> {
            caps.name(name)
                .map(|m| m.as_str())
                .ok_or(ParseError::MissingGroup(name))
        };

        let date_str = group("Date")?;
        let timestamp = NaiveDateTime::parse_from_str(date_str, &self.date_format)
            .map_err(|source| ParseError::InvalidDate {
                value: date_str.to_string(),
                source,
            })?
            .and_utc();

        let answer_time = if self.has_answer_time {
            match caps.name(ANSWER_TIME_GROUP) {
                Some(m) => parse_answer_time(m.as_str())
                    .ok_or_else(|| ParseError::InvalidAnswerTime(m.as_str().to_string()))?,
                None => Duration::ZERO,
            }
        } else {
            Duration::ZERO
        };

        Ok(LogRecord {
            source_ip: group("SourceIP")?.to_string(),
            file_name: group("FileName")?.to_string(),
            dest_node: group("DestNode")?.to_string(),
            timestamp,
            answer_time,
        })
    }
}

/// Parses duration strings as they appear in access logs: a decimal value
/// with an `ns`, `us`/`µs`, `ms` or `s` suffix, e.g. `1.003s`, `710.643µs`.
///
/// Integer arithmetic throughout; `1.003s` is exactly 1_003_000_000 ns,
/// never a float rounding away. Digits finer than a nanosecond are
/// truncated.
fn parse_answer_time(s: &str) -> Option<Duration> {
    let (value, scale_ns) = if let Some(v) = s.strip_suffix("ns") {
        (v, 1u64)
    } else if let Some(v) = s.strip_suffix("µs").or_else(|| s.strip_suffix("us")) {
        (v, 1_000)
    } else if let Some(v) = s.strip_suffix("ms") {
        (v, 1_000_000)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, 1_000_000_000)
    } else {
        return None;
    };

    let (int_part, frac_part) = match value.split_once('.') {
        Some((i, f)) => (i, f),
        None => (value, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }

    let whole: u64 = if int_part.is_empty() {
        0
    } else {
        int_part.parse().ok()?
    };

    let mut frac_ns = 0u64;
    let mut unit = scale_ns;
    for b in frac_part.bytes() {
        if !b.is_ascii_digit() {
            return None;
        }
        unit /= 10;
        frac_ns += u64::from(b - b'0') * unit;
    }

    let nanos = whole.checked_mul(scale_ns)?.checked_add(frac_ns)?;
    Some(Duration::from_nanos(nanos))
}
