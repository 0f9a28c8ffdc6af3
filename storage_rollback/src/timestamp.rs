//! Parsing of the human timestamp given to `--time`.
//!
//! The accepted layouts mirror what the two providers' consoles display
//! next to object versions, so a timestamp can be pasted straight from the
//! listing UI, plus RFC 2822 and RFC 3339. Every layout carries an
//! explicit UTC offset.

use anyhow::anyhow;
use chrono::{DateTime, Utc};

const LAYOUTS: &[&str] = &[
    // S3-console style, long and abbreviated months.
    "%B %d, %Y, %H:%M:%S (UTC%:z)",
    "%b %d, %Y, %H:%M:%S (UTC%:z)",
    "%B %d, %Y, %H:%M:%S (%:z)",
    "%b %d, %Y, %H:%M:%S (%:z)",
    // GCS-console style.
    "%b %d, %Y, %I:%M:%S %p %:z",
    "%B %d, %Y, %I:%M:%S %p %:z",
    // Plain date-time forms, day-first and year-first.
    "%d-%m-%Y %H:%M:%S %:z",
    "%d-%m-%Y %I:%M:%S %p %:z",
    "%Y-%m-%d %H:%M:%S %:z",
    "%Y-%m-%d %I:%M:%S %p %:z",
];

/// Parses `input` against every supported layout; the first match wins.
pub fn parse_timestamp(input: &str) -> anyhow::Result<DateTime<Utc>> {
    for layout in LAYOUTS {
        if let Ok(parsed) = DateTime::parse_from_str(input, layout) {
            return Ok(parsed.with_timezone(&Utc));
        }
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(input) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(input) {
        return Ok(parsed.with_timezone(&Utc));
    }
    Err(anyhow!(
        "could not parse timestamp '{input}' into any of the supported formats"
    ))
}
