//! `[ADD]` Optional substring/regex filtering over `(key, value)` pairs.
//!
//! The wire protocol that would carry a filter expression from a client is
//! out of scope (spec.md §1); what the core exposes is the predicate itself,
//! applied by the caller to records an iterator yields (spec.md §2: "filters
//! run in the caller"). No dedicated teacher file covers this; it follows the
//! general `regex` crate usage pattern seen across the retrieved pack.

use regex::Regex;
use snafu::Snafu;

#[derive(Debug, Snafu)]
pub enum FilterError {
    #[snafu(display("invalid regular expression: {source}"))]
    InvalidRegex { source: regex::Error },
}

impl From<regex::Error> for FilterError {
    fn from(source: regex::Error) -> Self {
        FilterError::InvalidRegex { source }
    }
}

/// A predicate over a record's value, applied by the caller after an
/// iterator yields a `(key, value)` pair.
#[derive(Clone, Debug)]
pub enum RecordFilter {
    Substring(String),
    Regex(Regex),
}

impl RecordFilter {
    pub fn substring(needle: impl Into<String>) -> Self {
        RecordFilter::Substring(needle.into())
    }

    pub fn regex(pattern: &str) -> Result<Self, FilterError> {
        Ok(RecordFilter::Regex(Regex::new(pattern)?))
    }

    /// Whether `value` matches this filter. Non-UTF-8 values are matched
    /// lossily rather than rejected outright, since the data model places no
    /// encoding requirement on a record's bytes (spec.md §3).
    pub fn matches(&self, value: &[u8]) -> bool {
        match self {
            RecordFilter::Substring(needle) => {
                String::from_utf8_lossy(value).contains(needle.as_str())
            }
            RecordFilter::Regex(re) => re.is_match(&String::from_utf8_lossy(value)),
        }
    }
}
