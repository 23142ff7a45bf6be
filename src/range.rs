use std::num::ParseIntError;

use axum::http::HeaderValue;
use thiserror::Error;

const BYTES_PREFIX: &str = "bytes=";

/// A closed byte interval, inclusive on both ends.
///
/// Once produced by [`parse`], `end` is always less than the total length the
/// interval was resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteInterval {
    pub start: u64,
    pub end: u64,
}

impl ByteInterval {
    pub fn new(start: u64, end: u64) -> Self {
        ByteInterval { start, end }
    }

    /// Number of bytes covered, `end - start + 1`.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Classified result of resolving a `Range` header against a content length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RangeOutcome {
    Satisfiable(ByteInterval),
    /// Syntactically valid, but the start lies beyond the resource.
    Unsatisfiable,
    Malformed(MalformedRange),
}

impl RangeOutcome {
    /// Resolves an optional raw header value. A missing header or one that is
    /// not visible ASCII is malformed.
    pub fn from_header(value: Option<&HeaderValue>, total: u64) -> RangeOutcome {
        match value.map(HeaderValue::to_str) {
            None => RangeOutcome::Malformed(MalformedRange::Missing),
            Some(Err(_)) => RangeOutcome::Malformed(MalformedRange::NotAscii),
            Some(Ok(value)) => parse(value, total),
        }
    }

    pub fn interval(&self) -> Option<ByteInterval> {
        match self {
            RangeOutcome::Satisfiable(interval) => Some(*interval),
            _ => None,
        }
    }

    /// The satisfiable interval, or the error rejecting the range.
    pub fn into_interval(self, total: u64) -> crate::Result<ByteInterval> {
        match self {
            RangeOutcome::Satisfiable(interval) => Ok(interval),
            RangeOutcome::Unsatisfiable => Err(crate::Error::UnsatisfiableRange { total }),
            RangeOutcome::Malformed(reason) => Err(crate::Error::MalformedRange(reason)),
        }
    }
}

/// Reasons a range header is rejected before satisfiability is considered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedRange {
    #[error("missing range header")]
    Missing,
    #[error("range header is not visible ASCII")]
    NotAscii,
    #[error("invalid range header format: {0}")]
    InvalidFormat(String),
    #[error("only a single range is supported: {0}")]
    MultipleRanges(String),
    #[error("range header missing both start and end values")]
    EmptyBounds,
    #[error("invalid {field} position {value:?}: {source}")]
    InvalidNumber {
        field: &'static str,
        value: String,
        source: ParseIntError,
    },
    #[error("end position ({end}) cannot be less than start position ({start})")]
    EndBeforeStart { start: u64, end: i128 },
}

/// Resolves a `bytes=<start>-<end>` header value against `total` bytes.
///
/// Either side may be empty but not both. A missing start asks for the last
/// `end` bytes, a missing end runs to the end of the resource, and explicit
/// ends past the resource are clamped. Only a start at or beyond `total` is
/// [`RangeOutcome::Unsatisfiable`]; every other rejection is
/// [`RangeOutcome::Malformed`].
pub fn parse(header: &str, total: u64) -> RangeOutcome {
    match resolve(header, total) {
        Ok(Some(interval)) => RangeOutcome::Satisfiable(interval),
        Ok(None) => RangeOutcome::Unsatisfiable,
        Err(reason) => RangeOutcome::Malformed(reason),
    }
}

fn resolve(header: &str, total: u64) -> Result<Option<ByteInterval>, MalformedRange> {
    if header.is_empty() {
        return Err(MalformedRange::Missing);
    }

    let ranges = header
        .strip_prefix(BYTES_PREFIX)
        .ok_or_else(|| MalformedRange::InvalidFormat(header.to_string()))?;

    if ranges.contains(',') {
        return Err(MalformedRange::MultipleRanges(ranges.to_string()));
    }

    let (first, last) = match ranges.split('-').collect::<Vec<_>>()[..] {
        [first, last] => (first, last),
        _ => return Err(MalformedRange::InvalidFormat(ranges.to_string())),
    };

    // i128 keeps `total - 1` representable when total is zero
    let last_index = i128::from(total) - 1;

    let (start, end) = match (first, last) {
        ("", "") => return Err(MalformedRange::EmptyBounds),
        ("", suffix) => {
            let suffix = number("end", suffix)?;
            (total.saturating_sub(suffix), last_index)
        }
        (start, "") => (number("start", start)?, last_index),
        (start, end) => (number("start", start)?, i128::from(number("end", end)?)),
    };

    if end < i128::from(start) {
        return Err(MalformedRange::EndBeforeStart { start, end });
    }

    if start >= total {
        return Ok(None);
    }

    // start < total here, so last_index is non-negative and fits in u64
    let end = end.min(last_index) as u64;
    Ok(Some(ByteInterval::new(start, end)))
}

/// Positions are signed 64-bit on the wire, so anything past `i64::MAX` is
/// malformed. No sign survives the split on `-`, leaving only non-negative
/// values here.
fn number(field: &'static str, value: &str) -> Result<u64, MalformedRange> {
    value
        .parse::<i64>()
        .map(i64::unsigned_abs)
        .map_err(|source| MalformedRange::InvalidNumber {
            field,
            value: value.to_string(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn satisfiable(start: u64, end: u64) -> RangeOutcome {
        RangeOutcome::Satisfiable(ByteInterval::new(start, end))
    }

    #[test]
    fn test_parse_range_header() {
        let tests = [
            ("bytes=0-100", 200, satisfiable(0, 100)),
            ("bytes=0-", 500, satisfiable(0, 499)),
            ("bytes=-100", 500, satisfiable(400, 499)),
            ("bytes=100-", 500, satisfiable(100, 499)),
            ("bytes=100-200", 500, satisfiable(100, 200)),
            ("bytes=-1", 500, satisfiable(499, 499)),
            ("bytes=0-0", 500, satisfiable(0, 0)),
            ("bytes=0-24646", 500, satisfiable(0, 499)),
            ("bytes=900-999999", 1000, satisfiable(900, 999)),
            ("bytes=-5000", 1000, satisfiable(0, 999)),
            ("bytes=0-9223372036854775807", 1000, satisfiable(0, 999)),
            ("bytes=999-", 1000, satisfiable(999, 999)),
            ("bytes=1000-1005", 1000, RangeOutcome::Unsatisfiable),
            ("bytes=0-5", 0, RangeOutcome::Unsatisfiable),
        ];

        for (i, (header, total, expected)) in tests.iter().enumerate() {
            let result = parse(header, *total);
            assert_eq!(result, *expected, "Failed to parse range header #{i}: {header}");
        }
    }

    #[test]
    fn test_malformed_headers() {
        assert_matches!(parse("", 1000), RangeOutcome::Malformed(MalformedRange::Missing));
        assert_matches!(parse("bytes=", 1000), RangeOutcome::Malformed(MalformedRange::InvalidFormat(_)));
        assert_matches!(parse("foo=0-10", 1000), RangeOutcome::Malformed(MalformedRange::InvalidFormat(_)));
        assert_matches!(parse("bytes=-", 1000), RangeOutcome::Malformed(MalformedRange::EmptyBounds));
        assert_matches!(
            parse("bytes=10-5", 1000),
            RangeOutcome::Malformed(MalformedRange::EndBeforeStart { start: 10, end: 5 })
        );
        assert_matches!(parse("bytes=-1-5", 1000), RangeOutcome::Malformed(MalformedRange::InvalidFormat(_)));
        assert_matches!(parse("bytes=0-1,5-9", 1000), RangeOutcome::Malformed(MalformedRange::MultipleRanges(_)));
        assert_matches!(
            parse("bytes=a-9", 1000),
            RangeOutcome::Malformed(MalformedRange::InvalidNumber { field: "start", .. })
        );
        assert_matches!(
            parse("bytes=0-x", 1000),
            RangeOutcome::Malformed(MalformedRange::InvalidNumber { field: "end", .. })
        );
        assert_matches!(
            parse("bytes=0-9223372036854775808", 1000),
            RangeOutcome::Malformed(MalformedRange::InvalidNumber { field: "end", .. })
        );
        assert_matches!(
            parse("bytes=9223372036854775808-", 1000),
            RangeOutcome::Malformed(MalformedRange::InvalidNumber { field: "start", .. })
        );
        assert_matches!(
            parse("bytes=-18446744073709551615", 1000),
            RangeOutcome::Malformed(MalformedRange::InvalidNumber { field: "end", .. })
        );
        assert_matches!(parse("Bytes=0-9", 1000), RangeOutcome::Malformed(MalformedRange::InvalidFormat(_)));
    }

    #[test]
    fn test_open_range_past_end_is_malformed() {
        // end resolves to total - 1, which is already before the start
        assert_matches!(
            parse("bytes=1000-", 1000),
            RangeOutcome::Malformed(MalformedRange::EndBeforeStart { start: 1000, end: 999 })
        );
    }

    #[test]
    fn test_zero_suffix_and_empty_resource() {
        // `bytes=-0` resolves to start == total, which puts end before start
        assert_matches!(parse("bytes=-0", 1000), RangeOutcome::Malformed(MalformedRange::EndBeforeStart { .. }));
        assert_matches!(parse("bytes=0-", 0), RangeOutcome::Malformed(MalformedRange::EndBeforeStart { .. }));
        assert_matches!(parse("bytes=-10", 0), RangeOutcome::Malformed(MalformedRange::EndBeforeStart { .. }));
    }

    #[test]
    fn test_explicit_ranges_within_bounds() {
        for total in [1u64, 2, 7, 1000] {
            for start in 0..total.min(20) {
                for end in start..total.min(20) {
                    let header = format!("bytes={start}-{end}");
                    assert_eq!(parse(&header, total), satisfiable(start, end), "{header} of {total}");
                }
            }
        }
    }

    #[test]
    fn test_suffix_and_open_ranges() {
        for total in [1u64, 10, 1000] {
            for n in [1u64, 5, 10, 999, 1000, 1001] {
                let expected = satisfiable(total.saturating_sub(n), total - 1);
                assert_eq!(parse(&format!("bytes=-{n}"), total), expected);
            }
            for start in [0, total / 2, total - 1] {
                assert_eq!(parse(&format!("bytes={start}-"), total), satisfiable(start, total - 1));
            }
        }
    }

    #[test]
    fn test_parse_is_repeatable() {
        for header in ["bytes=0-499", "bytes=-20", "bytes=10-5", "bytes=2000-", ""] {
            assert_eq!(parse(header, 1000), parse(header, 1000));
        }
    }

    #[test]
    fn test_from_header() {
        assert_eq!(
            RangeOutcome::from_header(None, 10),
            RangeOutcome::Malformed(MalformedRange::Missing)
        );
        let value = HeaderValue::from_static("bytes=2-4");
        assert_eq!(RangeOutcome::from_header(Some(&value), 10), satisfiable(2, 4));
        let value = HeaderValue::from_bytes(b"bytes=\xff-1").unwrap();
        assert_eq!(
            RangeOutcome::from_header(Some(&value), 10),
            RangeOutcome::Malformed(MalformedRange::NotAscii)
        );
    }

    #[test]
    fn test_interval_len() {
        assert_eq!(ByteInterval::new(0, 499).len(), 500);
        assert_eq!(ByteInterval::new(30, 30).len(), 1);
        assert_eq!(parse("bytes=0-499", 1000).interval().map(|i| i.len()), Some(500));
        assert_eq!(RangeOutcome::Unsatisfiable.interval(), None);
    }

    #[test]
    fn test_into_interval() {
        assert_eq!(ByteInterval::new(2, 4), parse("bytes=2-4", 10).into_interval(10).unwrap());
        assert_matches!(
            parse("bytes=10-", 10).into_interval(10),
            Err(crate::Error::MalformedRange(MalformedRange::EndBeforeStart { .. }))
        );
        assert_matches!(
            parse("bytes=10-12", 10).into_interval(10),
            Err(crate::Error::UnsatisfiableRange { total: 10 })
        );
    }
}
