//! Byte ranges: the currency of this crate's chunk planning and `Range`
//! header construction.
use std::{
    fmt::Debug,
    ops::{Range, RangeInclusive},
};

use reqwest::header::HeaderValue;

/// An optionally half-open range of bytes.
pub trait ByteRange: Debug {
    /// The first byte of the range (inclusive).
    fn start(&self) -> u64;

    /// The last byte of the range (inclusive), if known.
    fn end(&self) -> Option<u64> {
        self.len().map(|len| self.start() + len - 1)
    }

    /// Length of the range in bytes, if known.
    fn len(&self) -> Option<u64>;

    /// Is the range empty?
    fn is_empty(&self) -> bool {
        self.len().is_some_and(|len| len == 0)
    }

    /// Format the `a-b` (or `a-`) segment of an HTTP `Range` header value.
    fn to_http_range(&self) -> String {
        format!(
            "{}-{}",
            self.start(),
            self.end().map(|n| n.to_string()).unwrap_or_default(),
        )
    }

    /// Format a complete [`Range`](https://developer.mozilla.org/en-US/docs/Web/HTTP/Headers/Range) header value.
    fn to_http(&self) -> HeaderValue {
        let s = format!("bytes={}", self.to_http_range());
        HeaderValue::from_str(&s).expect("byte range formats to a valid header value")
    }
}

/// A half-open byte range with a known start and unbounded end, e.g. the
/// `100-` form of a `Range` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OpenByteRange {
    start: u64,
}

impl OpenByteRange {
    /// Construct a new open-ended byte range starting at `start`.
    #[must_use]
    pub fn new(start: u64) -> Self {
        Self { start }
    }
}

impl ByteRange for OpenByteRange {
    fn start(&self) -> u64 {
        self.start
    }

    fn len(&self) -> Option<u64> {
        None
    }
}

/// A closed, inclusive byte range: `[start, end]`.
///
/// This is the shape every planned [`Chunk`](crate::chunk::Chunk) uses:
/// chunk intervals always have a known length, since planning requires
/// knowing the resource's total size up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClosedByteRange {
    start: u64,
    len: u64,
}

/// A byte range with `end < start`.
#[derive(Debug, thiserror::Error)]
#[error("byte range is backwards")]
pub struct BackwardsRangeError;

impl ClosedByteRange {
    /// Construct a closed byte range from a start and a length.
    #[must_use]
    pub fn new(start: u64, len: u64) -> Self {
        Self { start, len }
    }

    /// Construct a closed byte range from inclusive bounds `[first, last]`.
    ///
    /// # Errors
    ///
    /// Returns [`BackwardsRangeError`] if `first > last`.
    pub fn try_from_bounds(first: u64, last: u64) -> Result<Self, BackwardsRangeError> {
        if first > last {
            Err(BackwardsRangeError)
        } else {
            Ok(Self::new(first, last - first + 1))
        }
    }

    /// Number of bytes covered by this range.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether this range covers zero bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First byte of the range (inclusive).
    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Last byte of the range (inclusive).
    #[must_use]
    pub fn end(&self) -> u64 {
        self.start + self.len - 1
    }
}

impl ByteRange for ClosedByteRange {
    fn start(&self) -> u64 {
        self.start
    }

    fn len(&self) -> Option<u64> {
        Some(self.len)
    }
}

impl TryFrom<Range<u64>> for ClosedByteRange {
    type Error = BackwardsRangeError;

    fn try_from(r: Range<u64>) -> Result<Self, Self::Error> {
        Self::try_from_bounds(r.start, r.end.saturating_sub(1))
    }
}

impl TryFrom<RangeInclusive<u64>> for ClosedByteRange {
    type Error = BackwardsRangeError;

    fn try_from(r: RangeInclusive<u64>) -> Result<Self, Self::Error> {
        Self::try_from_bounds(*r.start(), *r.end())
    }
}

/// Partition `[0, total_size - 1]` into `num_chunks` closed byte ranges of
/// equal size, with the last chunk absorbing any remainder.
///
/// # Panics
///
/// Panics if `num_chunks` is zero.
#[must_use]
pub fn partition(total_size: u64, num_chunks: usize) -> Vec<ClosedByteRange> {
    assert!(num_chunks > 0, "cannot partition into zero chunks");

    let base = total_size / num_chunks as u64;
    let mut ranges = Vec::with_capacity(num_chunks);
    let mut start = 0u64;

    for i in 0..num_chunks {
        let len = if i + 1 == num_chunks {
            total_size - start
        } else {
            base
        };
        ranges.push(ClosedByteRange::new(start, len));
        start += len;
    }

    ranges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_closed_range() {
        let r = ClosedByteRange::try_from_bounds(5, 50).unwrap();
        assert_eq!(r.to_http_range(), "5-50");
        assert_eq!(r.to_http(), HeaderValue::from_static("bytes=5-50"));
    }

    #[test]
    fn formats_open_range() {
        let r = OpenByteRange::new(100);
        assert_eq!(r.to_http_range(), "100-");
    }

    #[test]
    fn rejects_backwards_bounds() {
        assert!(ClosedByteRange::try_from_bounds(10, 5).is_err());
    }

    #[test]
    fn partitions_evenly() {
        let chunks = partition(10_000, 4);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], ClosedByteRange::new(0, 2500));
        assert_eq!(chunks[1], ClosedByteRange::new(2500, 2500));
        assert_eq!(chunks[2], ClosedByteRange::new(5000, 2500));
        assert_eq!(chunks[3], ClosedByteRange::new(7500, 2500));

        let total: u64 = chunks.iter().map(ClosedByteRange::len).sum();
        assert_eq!(total, 10_000);
    }

    #[test]
    fn last_chunk_absorbs_remainder() {
        let chunks = partition(10_003, 4);
        assert_eq!(chunks[3].len(), 2503);
        assert_eq!(chunks.last().unwrap().end(), 10_002);

        // no overlap, full coverage
        let mut expect_next = 0u64;
        for c in &chunks {
            assert_eq!(c.start(), expect_next);
            expect_next = c.end() + 1;
        }
        assert_eq!(expect_next, 10_003);
    }

    #[test]
    fn single_chunk_when_one_requested() {
        let chunks = partition(42, 1);
        assert_eq!(chunks, vec![ClosedByteRange::new(0, 42)]);
    }
}
