//! Parsing and scrubbing of the handful of HTTP headers this crate cares
//! about: `Range`, `Content-Range`, `Accept-Ranges`, `ETag`, and the
//! conditional-request family.
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{
    HeaderMap, ACCEPT_RANGES, CONTENT_ENCODING, CONTENT_LENGTH, IF_MATCH, IF_MODIFIED_SINCE,
    IF_NONE_MATCH, IF_RANGE, IF_UNMODIFIED_SINCE,
};

/// A parsed `Range: bytes=start-end` (or `bytes=start-`) request header.
///
/// Only the single-range, absolute-start forms described in this crate's
/// scope are represented; suffix ranges (`bytes=-500`) and multi-range
/// requests are rejected by [`parse_request_range`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRange {
    /// First byte requested (inclusive).
    pub start: u64,
    /// Last byte requested (inclusive), or `None` for an open-ended range.
    pub end: Option<u64>,
}

/// Failure parsing a `Range` or `Content-Range` header.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HeaderParseError {
    /// The header value wasn't present at all.
    #[error("header missing")]
    Missing,

    /// The header didn't use the `bytes` unit, used a suffix range
    /// (`bytes=-500`), specified more than one range, or was otherwise
    /// malformed.
    #[error("malformed or unsupported range header: {0:?}")]
    Malformed(String),
}

static RANGE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^bytes=(\d+)-(\d*)$").unwrap());
static CONTENT_RANGE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^bytes (\d+)-(\d+)/(\d+|\*)$").unwrap());

/// Parse a request's `Range` header value.
///
/// Only `bytes=<start>-<end>` and `bytes=<start>-` are accepted. Suffix
/// ranges (`bytes=-500`) and comma-separated multi-range requests are
/// rejected, per this crate's scope.
///
/// # Errors
///
/// Returns [`HeaderParseError::Malformed`] if the value isn't a single,
/// absolute-start `bytes` range.
pub fn parse_request_range(value: &str) -> Result<RequestRange, HeaderParseError> {
    let caps = RANGE_RE
        .captures(value.trim())
        .ok_or_else(|| HeaderParseError::Malformed(value.to_owned()))?;

    let start: u64 = caps[1]
        .parse()
        .map_err(|_| HeaderParseError::Malformed(value.to_owned()))?;

    let end = if caps[2].is_empty() {
        None
    } else {
        let end: u64 = caps[2]
            .parse()
            .map_err(|_| HeaderParseError::Malformed(value.to_owned()))?;
        if end < start {
            return Err(HeaderParseError::Malformed(value.to_owned()));
        }
        Some(end)
    };

    Ok(RequestRange { start, end })
}

/// A parsed `Content-Range: bytes start-end/total` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// First byte of the range actually returned (inclusive).
    pub start: u64,
    /// Last byte of the range actually returned (inclusive).
    pub end: u64,
    /// Total resource size, if the server disclosed it (`*` means unknown).
    pub total: Option<u64>,
}

/// Parse a response's `Content-Range` header value.
///
/// # Errors
///
/// Returns [`HeaderParseError::Malformed`] for anything other than
/// `bytes <start>-<end>/<total-or-*>`.
pub fn parse_content_range(value: &str) -> Result<ContentRange, HeaderParseError> {
    let caps = CONTENT_RANGE_RE
        .captures(value.trim())
        .ok_or_else(|| HeaderParseError::Malformed(value.to_owned()))?;

    let start: u64 = caps[1]
        .parse()
        .map_err(|_| HeaderParseError::Malformed(value.to_owned()))?;
    let end: u64 = caps[2]
        .parse()
        .map_err(|_| HeaderParseError::Malformed(value.to_owned()))?;
    let total = if &caps[3] == "*" {
        None
    } else {
        Some(
            caps[3]
                .parse()
                .map_err(|_| HeaderParseError::Malformed(value.to_owned()))?,
        )
    };

    if end < start {
        return Err(HeaderParseError::Malformed(value.to_owned()));
    }

    Ok(ContentRange { start, end, total })
}

/// Does `Accept-Ranges` advertise support for byte ranges?
///
/// True iff one comma-separated entry, trimmed and compared
/// case-insensitively, equals `bytes`.
#[must_use]
pub fn accepts_byte_ranges(headers: &HeaderMap) -> bool {
    headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| {
            v.split(',')
                .any(|entry| entry.trim().eq_ignore_ascii_case("bytes"))
        })
}

/// Does the response carry any `Content-Encoding`? Any value at all
/// disqualifies a resource from byte-range splitting, since the encoded
/// byte offsets have nothing to do with the decoded content.
#[must_use]
pub fn has_content_encoding(headers: &HeaderMap) -> bool {
    headers.contains_key(CONTENT_ENCODING)
}

/// Read `Content-Length` as a `u64`, if present and valid.
#[must_use]
pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

/// Is an `ETag` value weak (prefixed with `W/`, case-insensitive) per
/// [RFC 7232 §2.3](https://www.rfc-editor.org/rfc/rfc7232#section-2.3)?
/// Weak validators must not be used with `If-Range`.
#[must_use]
pub fn is_weak_etag(etag: &str) -> bool {
    let trimmed = etag.trim();
    trimmed.len() >= 2 && trimmed[..2].eq_ignore_ascii_case("w/")
}

/// Remove the conditional-request header set (`If-Match`,
/// `If-None-Match`, `If-Modified-Since`, `If-Unmodified-Since`) from a
/// cloned request before this crate issues its own HEAD probe or ranged
/// GET. `Range` and `If-Range` are untouched — they are set explicitly by
/// the caller of this function.
pub fn scrub_conditional_headers(headers: &mut HeaderMap) {
    for name in [IF_MATCH, IF_NONE_MATCH, IF_MODIFIED_SINCE, IF_UNMODIFIED_SINCE] {
        headers.remove(name);
    }
    // IF_RANGE is intentionally left alone: callers set it themselves.
    let _ = IF_RANGE;
}
