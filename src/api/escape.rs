//! Header escaping
//!
//! File names and `X-Bz-Info-*` values travel in HTTP headers, so anything
//! outside the unreserved URL characters is percent-encoded on the way out
//! and decoded on the way back in.

use super::{Error, Result};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Characters left as-is: alphanumerics, `/`, `-`, `_`, `.` and `~`.
const HEADER_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Percent-encode a header value.
pub fn escape(value: &str) -> String {
    utf8_percent_encode(value, HEADER_VALUE).to_string()
}

/// Decode a value produced by [`escape`] or by the service.
///
/// `+` decodes to a space.
pub fn unescape(value: &str) -> Result<String> {
    let plus_decoded = value.replace('+', " ");
    percent_decode_str(&plus_decoded)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| Error::InvalidHeader(format!("unescape {:?}: {}", value, e)))
}

/// Whether a request header carries user-supplied text that must be escaped.
pub(crate) fn needs_escape(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("x-bz-info") || lower.starts_with("x-bz-file-name")
}
