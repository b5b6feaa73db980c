//! Extraction of the embedded JSON measurement from a binary archive.
//!
//! Archives are opaque containers (CAR files in practice) with exactly one
//! JSON object somewhere in the payload. Only the ASCII structural bytes
//! `{`, `}`, `"` and `\` matter for locating it, so the content is decoded
//! as UTF-8 when possible and as Latin-1 otherwise; non-ASCII bytes end up
//! verbatim inside string values.
//!
//! Nothing in this module performs I/O or returns an error: malformed input
//! of any kind is reported as `None`.

use serde::Deserialize;

use crate::measurement::Coordinate;

/// Field names that mark the start of a measurement object.
const EXPECTED_FIELDS: [&[u8]; 3] = [b"\"location\"", b"\"wifiName\"", b"\"speed\""];

/// How far past a candidate `{` to look for an expected field name.
const FIELD_SCAN_WINDOW: usize = 50;

/// The measurement object as it appears inside an archive.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchivePayload {
    pub location: Coordinate,
    pub speed: f64,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(alias = "networkName")]
    pub wifi_name: String,
    #[serde(alias = "reporterAddress")]
    pub wallet_address: String,
    #[serde(default)]
    pub ip: Option<String>,
}

/// Decode raw archive bytes and extract the embedded measurement payload.
///
/// Returns `None` when no opening brace exists, braces never balance, the
/// object is not valid JSON, or a required field is missing, mistyped or
/// empty.
pub fn extract_payload(bytes: &[u8]) -> Option<ArchivePayload> {
    let content = decode_text(bytes);
    let json = match extract_json_object(&content) {
        Some(json) => json,
        None => {
            tracing::debug!("no complete JSON object found in archive");
            return None;
        }
    };
    let payload: ArchivePayload = match serde_json::from_str(json) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::debug!(error = %e, "embedded JSON does not match the measurement format");
            return None;
        }
    };
    if payload.wifi_name.is_empty() || payload.wallet_address.is_empty() {
        tracing::debug!("embedded measurement has an empty network name or reporter");
        return None;
    }
    Some(payload)
}

/// Decode bytes as UTF-8, falling back to Latin-1 (every byte maps to the
/// code point of the same value).
pub fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_owned(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// Locate the embedded JSON object and return it as a slice of `content`.
pub fn extract_json_object(content: &str) -> Option<&str> {
    let start = find_object_start(content.as_bytes())?;
    let end = balanced_object_end(content.as_bytes(), start)?;
    Some(&content[start..end])
}

/// Find the first `{` followed by `"`, newline or space whose next few
/// bytes name an expected field, falling back to the first `{` at all.
fn find_object_start(bytes: &[u8]) -> Option<usize> {
    let candidate = bytes.iter().enumerate().position(|(i, &b)| {
        if b != b'{' || !matches!(bytes.get(i + 1), Some(b'"' | b'\n' | b' ')) {
            return false;
        }
        let window = &bytes[i..bytes.len().min(i + FIELD_SCAN_WINDOW)];
        EXPECTED_FIELDS.iter().any(|field| contains(window, field))
    });
    candidate.or_else(|| bytes.iter().position(|&b| b == b'{'))
}

/// Scan forward from the `{` at `start` and return the index one past its
/// matching `}`.
///
/// Braces inside string literals are ignored and a backslash escapes the
/// byte that follows it. Returns `None` if depth never returns to zero.
pub(crate) fn balanced_object_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth: usize = 0;
    let mut in_string = false;
    let mut escape_next = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if escape_next {
            escape_next = false;
            continue;
        }
        match b {
            b'\\' => escape_next = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
