//! Case-insensitive scans over raw header names and values.
//!
//! Header values arrive as byte sequences, possibly padded with
//! whitespace, so value checks trim before comparing.

#[inline(always)]
pub fn is_transfer_encoding(name: &str) -> bool {
    name.eq_ignore_ascii_case("transfer-encoding")
}

#[inline(always)]
pub fn is_content_length(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
}

#[inline(always)]
pub fn is_connection(name: &str) -> bool {
    name.eq_ignore_ascii_case("connection")
}

fn trim(val: &[u8]) -> &[u8] {
    let start = val.iter()
        .position(|&c| !matches!(c, b'\r' | b'\n' | b' ' | b'\t'))
        .unwrap_or(val.len());
    let end = val.iter()
        .rposition(|&c| !matches!(c, b'\r' | b'\n' | b' ' | b'\t'))
        .map(|x| x + 1)
        .unwrap_or(start);
    &val[start..end]
}

#[inline(always)]
pub fn is_close(val: &[u8]) -> bool {
    trim(val).eq_ignore_ascii_case(b"close")
}

#[inline(always)]
pub fn is_chunked(val: &[u8]) -> bool {
    trim(val).eq_ignore_ascii_case(b"chunked")
}
