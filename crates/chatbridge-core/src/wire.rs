//! Line-based wire codec for the bridge protocol.
//!
//! Wire format: `<PREFIX>::<field1>::<field2>::...::\n` — newline-delimited
//! UTF-8 text with `::` as the field separator. A trailing `::` before the
//! newline is part of the encoding, so consumers tolerate an empty final
//! token.

/// Field separator on the wire.
pub const FIELD_SEP: &str = "::";

/// Handshake tag expected as the first token of a connection's first line.
pub const HANDSHAKE_TAG: &str = "HSHK";

/// Sanitize a field value for embedding in a wire line.
///
/// Trims surrounding whitespace, replaces literal newlines with the
/// two-character sequence `\n`, and replaces the field separator `::` with
/// `:\:`. The separator pass runs twice so that overlapping runs (`:::`)
/// cannot leave a `::` behind after the first pass.
pub fn escape(value: &str) -> String {
    value
        .trim()
        .replace('\n', "\\n")
        .replace("::", ":\\:")
        .replace("::", ":\\:")
}

/// Restore escaped text for display.
///
/// Not an inverse of [`escape`]: the output is guaranteed to stay wire-safe,
/// so `:\:` collapses to a single `:` and the `\n` sequence becomes a space
/// instead of a real newline.
pub fn unescape(value: &str) -> String {
    value.replace(":\\:", ":").replace("\\n", " ")
}

/// Split a wire line into its `::`-separated tokens.
///
/// Strips the trailing newline (and any carriage return) first. The empty
/// token produced by the encoding's trailing `::` is kept; callers zip
/// tokens against expected fields and ignore the surplus.
pub fn split_fields(line: &str) -> Vec<&str> {
    line.trim_end_matches(['\r', '\n']).split(FIELD_SEP).collect()
}

/// Parse a handshake line of the shape `HSHK::<name>`.
///
/// Returns the client-supplied name, or `None` when the tag is wrong or the
/// name token is missing/empty — the caller falls back to the peer address
/// (a degraded handshake is legal, not fatal).
pub fn parse_handshake(line: &str) -> Option<&str> {
    let fields = split_fields(line);
    if fields.first() != Some(&HANDSHAKE_TAG) {
        return None;
    }
    match fields.get(1) {
        Some(name) if !name.is_empty() => Some(name),
        _ => None,
    }
}
