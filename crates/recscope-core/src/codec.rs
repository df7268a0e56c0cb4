//! Byte/hex conversion.
//!
//! Hex renderings are uppercase and never read outside the input: ranges are
//! clamped to the available bytes.

use encoding_rs::{EncoderResult, Encoding, REPLACEMENT, UTF_16BE, UTF_16LE};
use std::ops::Range;

/// Clamps `offset..offset + length` to a buffer of `available` bytes
pub fn clamp_range(available: usize, offset: usize, length: usize) -> Range<usize> {
    let start = offset.min(available);
    let end = offset.saturating_add(length).min(available);
    start..end
}

/// Renders `length` bytes starting at `offset` as uppercase hex
pub fn encode_hex(data: &[u8], offset: usize, length: usize) -> String {
    hex::encode_upper(&data[clamp_range(data.len(), offset, length)])
}

/// Parses a hex dump, ignoring embedded whitespace
pub fn decode_hex(text: &str) -> Result<Vec<u8>, hex::FromHexError> {
    if text.chars().any(char::is_whitespace) {
        let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
        hex::decode(compact)
    } else {
        hex::decode(text)
    }
}

/// Returns true if text can be encoded into `encoding`'s own bytes
pub fn can_encode(encoding: &'static Encoding) -> bool {
    encoding != REPLACEMENT
}

/// Encodes `text` into `encoding`.
///
/// UTF-16 is written in its own byte order, and characters the charset
/// cannot represent become `?`.
pub fn encode_text(encoding: &'static Encoding, text: &str) -> Vec<u8> {
    if encoding == UTF_16LE {
        return text.encode_utf16().flat_map(u16::to_le_bytes).collect();
    }
    if encoding == UTF_16BE {
        return text.encode_utf16().flat_map(u16::to_be_bytes).collect();
    }

    let mut encoder = encoding.new_encoder();
    let mut out = Vec::with_capacity(
        encoder
            .max_buffer_length_from_utf8_without_replacement(text.len())
            .unwrap_or(text.len()),
    );
    let mut input = text;
    loop {
        let (result, read) =
            encoder.encode_from_utf8_to_vec_without_replacement(input, &mut out, true);
        input = &input[read..];
        match result {
            EncoderResult::InputEmpty => break,
            EncoderResult::OutputFull => out.reserve(input.len().max(4) * 4),
            EncoderResult::Unmappable(_) => out.push(b'?'),
        }
    }
    out
}
