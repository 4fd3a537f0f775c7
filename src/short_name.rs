//! Short-name (8.3) codec.
//!
//! FAT directory entries store names as 11 bytes: an 8-byte base, space
//! padded, followed by a 3-byte extension, also space padded. This module
//! only ever produces and consumes that on-disk form for the base/extension
//! case; long filenames (LFN) are out of scope (Non-goals, §1) — directory
//! iteration skips LFN entries rather than decoding them (see
//! `directory::iter_entries`).

use crate::error::{Error, Result};
use alloc::string::String;

/// Characters legal in a short name, after uppercasing.
fn is_legal_sfn_char(c: u8) -> bool {
    c.is_ascii_uppercase() || c.is_ascii_digit() || c == b'_' || c == b'-' || c == b'~'
}

/// Longest name this codec will accept, "base.ext" included.
pub const VFS_NAME_MAX: usize = 12;

/// Parse a display name such as `"Hello.Txt"` into its on-disk, space-padded
/// 11-byte short-name form (`b"HELLO   TXT"`).
///
/// Rejects: empty names, names longer than [`VFS_NAME_MAX`], a base longer
/// than 8 characters, an extension longer than 3 characters, or any
/// character outside `{A-Z, 0-9, _, -, ~}` once uppercased.
pub fn parse_short_name(name: &str) -> Result<[u8; 11]> {
    if name.is_empty() || name.len() > VFS_NAME_MAX {
        return Err(Error::Invalid);
    }

    let (base, ext) = match name.rfind('.') {
        Some(i) => (&name[..i], &name[i + 1..]),
        None => (name, ""),
    };

    if base.is_empty() || base.len() > 8 || ext.len() > 3 {
        return Err(Error::Invalid);
    }

    let mut out = [b' '; 11];
    for (i, c) in base.bytes().enumerate() {
        let upper = c.to_ascii_uppercase();
        if !is_legal_sfn_char(upper) {
            return Err(Error::Invalid);
        }
        out[i] = upper;
    }
    for (i, c) in ext.bytes().enumerate() {
        let upper = c.to_ascii_uppercase();
        if !is_legal_sfn_char(upper) {
            return Err(Error::Invalid);
        }
        out[8 + i] = upper;
    }
    Ok(out)
}

/// Format an on-disk 11-byte short name back into a displayable
/// `"BASE.EXT"` string (no extension → just `"BASE"`).
///
/// Rejects any byte outside the printable ASCII range `[0x20, 0x7E]`.
pub fn format_short_name(raw: &[u8; 11]) -> Result<String> {
    for &b in raw {
        if !(0x20..=0x7E).contains(&b) {
            return Err(Error::Invalid);
        }
    }

    let base = core::str::from_utf8(&raw[0..8])
        .map_err(|_| Error::Invalid)?
        .trim_end();
    let ext = core::str::from_utf8(&raw[8..11])
        .map_err(|_| Error::Invalid)?
        .trim_end();

    let mut out = String::with_capacity(12);
    out.push_str(base);
    if !ext.is_empty() {
        out.push('.');
        out.push_str(ext);
    }
    Ok(out)
}

/// Microsoft's rotate-add checksum of the 11-byte short name, used to bind
/// long-name entries to the short entry they decorate. We never write LFN
/// entries, but reading this checksum is needed to recognize and skip an
/// orphaned LFN run that precedes a short entry.
pub fn checksum(raw: &[u8; 11]) -> u8 {
    let mut sum: u8 = 0;
    for &b in raw {
        sum = (if sum & 1 != 0 { 0x80u8 } else { 0u8 })
            .wrapping_add(sum >> 1)
            .wrapping_add(b);
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_pads() {
        let raw = parse_short_name("Hello.Txt").unwrap();
        assert_eq!(&raw, b"HELLO   TXT");
    }

    #[test]
    fn formats_back() {
        let raw = parse_short_name("Hello.Txt").unwrap();
        assert_eq!(format_short_name(&raw).unwrap(), "HELLO.TXT");
    }

    #[test]
    fn formats_without_extension() {
        let raw = parse_short_name("README").unwrap();
        assert_eq!(format_short_name(&raw).unwrap(), "README");
    }

    #[test]
    fn rejects_long_extension() {
        assert_eq!(parse_short_name("file.toolong"), Err(Error::Invalid));
    }

    #[test]
    fn rejects_long_base() {
        assert_eq!(parse_short_name("muchtoolongname.txt"), Err(Error::Invalid));
    }

    #[test]
    fn rejects_illegal_characters() {
        assert_eq!(parse_short_name("a+b.txt"), Err(Error::Invalid));
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(parse_short_name(""), Err(Error::Invalid));
    }

    #[test]
    fn round_trips_every_legal_byte() {
        let raw = [b'A'; 11];
        assert_eq!(parse_short_name(&format_short_name(&raw).unwrap()).unwrap(), raw);
    }

    #[test]
    fn checksum_matches_reference_algorithm() {
        let raw = *b"HELLO   TXT";
        let mut expected: u32 = 0;
        for &b in &raw {
            expected = (if expected & 1 != 0 { 0x80 } else { 0 }) + (expected >> 1) + b as u32;
            expected &= 0xFF;
        }
        assert_eq!(checksum(&raw), expected as u8);
    }
}
