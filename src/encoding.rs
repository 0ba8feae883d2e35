//! UTF-16LE string utilities, the case-folding table, and the collation
//! order used to index the children of a directory.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::OnceLock;

/// Canonical path separator used when rendering full paths.
pub const PATH_SEPARATOR: char = '/';

/// Both separators are accepted on input paths and patterns; WIM filenames
/// may contain neither, so this is lossless.
pub fn is_path_separator(c: u16) -> bool {
    c == b'/' as u16 || c == b'\\' as u16
}

/// Case sensitivity behavior for name lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaseSensitivity {
    /// Use the process-wide default (see [`set_default_ignore_case`]).
    #[default]
    Default,
    Sensitive,
    Insensitive,
}

static DEFAULT_IGNORE_CASE: AtomicBool = AtomicBool::new(cfg!(windows));

/// Change the behavior of [`CaseSensitivity::Default`] lookups.
pub fn set_default_ignore_case(ignore_case: bool) {
    DEFAULT_IGNORE_CASE.store(ignore_case, AtomicOrdering::Relaxed);
}

pub fn default_ignore_case() -> bool {
    DEFAULT_IGNORE_CASE.load(AtomicOrdering::Relaxed)
}

pub fn will_ignore_case(case: CaseSensitivity) -> bool {
    match case {
        CaseSensitivity::Sensitive => false,
        CaseSensitivity::Insensitive => true,
        CaseSensitivity::Default => default_ignore_case(),
    }
}

fn upcase_table() -> &'static [u16] {
    static UPCASE: OnceLock<Vec<u16>> = OnceLock::new();
    let table = UPCASE.get_or_init(|| {
        let mut table = vec![0u16; 0x10000];
        for (i, slot) in table.iter_mut().enumerate() {
            let c = i as u16;
            *slot = match char::from_u32(c as u32) {
                Some(ch) => {
                    let mut up = ch.to_uppercase();
                    match (up.next(), up.next()) {
                        // Only simple, BMP-to-BMP mappings fold; anything
                        // else maps to itself, like the NTFS $UpCase table.
                        (Some(u), None) if (u as u32) <= 0xFFFF => u as u16,
                        _ => c,
                    }
                }
                None => c, // unpaired surrogate
            };
        }
        table
    });
    table.as_slice()
}

/// Map a single UTF-16 code unit through the case-folding table.
pub fn upcase(c: u16) -> u16 {
    upcase_table()[c as usize]
}

/// Lexicographic comparison of two UTF-16LE strings by code unit, optionally
/// folding each unit through the upcase table first.
pub fn cmp_utf16le(a: &[u16], b: &[u16], ignore_case: bool) -> Ordering {
    if ignore_case {
        let table = upcase_table();
        a.iter()
            .map(|&c| table[c as usize])
            .cmp(b.iter().map(|&c| table[c as usize]))
    } else {
        a.cmp(b)
    }
}

/// The two-level sibling collation: case-insensitive first, then
/// case-sensitive to break ties. Gives every sibling a distinct position
/// while keeping case-insensitive neighbors adjacent.
pub fn collate(a: &[u16], b: &[u16]) -> Ordering {
    cmp_utf16le(a, b, true).then_with(|| cmp_utf16le(a, b, false))
}

pub fn encode_utf16(s: &str) -> Vec<u16> {
    s.encode_utf16().collect()
}

pub fn utf16_to_string(units: &[u16]) -> String {
    String::from_utf16_lossy(units)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upcase_folds_ascii_and_preserves_nonletters() {
        assert_eq!(upcase(b'a' as u16), b'A' as u16);
        assert_eq!(upcase(b'Z' as u16), b'Z' as u16);
        assert_eq!(upcase(b'3' as u16), b'3' as u16);
        // U+00E9 'é' folds to U+00C9 'É'
        assert_eq!(upcase(0x00E9), 0x00C9);
        // U+00DF 'ß' has a multi-char uppercase mapping and must not fold
        assert_eq!(upcase(0x00DF), 0x00DF);
    }

    #[test]
    fn cmp_is_case_aware() {
        let foo = encode_utf16("foo");
        let upper = encode_utf16("FOO");
        let bar = encode_utf16("bar");
        assert_eq!(cmp_utf16le(&foo, &upper, true), Ordering::Equal);
        assert_ne!(cmp_utf16le(&foo, &upper, false), Ordering::Equal);
        assert_eq!(cmp_utf16le(&bar, &foo, true), Ordering::Less);
    }

    #[test]
    fn collation_breaks_case_ties_deterministically() {
        let foo = encode_utf16("foo");
        let upper = encode_utf16("FOO");
        assert_ne!(collate(&foo, &upper), Ordering::Equal);
        assert_eq!(collate(&foo, &foo), Ordering::Equal);
        // "FOO" < "foo" case-sensitively, so the tie-break keeps that order.
        assert_eq!(collate(&upper, &foo), Ordering::Less);
    }
}
