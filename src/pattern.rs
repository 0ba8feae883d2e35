//! Wildcard path matching: `*` and `?` globs over path components, used by
//! capture configuration and path expansion.

use crate::dentry::{children_in_order, DentryRef};
use crate::encoding::{self, encode_utf16, is_path_separator};
use crate::Result;

/// Flags altering [`match_path`] semantics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchFlags {
    /// After all pattern components match, any remaining path components
    /// still count as a match ("this pattern matches the whole subtree").
    pub recursively: bool,
    /// If the path runs out before the pattern does, it still matches;
    /// useful for exclusion-exception lists, where an ancestor of a kept
    /// path must not be pruned.
    pub ancestors: bool,
}

impl MatchFlags {
    pub const NONE: MatchFlags = MatchFlags {
        recursively: false,
        ancestors: false,
    };
    pub const RECURSIVELY: MatchFlags = MatchFlags {
        recursively: true,
        ancestors: false,
    };
    pub const ANCESTORS: MatchFlags = MatchFlags {
        recursively: false,
        ancestors: true,
    };
}

fn chars_match(a: u16, b: u16, ignore_case: bool) -> bool {
    a == b || (ignore_case && encoding::upcase(a) == encoding::upcase(b))
}

/// Match one name against one pattern component. `*` matches zero or more
/// code units, `?` exactly one; neither crosses a path separator because
/// neither operand contains one.
fn string_matches_pattern(string: &[u16], pattern: &[u16], ignore_case: bool) -> bool {
    let mut s = string;
    let mut p = pattern;
    loop {
        let Some((&sc, s_rest)) = s.split_first() else {
            break;
        };
        let Some((&pc, p_rest)) = p.split_first() else {
            return false;
        };
        if pc == b'*' as u16 {
            return string_matches_pattern(s, p_rest, ignore_case)
                || string_matches_pattern(s_rest, p, ignore_case);
        }
        if pc != b'?' as u16 && !chars_match(sc, pc, ignore_case) {
            return false;
        }
        s = s_rest;
        p = p_rest;
    }
    while let Some((&pc, p_rest)) = p.split_first() {
        if pc != b'*' as u16 {
            return false;
        }
        p = p_rest;
    }
    true
}

fn skip_separators(units: &[u16]) -> &[u16] {
    let mut rest = units;
    while let Some((&first, tail)) = rest.split_first() {
        if !is_path_separator(first) {
            break;
        }
        rest = tail;
    }
    rest
}

fn split_component(units: &[u16]) -> (&[u16], &[u16]) {
    let end = units
        .iter()
        .position(|&c| is_path_separator(c))
        .unwrap_or(units.len());
    units.split_at(end)
}

fn basename(units: &[u16]) -> &[u16] {
    let trimmed = match units.iter().rposition(|&c| !is_path_separator(c)) {
        Some(last) => &units[..=last],
        None => return &units[..0],
    };
    match trimmed.iter().rposition(|&c| is_path_separator(c)) {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    }
}

/// Determine whether `path` matches the wildcard `pattern`.
///
/// A pattern with no leading separator is matched against the path's
/// basename only. Leading and trailing separators and the lengths of
/// interior separator runs are not significant. Matching case sensitivity
/// follows the process default.
pub fn match_path(path: &str, pattern: &str, flags: MatchFlags) -> bool {
    let path_units = encode_utf16(path);
    let pattern_units = encode_utf16(pattern);
    let ignore_case = encoding::default_ignore_case();

    let mut path: &[u16] = match pattern_units.first() {
        Some(&first) if is_path_separator(first) => &path_units,
        _ => basename(&path_units),
    };
    let mut pattern: &[u16] = &pattern_units;

    loop {
        path = skip_separators(path);
        pattern = skip_separators(pattern);

        if pattern.is_empty() {
            return path.is_empty() || flags.recursively;
        }
        if path.is_empty() {
            return flags.ancestors;
        }

        let (path_component, path_rest) = split_component(path);
        let (pattern_component, pattern_rest) = split_component(pattern);

        if !string_matches_pattern(path_component, pattern_component, ignore_case) {
            return false;
        }
        path = path_rest;
        pattern = pattern_rest;
    }
}

fn expand_recursive(
    dentry: &DentryRef,
    pattern: &[u16],
    ignore_case: bool,
    consume: &mut dyn FnMut(&DentryRef) -> Result<()>,
) -> Result<()> {
    let pattern = skip_separators(pattern);
    if pattern.is_empty() {
        return consume(dentry);
    }
    let (component, rest) = split_component(pattern);

    for child in children_in_order(dentry) {
        let name = child.borrow().name().to_vec();
        if string_matches_pattern(&name, component, ignore_case) {
            expand_recursive(&child, rest, ignore_case, consume)?;
        }
    }
    Ok(())
}

/// Walk the tree under `root` and invoke `consume` on every dentry whose
/// path from the root matches `pattern`.
pub fn expand_pattern(
    root: &DentryRef,
    pattern: &str,
    consume: &mut dyn FnMut(&DentryRef) -> Result<()>,
) -> Result<()> {
    expand_recursive(
        root,
        &encode_utf16(pattern),
        encoding::default_ignore_case(),
        consume,
    )
}

/// Does the string contain `*` or `?`.
pub fn is_wildcard_pattern(pattern: &str) -> bool {
    pattern.contains(['*', '?'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_globs() {
        assert!(match_path("SYSTEM.LOG", "SYSTEM*", MatchFlags::NONE));
        assert!(match_path("file.txt", "*.t?t", MatchFlags::NONE));
        assert!(!match_path("file.txt", "*.t?", MatchFlags::NONE));
        assert!(match_path("anything", "*", MatchFlags::NONE));
        // An empty path only matches through the ANCESTORS flag.
        assert!(!match_path("", "***", MatchFlags::NONE));
        assert!(match_path("", "***", MatchFlags::ANCESTORS));
    }

    #[test]
    fn star_does_not_cross_separators() {
        assert!(!match_path("\\dir\\sub\\file", "\\dir\\*", MatchFlags::NONE));
        assert!(match_path("\\dir\\sub", "\\dir\\*", MatchFlags::NONE));
    }

    #[test]
    fn basename_matching_without_leading_separator() {
        assert!(match_path(
            "\\Windows\\System32\\config\\SYSTEM.LOG",
            "SYSTEM*",
            MatchFlags::NONE
        ));
        assert!(!match_path(
            "\\Windows\\System32\\config\\SYSTEM.LOG",
            "config",
            MatchFlags::NONE
        ));
    }

    #[test]
    fn full_path_matching_with_flags() {
        assert!(match_path(
            "\\Windows\\System32\\config\\SYSTEM.LOG",
            "\\Windows\\System32\\config\\SYSTEM*",
            MatchFlags::NONE
        ));
        assert!(match_path("\\dir\\file", "\\dir", MatchFlags::RECURSIVELY));
        assert!(match_path("\\dir", "\\dir\\file", MatchFlags::ANCESTORS));
        assert!(!match_path("\\dir", "\\dir\\file", MatchFlags::NONE));
    }

    #[test]
    fn separator_runs_collapse() {
        assert!(match_path("/a//b///c", "/a/b/c", MatchFlags::NONE));
        assert!(match_path("/a/b/c/", "/a/b/c", MatchFlags::NONE));
    }
}
