//! Tag extraction from the leading comment line.
//!
//! If the first line of a submission is a `#` comment, its ASCII-alphanumeric
//! tokens (separated by commas and/or whitespace) become the tool's tags.
//! Scanning stops at the first character outside the grammar; tokens
//! accumulated up to that point are kept.

use std::collections::BTreeSet;

/// Parse tags from the first line of `source`.
///
/// Returns the empty set when the first line is not a comment. Duplicates
/// collapse; order is not part of the contract.
pub fn parse(source: &str) -> BTreeSet<String> {
    let mut tags = BTreeSet::new();
    let Some(first_line) = source.lines().next() else {
        return tags;
    };
    let Some(body) = first_line.trim_start().strip_prefix('#') else {
        return tags;
    };

    let mut current = String::new();
    for ch in body.chars() {
        if ch.is_ascii_alphanumeric() {
            current.push(ch);
        } else if ch.is_whitespace() || ch == ',' {
            if !current.is_empty() {
                tags.insert(std::mem::take(&mut current));
            }
        } else {
            break;
        }
    }
    if !current.is_empty() {
        tags.insert(current);
    }
    tags
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn space_separated_tags() {
        assert_eq!(parse("# alpha beta gamma\nx = 1\n"), set(&["alpha", "beta", "gamma"]));
    }

    #[test]
    fn comma_separated_tags() {
        assert_eq!(parse("# alpha, beta,gamma\n"), set(&["alpha", "beta", "gamma"]));
    }

    #[test]
    fn no_space_after_hash() {
        assert_eq!(parse("#alpha,beta\n"), set(&["alpha", "beta"]));
    }

    #[test]
    fn leading_whitespace_before_hash() {
        assert_eq!(parse("   # alpha\n"), set(&["alpha"]));
    }

    #[test]
    fn first_line_not_a_comment() {
        assert_eq!(parse("import os\n# alpha beta\n"), set(&[]));
    }

    #[test]
    fn empty_source() {
        assert_eq!(parse(""), set(&[]));
    }

    #[test]
    fn bare_hash() {
        assert_eq!(parse("#\n"), set(&[]));
    }

    #[test]
    fn scan_stops_at_junk_keeping_prefix() {
        // "data-set" contributes its alphanumeric prefix, then the scan ends
        assert_eq!(parse("# csv data-set more\n"), set(&["csv", "data"]));
    }

    #[test]
    fn junk_at_start_yields_nothing() {
        assert_eq!(parse("#!/usr/bin/env python\n"), set(&[]));
    }

    #[test]
    fn duplicates_collapse() {
        assert_eq!(parse("# a, a, b\n"), set(&["a", "b"]));
    }

    #[test]
    fn digits_are_valid_tag_characters() {
        assert_eq!(parse("# v2 utf8\n"), set(&["v2", "utf8"]));
    }
}
