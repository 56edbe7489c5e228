//! Diagnostics rewriting for sandbox output.
//!
//! The compiler reports positions against the generated entry point, which
//! lives under the container mount and starts with an injected preamble.
//! This module maps those positions back to what the user actually wrote.

use std::sync::OnceLock;

use regex::{Captures, Regex};

use crate::workspace::PREAMBLE_LINES;

/// Matches `<any path>/main.swift:LINE:COL:<whitespace>`.
///
/// A path component is required, so text that has already been rewritten
/// (`main.swift:6:3: `) is left alone.
fn diagnostic_location() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[^\s:]*/main\.swift:(\d+):(\d+):(\s)").expect("static pattern compiles")
    })
}

/// Strip the mount path from `main.swift` diagnostics and shift their line
/// numbers back by the preamble length.
///
/// Lines that fall inside the preamble keep their number; only the path is
/// removed. Anything outside a matched location is copied through as-is.
pub fn fix_line_numbers(text: &str) -> String {
    diagnostic_location()
        .replace_all(text, |caps: &Captures<'_>| {
            let line = caps[1]
                .parse::<u64>()
                .ok()
                .filter(|&line| line > PREAMBLE_LINES)
                .map_or_else(|| caps[1].to_string(), |line| (line - PREAMBLE_LINES).to_string());
            format!("main.swift:{line}:{}:{}", &caps[2], &caps[3])
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remaps_mount_path_and_line() {
        let input = "/workspace-mount/main.swift:10:3: error: cannot find 'x' in scope\n";
        assert_eq!(
            fix_line_numbers(input),
            "main.swift:6:3: error: cannot find 'x' in scope\n"
        );
    }

    #[test]
    fn remaps_every_occurrence() {
        let input = "/TEMP/main.swift:5:1: error: a\n\
                     /TEMP/main.swift:12:40: note: b\n";
        assert_eq!(
            fix_line_numbers(input),
            "main.swift:1:1: error: a\nmain.swift:8:40: note: b\n"
        );
    }

    #[test]
    fn handles_redacted_mount() {
        let input = "/[REDACTED]/main.swift:7:9: warning: unused\n";
        assert_eq!(fix_line_numbers(input), "main.swift:3:9: warning: unused\n");
    }

    #[test]
    fn text_without_locations_is_unchanged() {
        let input = "Hello, world!\nline 10:3: not a location\n";
        assert_eq!(fix_line_numbers(input), input);
    }

    #[test]
    fn already_fixed_text_is_stable() {
        let once = fix_line_numbers("/TEMP/main.swift:10:3: error: boom\n");
        assert_eq!(fix_line_numbers(&once), once);
    }

    #[test]
    fn preamble_lines_keep_their_number() {
        assert_eq!(
            fix_line_numbers("/TEMP/main.swift:2:1: error: glibc\n"),
            "main.swift:2:1: error: glibc\n"
        );
    }

    #[test]
    fn other_files_are_untouched() {
        let input = "/TEMP/other.swift:10:3: error: x\n";
        assert_eq!(fix_line_numbers(input), input);
    }
}
