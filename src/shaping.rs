//! Token Shaper (spec §4.B). Transforms raw stdout/stderr into a
//! size-bounded payload. Deterministic and idempotent under the same spec.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::model::{ShapingMode, ShapingSpec};

const BYTES_PER_TOKEN: usize = 4;

pub struct ShapedOutput {
    pub text: String,
    pub truncated: bool,
}

/// Shapes a single stream (stdout or stderr shape independently, per spec).
pub fn shape(raw: &str, spec: &ShapingSpec) -> ShapedOutput {
    match spec.mode {
        ShapingMode::Full => ShapedOutput { text: raw.to_string(), truncated: false },
        ShapingMode::Filter => shape_filter(raw, spec.regex.as_deref()),
        ShapingMode::Truncate => shape_truncate(raw, spec.max_tokens.unwrap_or(1024)),
    }
}

fn shape_filter(raw: &str, pattern: Option<&str>) -> ShapedOutput {
    let Some(pattern) = pattern else {
        return ShapedOutput { text: raw.to_string(), truncated: false };
    };
    let regex = match Regex::new(pattern) {
        Ok(re) => re,
        Err(_) => return ShapedOutput { text: String::new(), truncated: false },
    };
    let filtered: Vec<&str> = raw.lines().filter(|line| regex.is_match(line)).collect();
    ShapedOutput { text: filtered.join("\n"), truncated: false }
}

fn shape_truncate(raw: &str, max_tokens: usize) -> ShapedOutput {
    let budget = max_tokens.saturating_mul(BYTES_PER_TOKEN);
    let total = raw.len();
    if total <= budget {
        return ShapedOutput { text: raw.to_string(), truncated: false };
    }

    // Reserve room for the sentinel inside the budget (not on top of it) so
    // that re-shaping an already-truncated payload is a no-op: the output
    // length never exceeds `budget`, matching the idempotence property.
    // `dropped` (computed below) is always <= `total`, so its decimal
    // digit count is always <= that of `total` — using `total` itself as
    // the placeholder for `dropped` here gives a reserve that's always at
    // least as large as the sentinel actually emitted, regardless of where
    // `dropped` ends up falling relative to a power-of-ten boundary.
    let sentinel_guess = sentinel_line(total, total);
    let reserve = sentinel_guess.len() + 1; // +1 for the joining newline
    let keep_budget = budget.saturating_sub(reserve);
    let keep = floor_char_boundary(raw, keep_budget.min(total));
    let dropped = total - keep;
    let sentinel = sentinel_line(dropped, total);

    let mut text = String::with_capacity(keep + 1 + sentinel.len());
    text.push_str(&raw[..keep]);
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
    text.push_str(&sentinel);
    ShapedOutput { text, truncated: true }
}

fn sentinel_line(dropped: usize, total: usize) -> String {
    format!("... [truncated {dropped} of {total} bytes]")
}

/// `str::floor_char_boundary` is unstable; this is the same algorithm for a
/// `&str` that is known-valid UTF-8.
fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ShapingMode;

    fn spec(mode: ShapingMode, regex: Option<&str>, max_tokens: Option<usize>) -> ShapingSpec {
        ShapingSpec { mode, regex: regex.map(String::from), max_tokens }
    }

    #[test]
    fn full_mode_passes_through_unchanged() {
        let out = shape("hello\nworld\n", &spec(ShapingMode::Full, None, None));
        assert_eq!(out.text, "hello\nworld\n");
        assert!(!out.truncated);
    }

    #[test]
    fn filter_mode_keeps_matching_lines_in_order() {
        let raw = "alpha.conf\nbeta.txt\ngamma.conf\n";
        let out = shape(raw, &spec(ShapingMode::Filter, Some(r"\.conf$"), None));
        assert_eq!(out.text, "alpha.conf\ngamma.conf");
    }

    #[test]
    fn truncate_mode_respects_byte_budget() {
        let raw = "x".repeat(1000);
        let out = shape(&raw, &spec(ShapingMode::Truncate, None, Some(10)));
        assert!(out.truncated);
        assert!(out.text.len() <= 10 * BYTES_PER_TOKEN);
        assert!(out.text.contains("truncated"));
    }

    #[test]
    fn truncate_mode_is_idempotent() {
        let raw = "y".repeat(5000);
        let shaping = spec(ShapingMode::Truncate, None, Some(50));
        let once = shape(&raw, &shaping);
        let twice = shape(&once.text, &shaping);
        assert_eq!(once.text, twice.text);
    }

    /// Regression for the case where the initial sentinel-length guess
    /// (based on `total - budget`) undercounts the digits of the actual
    /// `dropped` value once the true `keep` is known, which previously
    /// let the emitted sentinel push `text.len()` one byte past `budget`
    /// and made a second `shape` call truncate further.
    #[test]
    fn truncate_mode_is_idempotent_across_digit_boundaries() {
        for max_tokens in [1usize, 5, 10, 50, 100, 245, 250, 999, 1000] {
            for total_len in [1usize, 10, 100, 999, 1000, 1001, 5000, 9999, 10000, 10001] {
                if total_len <= max_tokens * BYTES_PER_TOKEN {
                    continue;
                }
                let raw = "z".repeat(total_len);
                let shaping = spec(ShapingMode::Truncate, None, Some(max_tokens));
                let once = shape(&raw, &shaping);
                assert!(
                    once.text.len() <= max_tokens * BYTES_PER_TOKEN,
                    "budget exceeded for max_tokens={max_tokens} total_len={total_len}: {}",
                    once.text.len()
                );
                let twice = shape(&once.text, &shaping);
                assert_eq!(once.text, twice.text, "not idempotent for max_tokens={max_tokens} total_len={total_len}");
            }
        }
    }

    #[test]
    fn truncate_mode_leaves_short_input_untouched() {
        let out = shape("short", &spec(ShapingMode::Truncate, None, Some(1000)));
        assert!(!out.truncated);
        assert_eq!(out.text, "short");
    }

    #[test]
    fn truncate_mode_never_splits_a_utf8_codepoint() {
        let raw = "é".repeat(200); // each char is 2 bytes
        let out = shape(&raw, &spec(ShapingMode::Truncate, None, Some(5)));
        assert!(std::str::from_utf8(out.text.as_bytes()).is_ok());
    }
}
