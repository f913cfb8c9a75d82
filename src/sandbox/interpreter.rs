//! Harness transcript interpretation.
//!
//! Pulls pass/fail/error counts out of the harness's human-readable summary
//! line. This is a coarse aggregate: individual test names are ignored and
//! any count that cannot be found is treated as zero.

use std::sync::LazyLock;

use regex::Regex;

use crate::domain::TestCounts;

static PASSED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s+passed").unwrap());
static FAILED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s+failed").unwrap());
static ERRORS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s+error").unwrap());

/// Parse a harness transcript into aggregate counts
pub fn parse(transcript: &str) -> TestCounts {
    TestCounts::from_parts(
        first_count(&PASSED, transcript),
        first_count(&FAILED, transcript),
        first_count(&ERRORS, transcript),
    )
}

/// First integer immediately preceding the token; 0 when absent or unparsable
fn first_count(pattern: &Regex, transcript: &str) -> u32 {
    pattern
        .captures(transcript)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0)
}
