//!
//! src/normalize.rs  Andrew Belles  Oct 16th, 2026
//!
//! Title normalization used for fuzzy matching and helpers for
//! pulling identifiers out of free form input
//!

use std::sync::LazyLock;

use regex::Regex;

use crate::errors::LinkerError;
use crate::types::Mbid;

static MBID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[a-f0-9]{8}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{4}-[a-f0-9]{12}")
        .expect("static mbid regex")
});

static WITHOUT_PAREN_CLAUSES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+?)(?:(?: \([^()]+\))+)?$").expect("static paren regex")
});

static LIVE_TITLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r".+\(live.*\)").expect("static live title regex")
});

/// Typographic punctuation folded to ascii before comparison
const ASCII_PUNCTUATION: [(char, &str); 17] = [
    ('…', "..."),
    ('‘', "'"),
    ('’', "'"),
    ('‚', "'"),
    ('“', "\""),
    ('”', "\""),
    ('„', "\""),
    ('′', "'"),
    ('″', "\""),
    ('‹', "<"),
    ('›', ">"),
    ('‐', "-"),
    ('‒', "-"),
    ('–', "-"),
    ('−', "-"),
    ('—', "-"),
    ('―', "--"),
];

pub fn normalize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    for c in title.chars().flat_map(char::to_lowercase) {
        if c.is_whitespace() {
            continue;
        }
        match ASCII_PUNCTUATION.iter().find(|(from, _)| *from == c) {
            Some((_, to)) => out.push_str(to),
            None => out.push(c)
        }
    }
    out
}

/// "Song (live) (remix)" -> "Song"
pub fn strip_paren_clauses(title: &str) -> &str {
    WITHOUT_PAREN_CLAUSES.captures(title)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(title)
}

/// Recording titles are compared without their trailing qualifiers
pub fn normalize_recording_title(title: &str) -> String {
    normalize_title(strip_paren_clauses(title))
}

/// First MBID found in a URL or bare identifier
pub fn extract_mbid(input: &str) -> Result<Mbid, LinkerError> {
    let lowered = input.to_lowercase();
    let found = MBID_REGEX.find(&lowered)
        .ok_or_else(|| LinkerError::Validation(format!("no mbid in {input:?}")))?;
    Mbid::parse(found.as_str())
}

/// Title or disambiguation marks the recording as a live performance
pub fn looks_live(title: &str, comment: Option<&str>) -> bool {
    LIVE_TITLE.is_match(title)
        || comment.map(|c| c.starts_with("live")).unwrap_or(false)
}
