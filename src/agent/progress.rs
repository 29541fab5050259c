//! Progress extraction from free-text coding agent output.
//!
//! The agent emits unstructured text. [`KeywordProgressFilter`] keeps the lines
//! that look like progress (known verbs, status glyphs, questions, headings)
//! so a human polling the job status sees roughly what the agent is doing.
//! The heuristic is lossy; pipelines only depend on the [`ProgressFilter`]
//! trait so a structured parser can replace it.

/// Maximum length of a published progress message, in characters.
pub const MAX_PROGRESS_LEN: usize = 120;

/// Minimum length of a line worth looking at, after trimming.
const MIN_LINE_LEN: usize = 3;

const PROGRESS_VERBS: &[&str] = &[
    "Analyzing",
    "Reading",
    "Processing",
    "Generating",
    "Creating",
    "Editing",
    "Writing",
    "Updating",
    "Searching",
    "Found",
    "Suggesting",
    "Applying",
    "Running",
    "Executing",
    "Checking",
    "Validating",
    "Building",
    "Testing",
];

const STATUS_GLYPHS: &[char] = &['✓', '✗', '●', '○', '→'];

/// Classifies one raw output line.
pub trait ProgressFilter: Send + Sync {
    /// Returns the cleaned line and whether it is worth surfacing.
    fn classify(&self, raw_line: &str) -> (String, bool);
}

/// Default vocabulary-based classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordProgressFilter;

impl ProgressFilter for KeywordProgressFilter {
    fn classify(&self, raw_line: &str) -> (String, bool) {
        let stripped = strip_ansi(raw_line);
        let cleaned = stripped.trim();
        if cleaned.chars().count() < MIN_LINE_LEN {
            return (cleaned.to_string(), false);
        }
        if !is_meaningful(cleaned) {
            return (cleaned.to_string(), false);
        }
        (truncate(cleaned, MAX_PROGRESS_LEN), true)
    }
}

fn is_meaningful(line: &str) -> bool {
    if PROGRESS_VERBS.iter().any(|verb| line.contains(verb)) {
        return true;
    }
    if line.contains(STATUS_GLYPHS) {
        return true;
    }
    line.contains('?') || line.ends_with(':')
}

/// Remove terminal escape sequences: ESC followed by everything up to and
/// including the next ASCII letter.
pub fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            for next in chars.by_ref() {
                if next.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn truncate(line: &str, max: usize) -> String {
    if line.chars().count() <= max {
        return line.to_string();
    }
    let kept: String = line.chars().take(max - 3).collect();
    format!("{}...", kept)
}
