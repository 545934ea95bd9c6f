//! Condensation of validation output into short, actionable excerpts.

use std::sync::LazyLock;

use regex::Regex;

const SEPARATOR_CHARS: &[char] = &['=', '-', '_', '*', '#'];
const ERROR_WORDS: &[&str] = &["error", "failed", "exception", "assert", "panicked"];
const REASON_MAX_CHARS: usize = 200;

/// Banner and progress lines that common test runners and build tools print
/// around the interesting part.
static NOISE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)^(?:
            =+\s.*\s=+                                   # pytest banners
          | platform\s\S+\s--\sPython.*                  # pytest header
          | (?:rootdir|cachedir|configfile|plugins):\s.*
          | collected\s\d+\s items?.*
          | collecting\s\.\.\..*
          | [.sFExX]+\s*(?:\[\s*\d+%\])?                 # pytest progress dots
          | (?:Compiling|Checking|Downloaded|Downloading|Finished|Running|Fresh|Blocking)\s.*
          | running\s\d+\s tests?
          | test\sresult:\sok\..*
          | >\s\S+@\S+\s.*                               # npm script banner
        )$",
    )
    .unwrap()
});

/// First non-blank line that is not a separator rule.
pub fn validation_hint(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !is_separator_line(line))
        .map(str::to_string)
}

/// First line that mentions an error word, clipped to a bounded length.
pub fn failure_reason(output: &str) -> Option<String> {
    output.lines().map(str::trim).find_map(|line| {
        let lowered = line.to_lowercase();
        ERROR_WORDS
            .iter()
            .any(|word| lowered.contains(word))
            .then(|| line.chars().take(REASON_MAX_CHARS).collect())
    })
}

/// Up to `max_lines` lines of output with blanks, separators and runner noise removed.
///
/// Lines that mention an error word are preferred; when there are none the first
/// remaining lines are used instead.
pub fn condense_failure(output: &str, max_lines: usize) -> Vec<String> {
    let useful: Vec<&str> = output
        .lines()
        .map(str::trim_end)
        .filter(|line| {
            let trimmed = line.trim_start();
            !trimmed.is_empty() && !is_separator_line(trimmed) && !NOISE_RE.is_match(trimmed)
        })
        .collect();

    let errors: Vec<&str> = useful
        .iter()
        .copied()
        .filter(|line| {
            let lowered = line.to_lowercase();
            ERROR_WORDS.iter().any(|word| lowered.contains(word))
        })
        .collect();

    let source = if errors.is_empty() { useful } else { errors };
    source
        .into_iter()
        .take(max_lines)
        .map(|line| line.chars().take(REASON_MAX_CHARS).collect())
        .collect()
}

fn is_separator_line(line: &str) -> bool {
    line.chars().count() >= 3 && line.chars().all(|c| SEPARATOR_CHARS.contains(&c))
}
