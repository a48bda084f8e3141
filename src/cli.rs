//! Diagnostics helpers for the (out-of-scope) CLI binary: "did you mean?" suggestions and the
//! process exit-code mapping for surfaced errors.

use crate::error::Error;

/// Exit codes a driver binary should use when surfacing a [`Error`] to the shell:
/// `0` success, `1` a build/compile failure, `2` a configuration/usage error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    BuildFailed = 1,
    Configuration = 2,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Maps an [`Error`] to the exit code a CLI driver should terminate with.
pub fn exit_code_for(err: &Error) -> ExitCode {
    match err {
        Error::Configuration { .. } => ExitCode::Configuration,
        Error::Dependency { .. } => ExitCode::Configuration,
        Error::Compile { .. } => ExitCode::BuildFailed,
        Error::Cache(_) => ExitCode::BuildFailed,
        Error::Io { .. } => ExitCode::BuildFailed,
        Error::Cancelled => ExitCode::BuildFailed,
    }
}

/// Picks the closest match to `name` among `candidates` by Levenshtein edit distance, for
/// [`Error::configuration_with_suggestion`]'s "did you mean `x`?" text. Returns `None` when
/// `candidates` is empty or nothing is within a third of `name`'s own length (a wildly
/// different string is not a useful suggestion).
pub fn did_you_mean<'a>(name: &str, candidates: impl IntoIterator<Item = &'a str>) -> Option<&'a str> {
    let mut best: Option<(&str, usize)> = None;
    for candidate in candidates {
        let distance = levenshtein(name, candidate);
        if best.map(|(_, d)| distance < d).unwrap_or(true) {
            best = Some((candidate, distance));
        }
    }
    let (candidate, distance) = best?;
    let threshold = (name.len() / 3).max(1);
    if distance <= threshold {
        Some(candidate)
    } else {
        None
    }
}

/// Plain Levenshtein edit distance over `char`s; no extra crate needed beyond the string
/// handling the rest of the crate already uses.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();

    for i in 1..=a.len() {
        let mut prev_diag = row[0];
        row[0] = i;
        for j in 1..=b.len() {
            let above = row[j];
            let cost = if a[i - 1] == b[j - 1] { 0 } else { 1 };
            row[j] = (row[j] + 1).min(row[j - 1] + 1).min(prev_diag + cost);
            prev_diag = above;
        }
    }
    row[b.len()]
}
