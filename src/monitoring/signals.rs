//! Pattern detection over agent terminal output.
//!
//! These checks back the heuristic oracle: whether an agent is blocked on a
//! question, which error it last hit, and roughly which phase of the task it
//! is in.

use std::sync::LazyLock;

use regex::Regex;

use super::types::TrajectoryPhase;

/// Two or more consecutive numbered options ("1. ... / 2. ...").
static MULTIPLE_OPTIONS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*[>❯]?\s*1[.)]\s+.+\n\s*[>❯]?\s*2[.)]\s+").unwrap());

static OPTION_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[>❯]?\s*[1-9a-zA-Z][.)]\s+\S").unwrap());

static ERROR_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(^error\b|\berror(\[[A-Z]\d+\])?:|\bfailed\b|panicked at|traceback \(most recent call last\)|\bexception\b|command not found)")
        .unwrap()
});

const QUESTION_PHRASES: &[&str] = &[
    "do you want",
    "would you like",
    "should i",
    "shall i",
    "please confirm",
    "please select",
    "please choose",
    "choose an option",
    "select an option",
    "which option",
    "which one",
    "how should",
    "ready to proceed",
    "want me to",
    "like me to",
];

const INPUT_PROMPTS: &[&str] = &[
    "please provide",
    "please enter",
    "press enter",
    "press any key",
    "continue?",
    "proceed?",
    "(y/n)",
    "[y/n]",
    "(yes/no)",
    "[yes/no]",
];

/// Conditions that usually clear up on their own.
const TRANSIENT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "quota exceeded",
    "connection refused",
    "connection reset",
    "timed out",
    "503 service unavailable",
    "502 bad gateway",
    "overloaded",
    "network error",
];

/// Conditions a retry will not fix.
const FATAL_PATTERNS: &[&str] = &[
    "permission denied",
    "access denied",
    "authentication failed",
    "invalid credentials",
    "invalid api key",
    "no space left on device",
];

/// Phase keywords, checked from the most advanced phase down.
const PHASE_KEYWORDS: &[(TrajectoryPhase, &[&str])] = &[
    (
        TrajectoryPhase::Completed,
        &[
            "task complete",
            "task is complete",
            "all done",
            "successfully completed",
            "work is complete",
            "changes are complete",
        ],
    ),
    (
        TrajectoryPhase::Verification,
        &[
            "running tests",
            "cargo test",
            "pytest",
            "npm test",
            "go test",
            "test result",
            "tests passed",
            "verifying",
            "cargo check",
            "cargo build",
        ],
    ),
    (
        TrajectoryPhase::Implementation,
        &[
            "editing",
            "writing",
            "created file",
            "updated",
            "modified",
            "implementing",
            "applying",
            "adding",
            "refactoring",
        ],
    ),
    (
        TrajectoryPhase::Planning,
        &["plan:", "my plan", "approach", "step 1", "first, i will", "i'll start by", "todo"],
    ),
    (
        TrajectoryPhase::InformationGathering,
        &["reading", "searching", "grep", "looking at", "let me check", "found "],
    ),
    (
        TrajectoryPhase::Exploration,
        &["exploring", "listing", "ls ", "tree ", "directory structure"],
    ),
];

const NEGATIONS: &[&str] = &[
    "do not ",
    "don't ",
    "never ",
    "avoid ",
    "must not ",
    "mustn't ",
    "without ",
];

/// Whether `text` ends in something the agent expects a human to answer.
pub fn is_waiting_for_input(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    let last = trimmed.lines().last().unwrap_or("").trim();
    last.ends_with('?')
        || has_trailing_option_list(trimmed)
        || contains_any(last, INPUT_PROMPTS)
        || contains_any(last, QUESTION_PHRASES)
        || (last.ends_with(':') && !last.contains("..."))
}

/// The question the agent is blocked on, if any.
pub fn extract_question(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(prompt) = option_prompt(trimmed) {
        return Some(prompt);
    }
    let recent: Vec<&str> = trimmed.lines().rev().take(5).collect();
    recent
        .iter()
        .find(|l| l.trim().ends_with('?'))
        .or_else(|| {
            recent
                .iter()
                .find(|l| contains_any(l, INPUT_PROMPTS) || contains_any(l, QUESTION_PHRASES))
        })
        .map(|l| l.trim().to_string())
}

/// Whether the question offers numbered choices.
pub fn offers_options(text: &str) -> bool {
    MULTIPLE_OPTIONS_RE.is_match(text) || has_trailing_option_list(text)
}

/// Whether the question is a yes/no prompt.
pub fn is_yes_no(text: &str) -> bool {
    let lower = text.to_lowercase();
    ["(y/n)", "[y/n]", "(yes/no)", "[yes/no]"]
        .iter()
        .any(|p| lower.contains(p))
}

/// Most recent line reporting an error.
pub fn last_error(lines: &[String]) -> Option<String> {
    lines
        .iter()
        .rev()
        .map(|l| l.trim())
        .find(|l| !l.is_empty() && ERROR_LINE_RE.is_match(l))
        .map(String::from)
}

pub fn transient_pattern(text: &str) -> Option<&'static str> {
    first_match(text, TRANSIENT_PATTERNS)
}

pub fn fatal_pattern(text: &str) -> Option<&'static str> {
    first_match(text, FATAL_PATTERNS)
}

/// Phase suggested by the most recent line that mentions one.
pub fn infer_phase(lines: &[String]) -> TrajectoryPhase {
    for line in lines.iter().rev() {
        let lower = line.to_lowercase();
        if lower.trim().is_empty() {
            continue;
        }
        for (phase, keywords) in PHASE_KEYWORDS {
            if keywords.iter().any(|k| lower.contains(k)) {
                return *phase;
            }
        }
    }
    TrajectoryPhase::Unknown
}

/// The first negative constraint whose subject shows up in `text`.
///
/// Only "do not X" style constraints are checked; the first two words of X
/// have to appear together in the output.
pub fn violated_constraint<'a>(constraints: &'a [String], text: &str) -> Option<&'a str> {
    let lower = text.to_lowercase();
    constraints
        .iter()
        .find(|constraint| {
            let c = constraint.to_lowercase();
            NEGATIONS.iter().any(|neg| {
                c.find(neg).is_some_and(|idx| {
                    let subject: Vec<&str> = c[idx + neg.len()..]
                        .split_whitespace()
                        .filter(|w| !matches!(*w, "the" | "a" | "an" | "any"))
                        .take(2)
                        .collect();
                    subject.len() == 2 && lower.contains(&subject.join(" "))
                })
            })
        })
        .map(String::as_str)
}

fn option_prompt(text: &str) -> Option<String> {
    if !MULTIPLE_OPTIONS_RE.is_match(text) {
        return None;
    }
    let lines: Vec<&str> = text.lines().collect();
    let first_option = lines.iter().position(|l| OPTION_LINE_RE.is_match(l))?;
    lines[..first_option]
        .iter()
        .rev()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .map(String::from)
}

fn has_trailing_option_list(text: &str) -> bool {
    let mut options = 0;
    for line in text.lines().rev().take(6) {
        let trimmed = line.trim();
        if OPTION_LINE_RE.is_match(trimmed) {
            options += 1;
        } else if !trimmed.is_empty() {
            break;
        }
    }
    options >= 2
}

fn contains_any(text: &str, patterns: &[&str]) -> bool {
    let lower = text.to_lowercase();
    patterns.iter().any(|p| lower.contains(p))
}

fn first_match(text: &str, patterns: &[&'static str]) -> Option<&'static str> {
    let lower = text.to_lowercase();
    patterns.iter().copied().find(|p| lower.contains(p))
}
