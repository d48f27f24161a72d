//! Pane state inference from captured screen text.
//!
//! All screen-text heuristics live here. The built-in patterns match the
//! current wording of the supported worker CLIs; `[agents.<kind>]` in the
//! config file replaces any category per worker kind.
//!
//! ```
//! use crew::orchestration::pane::{PanePatterns, PaneState};
//!
//! let patterns = PanePatterns::default();
//! assert_eq!(patterns.classify("> working (esc to interrupt)", true), PaneState::Busy);
//! assert_eq!(patterns.classify("> ", true), PaneState::Idle);
//! assert_eq!(patterns.classify("> ", false), PaneState::Dead);
//! ```

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::config::PaneRules;
use crate::{Error, Result};

/// Trailing non-empty lines searched for a trust dialog.
const TRUST_WINDOW: usize = 12;
/// Trailing non-empty lines searched for a busy banner.
const BUSY_WINDOW: usize = 40;

static DEFAULT_BUSY: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)esc to interrupt").unwrap(),
        Regex::new(r"(?i)\bbackground terminal running\b").unwrap(),
    ]
});

static DEFAULT_TRUST_QUESTION: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![Regex::new(r"(?i)Do you trust the contents of this directory\?").unwrap()]
});

static DEFAULT_TRUST_CHOICE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![Regex::new(r"(?i)Yes,\s*continue|No,\s*quit|Press enter to continue").unwrap()]
});

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PaneState {
    Idle,
    Busy,
    /// A yes/no trust confirmation is on screen.
    Prompted,
    Dead,
}

#[derive(Debug, Clone)]
pub struct PanePatterns {
    busy: Vec<Regex>,
    trust_question: Vec<Regex>,
    trust_choice: Vec<Regex>,
}

impl Default for PanePatterns {
    fn default() -> Self {
        Self {
            busy: DEFAULT_BUSY.clone(),
            trust_question: DEFAULT_TRUST_QUESTION.clone(),
            trust_choice: DEFAULT_TRUST_CHOICE.clone(),
        }
    }
}

impl PanePatterns {
    /// Built-ins with `rules` layered on top. An empty category keeps the
    /// built-in list; an invalid expression is a configuration error.
    pub fn from_rules(rules: &PaneRules) -> Result<Self> {
        let mut patterns = Self::default();
        if !rules.busy_patterns.is_empty() {
            patterns.busy = compile(&rules.busy_patterns)?;
        }
        if !rules.trust_question_patterns.is_empty() {
            patterns.trust_question = compile(&rules.trust_question_patterns)?;
        }
        if !rules.trust_choice_patterns.is_empty() {
            patterns.trust_choice = compile(&rules.trust_choice_patterns)?;
        }
        Ok(patterns)
    }

    /// A trust question and one of its answer choices are both visible.
    pub fn has_trust_prompt(&self, capture: &str) -> bool {
        let tail = tail_lines(capture, TRUST_WINDOW);
        any_match(&self.trust_question, &tail) && any_match(&self.trust_choice, &tail)
    }

    pub fn is_busy(&self, capture: &str) -> bool {
        any_match(&self.busy, &tail_lines(capture, BUSY_WINDOW))
    }

    /// A trust dialog outranks a busy banner: the pane cannot make progress
    /// until the dialog is answered.
    pub fn classify(&self, capture: &str, alive: bool) -> PaneState {
        if !alive {
            PaneState::Dead
        } else if self.has_trust_prompt(capture) {
            PaneState::Prompted
        } else if self.is_busy(capture) {
            PaneState::Busy
        } else {
            PaneState::Idle
        }
    }
}

fn compile(sources: &[String]) -> Result<Vec<Regex>> {
    sources
        .iter()
        .map(|s| {
            Regex::new(s).map_err(|e| Error::Validation(format!("bad pane pattern {:?}: {}", s, e)))
        })
        .collect()
}

/// Last `n` non-empty lines, trimmed, one per line.
fn tail_lines(capture: &str, n: usize) -> Vec<String> {
    let lines: Vec<String> = capture
        .lines()
        .map(|l| l.replace('\r', "").trim().to_string())
        .filter(|l| !l.is_empty())
        .collect();
    lines[lines.len().saturating_sub(n)..].to_vec()
}

/// Patterns are tested line by line.
fn any_match(patterns: &[Regex], lines: &[String]) -> bool {
    lines.iter().any(|l| patterns.iter().any(|re| re.is_match(l)))
}

/// Drop carriage returns and collapse whitespace runs to single spaces.
pub fn normalize(text: &str) -> String {
    WHITESPACE_RE
        .replace_all(&text.replace('\r', ""), " ")
        .trim()
        .to_string()
}

/// Whether `text` still sits in the pane, ignoring line wrapping.
pub fn capture_contains(capture: &str, text: &str) -> bool {
    let needle = normalize(text);
    !needle.is_empty() && normalize(capture).contains(&needle)
}
