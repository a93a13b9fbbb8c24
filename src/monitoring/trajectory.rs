//! Per-agent trajectory memory owned by a single Guardian.

use std::collections::VecDeque;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;

use crate::agent::TaskInfo;

use super::types::{GuardianJudgment, SteeringType, TrajectoryPhase};

/// Upper bound on constraints pulled from a task description.
pub const MAX_CONSTRAINTS: usize = 10;

static CONSTRAINT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(do not|don't|never|avoid|must not|mustn't|only use|must use|without)\b")
        .unwrap()
});

/// Condensed record of one past judgment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JudgmentSummary {
    pub at: DateTime<Utc>,
    pub phase: TrajectoryPhase,
    pub aligned: bool,
    pub score: f64,
    pub steering: Option<SteeringType>,
    pub summary: String,
}

impl JudgmentSummary {
    pub fn from_judgment(at: DateTime<Utc>, judgment: &GuardianJudgment) -> Self {
        Self {
            at,
            phase: judgment.current_phase,
            aligned: judgment.trajectory_aligned,
            score: judgment.alignment_score,
            steering: judgment.steering_type,
            summary: judgment.trajectory_summary.clone(),
        }
    }

    /// A cycle that produced no judgment (session unreadable).
    pub fn observation(at: DateTime<Utc>, phase: TrajectoryPhase, summary: impl Into<String>) -> Self {
        Self {
            at,
            phase,
            aligned: true,
            score: 0.5,
            steering: None,
            summary: summary.into(),
        }
    }
}

/// The previous output window, used to find where new output starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMarker {
    window: Vec<String>,
}

impl OutputMarker {
    fn from_lines(lines: &[String]) -> Option<Self> {
        if lines.iter().all(|l| l.trim().is_empty()) {
            return None;
        }
        Some(Self {
            window: lines.to_vec(),
        })
    }

    /// Index in `lines` just past the longest suffix of the previous window
    /// that `lines` starts with. Identical lines repeated at the tail are
    /// still counted, since the overlap has to cover the whole suffix.
    fn position_after(&self, lines: &[String]) -> Option<usize> {
        let previous = &self.window;
        (0..previous.len()).find_map(|shift| {
            let overlap = previous.len() - shift;
            (overlap <= lines.len() && previous[shift..] == lines[..overlap]).then_some(overlap)
        })
    }
}

/// What the oracle sees of the trajectory.
#[derive(Debug, Clone, Serialize)]
pub struct TrajectorySnapshot {
    pub phase: TrajectoryPhase,
    pub history: Vec<JudgmentSummary>,
    pub goals: Vec<String>,
    pub constraints: Vec<String>,
}

/// Accumulated understanding of one agent's progress.
///
/// Created on the agent's first evaluation and dropped with its Guardian.
#[derive(Debug, Clone)]
pub struct TrajectoryContext {
    phase: TrajectoryPhase,
    history: VecDeque<JudgmentSummary>,
    cap: usize,
    marker: Option<OutputMarker>,
    goals: Vec<String>,
    constraints: Vec<String>,
}

impl TrajectoryContext {
    pub fn new(task: &TaskInfo, cap: usize) -> Self {
        let mut goals = vec![task.description.trim().to_string()];
        if let Some(done) = &task.done_definition {
            if !done.trim().is_empty() {
                goals.push(format!("Done when: {}", done.trim()));
            }
        }
        Self {
            phase: TrajectoryPhase::Unknown,
            history: VecDeque::with_capacity(cap),
            cap: cap.max(1),
            marker: None,
            goals,
            constraints: extract_constraints(&task.description),
        }
    }

    /// Return the lines appended since the last call and advance the marker.
    ///
    /// When the new window does not continue the previous one (pane cleared,
    /// or more output than the window holds) the whole window counts as new.
    pub fn incorporate(&mut self, lines: &[String]) -> Vec<String> {
        let start = self
            .marker
            .as_ref()
            .and_then(|m| m.position_after(lines))
            .unwrap_or(0);
        if let Some(marker) = OutputMarker::from_lines(lines) {
            self.marker = Some(marker);
        }

        let fresh = &lines[start.min(lines.len())..];
        match fresh.iter().position(|l| !l.trim().is_empty()) {
            Some(first) => fresh[first..].to_vec(),
            None => Vec::new(),
        }
    }

    /// Forget the marker, e.g. after the process behind the session was replaced.
    pub fn reset_marker(&mut self) {
        self.marker = None;
    }

    pub fn has_marker(&self) -> bool {
        self.marker.is_some()
    }

    /// Append a summary, evicting the oldest once the cap is reached.
    pub fn record(&mut self, summary: JudgmentSummary) {
        while self.history.len() >= self.cap {
            self.history.pop_front();
        }
        self.history.push_back(summary);
    }

    pub fn set_phase(&mut self, phase: TrajectoryPhase) {
        if phase != TrajectoryPhase::Unknown {
            self.phase = phase;
        }
    }

    pub fn phase(&self) -> TrajectoryPhase {
        self.phase
    }

    pub fn history(&self) -> &VecDeque<JudgmentSummary> {
        &self.history
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn goals(&self) -> &[String] {
        &self.goals
    }

    pub fn constraints(&self) -> &[String] {
        &self.constraints
    }

    pub fn snapshot(&self) -> TrajectorySnapshot {
        TrajectorySnapshot {
            phase: self.phase,
            history: self.history.iter().cloned().collect(),
            goals: self.goals.clone(),
            constraints: self.constraints.clone(),
        }
    }
}

/// Pull sentences that restrict how the task may be done.
pub fn extract_constraints(description: &str) -> Vec<String> {
    description
        .split(|c: char| c == '.' || c == '\n' || c == ';')
        .map(str::trim)
        .filter(|s| !s.is_empty() && CONSTRAINT_RE.is_match(s))
        .take(MAX_CONSTRAINTS)
        .map(String::from)
        .collect()
}
