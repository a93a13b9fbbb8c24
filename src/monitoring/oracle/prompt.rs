//! Prompt text for completion-backed providers.

use std::fmt::Write;

use crate::agent::TaskInfo;
use crate::util::truncate;

use super::{AgentStateRequest, CoherenceRequest, TrajectoryRequest};

pub const SYSTEM_PROMPT: &str = "You supervise autonomous coding agents. \
Answer with a single JSON object and nothing else.";

/// Cap on output lines quoted in a prompt.
const MAX_OUTPUT_LINES: usize = 120;

pub fn trajectory(request: &TrajectoryRequest) -> String {
    let snapshot = &request.trajectory;
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Agent {} is working on this task:", request.agent_id.short());
    push_task(&mut prompt, &request.task);

    let _ = writeln!(prompt, "\nGoals:");
    for goal in &snapshot.goals {
        let _ = writeln!(prompt, "- {}", goal);
    }
    if !snapshot.constraints.is_empty() {
        let _ = writeln!(prompt, "\nConstraints:");
        for constraint in &snapshot.constraints {
            let _ = writeln!(prompt, "- {}", constraint);
        }
    }

    let _ = writeln!(prompt, "\nCurrent phase: {}", snapshot.phase);
    if !snapshot.history.is_empty() {
        let _ = writeln!(prompt, "\nPrevious observations (oldest first):");
        for entry in &snapshot.history {
            let _ = writeln!(
                prompt,
                "- [{}] {} score={:.2} aligned={}: {}",
                entry.at.format("%H:%M:%S"),
                entry.phase,
                entry.score,
                entry.aligned,
                truncate(&entry.summary, 200)
            );
        }
    }

    let _ = writeln!(prompt, "\nNew output since the last check:");
    push_output(&mut prompt, &request.new_output);

    prompt.push_str(
        r#"
Judge whether the agent is still on a path to finishing the task. Respond with:
{
  "current_phase": "exploration|information_gathering|planning|implementation|verification|completed",
  "trajectory_aligned": true,
  "alignment_score": 0.0-1.0,
  "alignment_issues": ["..."],
  "needs_steering": false,
  "steering_type": null or "stuck|drifting|violating_constraints|over_engineering|confused",
  "steering_recommendation": null or "one or two sentences addressed to the agent",
  "trajectory_summary": "one sentence"
}
Set needs_steering to true only together with both steering_type and steering_recommendation."#,
    );
    prompt
}

pub fn agent_state(request: &AgentStateRequest) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "Agent {} was assigned:", request.agent_id.short());
    push_task(&mut prompt, &request.task);
    let _ = writeln!(
        prompt,
        "\nIts output has not changed for {} check(s). Recent output:",
        request.idle_cycles
    );
    push_output(&mut prompt, &request.output);
    prompt.push_str(
        r#"
Classify the agent. Respond with:
{
  "state": "healthy|stuck_waiting|stuck_error|stuck_confused|unrecoverable",
  "decision": "continue|nudge|answer|restart|recreate",
  "message": "text to type into the agent for nudge/answer, else empty",
  "reasoning": "one sentence",
  "confidence": 0.0-1.0
}"#,
    );
    prompt
}

pub fn coherence(request: &CoherenceRequest) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "System goals:");
    let _ = writeln!(prompt, "- Primary: {}", request.goals.primary);
    let _ = writeln!(prompt, "- Constraints: {}", request.goals.constraints);
    let _ = writeln!(prompt, "- Coordination: {}", request.goals.coordination);

    let _ = writeln!(prompt, "\nActive agents:");
    for agent in &request.agents {
        let summary = agent
            .judgment
            .as_ref()
            .map(|j| j.trajectory_summary.as_str())
            .unwrap_or("not yet evaluated");
        let _ = writeln!(
            prompt,
            "- id={} role={:?} state={} phase={} task=\"{}\": {}",
            agent.agent_id,
            agent.role,
            agent.state,
            agent.phase(),
            truncate(agent.task.description.trim(), 300),
            truncate(summary, 200)
        );
    }

    prompt.push_str(
        r#"
Assess whether the agents together serve the goals. Use the exact agent ids above. Respond with:
{
  "coherence_score": 0.0-1.0,
  "duplicates": [{"agents": ["id", "id"], "work": "what they both do"}],
  "alignment_issues": ["..."],
  "termination_recommendations": ["id"],
  "coordination_needs": [{"resource": "...", "agents": ["id"], "action": "..."}],
  "system_summary": "one or two sentences"
}"#,
    );
    prompt
}

pub fn enrich_task(task: &TaskInfo) -> String {
    let mut prompt = String::from("Rewrite this task so an autonomous coding agent can execute it:\n");
    push_task(&mut prompt, task);
    prompt.push_str(
        r#"
Respond with:
{
  "enriched_description": "...",
  "completion_criteria": ["..."],
  "estimated_complexity": 1-10
}"#,
    );
    prompt
}

pub fn agent_prompt(task: &TaskInfo) -> String {
    let mut prompt = String::from(
        "Write the opening instructions for a coding agent assigned the task below. \
         Reply with the instructions only, as plain text.\n",
    );
    push_task(&mut prompt, task);
    prompt
}

fn push_task(prompt: &mut String, task: &TaskInfo) {
    let _ = writeln!(prompt, "Task {}: {}", task.task_id, task.description.trim());
    if let Some(done) = &task.done_definition {
        let _ = writeln!(prompt, "Done when: {}", done.trim());
    }
}

fn push_output(prompt: &mut String, lines: &[String]) {
    if lines.is_empty() {
        prompt.push_str("(no new output)\n");
        return;
    }
    let start = lines.len().saturating_sub(MAX_OUTPUT_LINES);
    prompt.push_str("```\n");
    for line in &lines[start..] {
        prompt.push_str(line);
        prompt.push('\n');
    }
    prompt.push_str("```\n");
}
