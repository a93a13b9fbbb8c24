//! End-to-end Guardian and Conductor scenarios.
//!
//! Each test drives sweeps or Conductor cycles by hand against fake sessions
//! and a scripted oracle, then checks what the monitor did to the agents.

use chrono::{Duration as ChronoDuration, Utc};

use overseer::monitoring::{
    AgentState, CoordinationNeed, DecisionKind, DuplicateGroup, EscalationSource, Intervention,
    MonitorEvent, MonitoringDecision, SessionHandle, SteeringType, SystemDecision,
};

use crate::fixtures::{
    coherent, misaligned, session_of, state_analysis, steering, test_config, Harness, ReadFailure,
    Script,
};

// ========== Guardian Scenarios ==========

/// Test: Identical output becomes stuck-waiting
/// Given an agent whose pane does not change between two sweeps
/// When the second sweep runs
/// Then the oracle is still asked, with no new output,
/// and the agent is classified StuckWaiting and nudged
#[tokio::test]
async fn test_identical_output_marks_stuck_waiting() {
    let h = Harness::new(test_config());
    let id = h
        .add_agent("agent-1", &["$ claude", "Reading src/report.rs", "Done reading."])
        .await;

    let first = h.monitor.run_guardian_sweep().await;
    let report = first.report_for(&id).expect("first report");
    assert_eq!(report.state, AgentState::Healthy);
    assert_eq!(report.new_lines, 3);

    let second = h.monitor.run_guardian_sweep().await;
    let report = second.report_for(&id).expect("second report");
    assert_eq!(report.state, AgentState::StuckWaiting);
    assert!(matches!(report.decision, MonitoringDecision::Nudge { .. }));
    assert_eq!(report.intervention, Intervention::Delivered { attempts: 1 });

    let requests = h.oracle.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].new_output.is_empty());
    assert_eq!(requests[1].trajectory.history.len(), 1);
}

/// Test: Persistent low alignment recreates the agent
/// Given an agent judged at 0.1 alignment for three cycles
/// When the third cycle runs
/// Then the agent is Unrecoverable, recreated, and its trajectory is dropped
#[tokio::test]
async fn test_low_alignment_streak_recreates_agent() {
    let mut h = Harness::new(test_config());
    let id = h.add_agent("agent-1", &["$ claude"]).await;
    for _ in 0..3 {
        h.oracle.push_trajectory(Script::Reply(misaligned(0.1)));
    }

    for step in 1..=2 {
        h.sessions.append(&session_of("agent-1"), &[format!("edit unrelated file {}", step).as_str()]);
        let sweep = h.monitor.run_guardian_sweep().await;
        let report = sweep.report_for(&id).unwrap();
        assert_eq!(report.state, AgentState::StuckConfused);
        assert_eq!(report.decision, MonitoringDecision::Continue);
    }

    h.sessions.append(&session_of("agent-1"), &["edit unrelated file 3"]);
    let sweep = h.monitor.run_guardian_sweep().await;
    let report = sweep.report_for(&id).unwrap();
    assert_eq!(report.state, AgentState::Unrecoverable);
    assert_eq!(report.decision, MonitoringDecision::Recreate);
    let Intervention::Recreated { replacement } = report.intervention.clone() else {
        panic!("expected a recreation, got {}", report.intervention);
    };

    assert_eq!(*h.sessions.recreated.lock().unwrap(), vec![id.clone()]);
    {
        let registry = h.monitor.registry();
        let registry = registry.read().await;
        assert!(!registry.contains(&id));
        assert!(!registry.has_guardian(&replacement));
        let entry = registry.get(&replacement).expect("replacement registered");
        assert_eq!(entry.restart_count, 1);
        assert_eq!(entry.task.task_id.as_str(), "task-agent-1");
    }

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        MonitorEvent::AgentReplaced { old, new } if old == &id && new == &replacement
    )));

    // The replacement starts over with an empty trajectory.
    let sweep = h.monitor.run_guardian_sweep().await;
    assert!(sweep.report_for(&replacement).is_some());
    let last = h.oracle.requests().pop().unwrap();
    assert_eq!(last.agent_id, replacement);
    assert!(last.trajectory.history.is_empty());
}

/// Test: Restart ceiling
/// Given an agent that needs a restart every cycle and a ceiling of 3
/// When a fourth and fifth restart are requested
/// Then both are refused, the agent is Unrecoverable and escalated once
#[tokio::test]
async fn test_restart_ceiling_refuses_and_escalates_once() {
    let mut config = test_config();
    config.monitor.confused_cycles = 1;
    config.monitor.restart_ceiling = 3;
    let mut h = Harness::new(config);
    let id = h.add_agent("agent-1", &["$ claude"]).await;

    for cycle in 1..=5u32 {
        h.oracle.push_trajectory(Script::Reply(steering(
            SteeringType::Confused,
            "Re-read the task description before editing anything else.",
        )));
        h.sessions.append(&session_of("agent-1"), &[format!("which file was it again? ({})", cycle).as_str()]);
        let sweep = h.monitor.run_guardian_sweep().await;
        let report = sweep.report_for(&id).unwrap();
        assert_eq!(report.decision, MonitoringDecision::Restart);
        if cycle <= 3 {
            assert_eq!(report.intervention, Intervention::Restarted { restart_count: cycle });
            assert_eq!(report.state, AgentState::StuckConfused);
        } else {
            assert_eq!(report.intervention, Intervention::RestartRefused { restarts: 3 });
            assert_eq!(report.state, AgentState::Unrecoverable);
        }
        if cycle == 4 {
            let escalations = h.drain_escalations();
            assert_eq!(escalations.len(), 1);
            assert_eq!(escalations[0].source, EscalationSource::Guardian);
            assert_eq!(escalations[0].agent_id.as_ref(), Some(&id));
        }
    }

    assert_eq!(h.sessions.restarted.lock().unwrap().len(), 3);
    assert!(h.drain_escalations().is_empty());
    let registry = h.monitor.registry();
    let registry = registry.read().await;
    let entry = registry.get(&id).unwrap();
    assert_eq!(entry.state, AgentState::Unrecoverable);
    assert_eq!(entry.restart_count, 3);
}

/// Test: Vanished session
/// Given an agent whose tmux session disappeared
/// When the Guardian tries to restart it
/// Then the agent is deregistered instead
#[tokio::test]
async fn test_vanished_session_is_deregistered() {
    let mut h = Harness::new(test_config());
    let id = h.add_agent("agent-1", &["$ claude"]).await;
    h.sessions.close(&session_of("agent-1"));

    let sweep = h.monitor.run_guardian_sweep().await;
    let report = sweep.report_for(&id).unwrap();
    assert_eq!(report.state, AgentState::StuckError);
    assert_eq!(report.decision, MonitoringDecision::Restart);
    assert_eq!(report.intervention, Intervention::AgentGone);
    assert_eq!(h.oracle.trajectory_calls(), 0);

    assert!(!h.monitor.registry().read().await.contains(&id));
    assert!(h.drain_events().iter().any(|e| matches!(
        e,
        MonitorEvent::AgentRemoved { agent_id, .. } if agent_id == &id
    )));
}

/// Test: Steering delivery
/// Given a drifting agent
/// When the Guardian nudges it
/// Then one tagged message carrying the recommendation reaches the session
#[tokio::test]
async fn test_drift_nudge_is_tagged_and_verified() {
    let h = Harness::new(test_config());
    let id = h.add_agent("agent-1", &["$ claude", "Refactoring the logger"]).await;
    h.oracle.push_trajectory(Script::Reply(steering(
        SteeringType::Drifting,
        "Leave the logger alone and finish the CSV export.",
    )));

    let sweep = h.monitor.run_guardian_sweep().await;
    let report = sweep.report_for(&id).unwrap();
    assert_eq!(report.state, AgentState::StuckConfused);
    assert_eq!(report.intervention, Intervention::Delivered { attempts: 1 });

    let sent = h.sessions.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1.contains("[GUARDIAN "));
    assert!(sent[0].1.contains("- DRIFTING]"));
    assert!(sent[0].1.contains("finish the CSV export"));
}

/// Test: Queued-message suppression
/// Given a pane showing the agent still has a queued message
/// When a nudge is due
/// Then nothing is sent
#[tokio::test]
async fn test_queued_message_suppresses_nudge() {
    let h = Harness::new(test_config());
    let id = h
        .add_agent("agent-1", &["$ claude", "Press up to edit queued messages"])
        .await;
    h.oracle.push_trajectory(Script::Reply(steering(SteeringType::Stuck, "Run the tests.")));

    let sweep = h.monitor.run_guardian_sweep().await;
    let report = sweep.report_for(&id).unwrap();
    assert!(matches!(report.intervention, Intervention::Suppressed { .. }));
    assert_eq!(h.sessions.sends_to(&id), 0);
}

/// Test: Steering cooldown
/// Given a five minute steering cooldown
/// When two nudges are due on consecutive cycles
/// Then only the first is sent
#[tokio::test]
async fn test_steering_cooldown_suppresses_second_nudge() {
    let mut config = test_config();
    config.monitor.steering_cooldown_secs = 300;
    let h = Harness::new(config);
    let id = h.add_agent("agent-1", &["$ claude", "thinking"]).await;
    for _ in 0..2 {
        h.oracle.push_trajectory(Script::Reply(steering(SteeringType::Stuck, "Run the tests.")));
    }

    let first = h.monitor.run_guardian_sweep().await;
    assert_eq!(
        first.report_for(&id).unwrap().intervention,
        Intervention::Delivered { attempts: 1 }
    );
    h.sessions.append(&session_of("agent-1"), &["still thinking"]);
    let second = h.monitor.run_guardian_sweep().await;
    assert!(matches!(
        second.report_for(&id).unwrap().intervention,
        Intervention::Suppressed { .. }
    ));
    assert_eq!(h.sessions.sends_to(&id), 1);
}

// ========== Session Read Scenarios ==========

/// Test: A slow session read is not a dead agent
/// Given an agent whose session reads time out on every attempt
/// When a Guardian cycle runs
/// Then the read is retried, the cycle ends with CONTINUE,
/// and the agent is neither restarted nor deregistered
#[tokio::test]
async fn test_read_timeouts_skip_the_cycle() {
    let h = Harness::new(test_config());
    let id = h.add_agent("agent-1", &["$ claude", "compiling"]).await;
    h.sessions.fail_reads(&session_of("agent-1"), 3, ReadFailure::Timeout);

    let sweep = h.monitor.run_guardian_sweep().await;
    let report = sweep.report_for(&id).unwrap();
    assert_eq!(report.decision, MonitoringDecision::Continue);
    assert_eq!(report.intervention, Intervention::None);
    assert_eq!(report.state, AgentState::Healthy);
    assert_eq!(h.sessions.reads(), 3);
    assert_eq!(h.sessions.lifecycle_calls(), 0);
    assert_eq!(h.oracle.trajectory_calls(), 0);

    let registry = h.monitor.registry();
    let registry = registry.read().await;
    assert!(registry.contains(&id));
    assert_eq!(registry.get(&id).unwrap().restart_count, 0);
}

/// Test: A transient tmux error is retried within the cycle
/// Given an agent whose first session read fails with a tmux error
/// When a Guardian cycle runs
/// Then the second read succeeds and the cycle proceeds normally
#[tokio::test]
async fn test_tmux_read_error_recovers_on_retry() {
    let h = Harness::new(test_config());
    let id = h.add_agent("agent-1", &["$ claude", "editing src/report.rs"]).await;
    h.sessions.fail_reads(&session_of("agent-1"), 1, ReadFailure::Tmux);

    let sweep = h.monitor.run_guardian_sweep().await;
    let report = sweep.report_for(&id).unwrap();
    assert_eq!(report.state, AgentState::Healthy);
    assert_eq!(report.new_lines, 2);
    assert_eq!(h.sessions.reads(), 2);
    assert_eq!(h.oracle.trajectory_calls(), 1);
    assert_eq!(h.sessions.lifecycle_calls(), 0);
}

/// Test: An exited agent process is restarted in place
/// Given an agent whose process exited while its pane stayed open
/// When a Guardian cycle runs
/// Then the agent is StuckError and restarted, stays registered,
/// and is evaluated normally on the next sweep
#[tokio::test]
async fn test_exited_process_is_restarted() {
    let h = Harness::new(test_config());
    let id = h.add_agent("agent-1", &["$ claude", "panicked: index out of bounds"]).await;
    h.sessions.exit_process(&session_of("agent-1"));

    let sweep = h.monitor.run_guardian_sweep().await;
    let report = sweep.report_for(&id).unwrap();
    assert_eq!(report.state, AgentState::StuckError);
    assert_eq!(report.decision, MonitoringDecision::Restart);
    assert_eq!(report.intervention, Intervention::Restarted { restart_count: 1 });
    assert_eq!(h.sessions.reads(), 1);
    assert_eq!(h.oracle.trajectory_calls(), 0);
    assert!(h.monitor.registry().read().await.contains(&id));

    h.sessions.append(&session_of("agent-1"), &["Re-reading src/report.rs"]);
    let sweep = h.monitor.run_guardian_sweep().await;
    let report = sweep.report_for(&id).unwrap();
    assert_eq!(report.state, AgentState::Healthy);
    assert_eq!(h.oracle.trajectory_calls(), 1);
}

// ========== First-Pass Scenarios ==========

fn first_pass_config() -> overseer::config::Config {
    let mut config = test_config();
    config.monitor.first_pass_check = true;
    config
}

/// Test: A confident healthy first pass skips trajectory analysis
/// Given the coarse state check answers HEALTHY/CONTINUE with high confidence
/// When a Guardian cycle sees new output
/// Then the cycle ends healthy without a trajectory call
#[tokio::test]
async fn test_confident_healthy_first_pass_skips_trajectory() {
    let h = Harness::new(first_pass_config());
    let id = h.add_agent("agent-1", &["$ claude", "Writing tests for export"]).await;
    h.oracle
        .push_state(Script::Reply(state_analysis(AgentState::Healthy, DecisionKind::Continue, "")));

    let sweep = h.monitor.run_guardian_sweep().await;
    let report = sweep.report_for(&id).unwrap();
    assert_eq!(report.state, AgentState::Healthy);
    assert_eq!(report.decision, MonitoringDecision::Continue);
    assert!(report.judgment.is_none());
    assert_eq!(h.oracle.state_calls(), 1);
    assert_eq!(h.oracle.trajectory_calls(), 0);
}

/// Test: A first-pass answer is typed into the session as is
/// Given an agent asking a question and a confident ANSWER from the state check
/// When a Guardian cycle runs
/// Then exactly the answer text is sent, without a steering header
#[tokio::test]
async fn test_first_pass_answer_is_sent_raw() {
    let h = Harness::new(first_pass_config());
    let id = h
        .add_agent("agent-1", &["$ claude", "Which delimiter should the export use? (comma/tab)"])
        .await;
    h.oracle.push_state(Script::Reply(state_analysis(
        AgentState::StuckWaiting,
        DecisionKind::Answer,
        "comma",
    )));

    let sweep = h.monitor.run_guardian_sweep().await;
    let report = sweep.report_for(&id).unwrap();
    assert_eq!(report.state, AgentState::StuckWaiting);
    assert_eq!(
        report.decision,
        MonitoringDecision::Answer {
            message: "comma".to_string()
        }
    );
    assert_eq!(report.intervention, Intervention::Delivered { attempts: 1 });
    assert_eq!(*h.sessions.sent.lock().unwrap(), vec![(id.clone(), "comma".to_string())]);
    assert_eq!(h.oracle.trajectory_calls(), 0);
}

/// Test: A first-pass answer waits for a queued message
/// Given the pane shows a message still queued in the agent's input
/// When the state check answers a question
/// Then nothing is sent
#[tokio::test]
async fn test_first_pass_answer_suppressed_while_queued() {
    let h = Harness::new(first_pass_config());
    let id = h
        .add_agent(
            "agent-1",
            &["$ claude", "Which delimiter? (comma/tab)", "Press up to edit queued messages"],
        )
        .await;
    h.oracle.push_state(Script::Reply(state_analysis(
        AgentState::StuckWaiting,
        DecisionKind::Answer,
        "comma",
    )));

    let sweep = h.monitor.run_guardian_sweep().await;
    let report = sweep.report_for(&id).unwrap();
    assert!(matches!(report.intervention, Intervention::Suppressed { .. }));
    assert_eq!(h.sessions.sends_to(&id), 0);
}

/// Test: An unrecoverable agent is never answered
/// Given a state check that keeps pairing UNRECOVERABLE with ANSWER
/// When a Guardian cycle runs
/// Then every such answer is rejected, nothing is typed into the session,
/// and the cycle falls through to trajectory analysis
#[tokio::test]
async fn test_unrecoverable_answer_is_rejected() {
    let h = Harness::new(first_pass_config());
    let id = h.add_agent("agent-1", &["$ claude", "Which delimiter? (comma/tab)"]).await;
    for _ in 0..3 {
        h.oracle.push_state(Script::Reply(state_analysis(
            AgentState::Unrecoverable,
            DecisionKind::Answer,
            "comma",
        )));
    }

    let sweep = h.monitor.run_guardian_sweep().await;
    let report = sweep.report_for(&id).unwrap();
    assert_eq!(h.oracle.state_calls(), 3);
    assert_eq!(h.oracle.trajectory_calls(), 1);
    assert_eq!(h.sessions.sends_to(&id), 0);
    assert!(report.judgment.is_some());
    assert_ne!(report.intervention, Intervention::Delivered { attempts: 1 });
}

// ========== Task Timeout Scenarios ==========

/// Test: A task past its time budget gets a fresh agent
/// Given a one minute base timeout and an agent working for two hours
/// When a Guardian cycle runs
/// Then the agent is recreated with the generated brief,
/// without a trajectory call
#[tokio::test]
async fn test_timed_out_task_is_recreated_with_generated_prompt() {
    let mut config = test_config();
    config.monitor.agent_timeout_mins = 1;
    let h = Harness::new(config);
    let id = h
        .add_agent_created("agent-1", &["$ claude", "still refactoring"], Utc::now() - ChronoDuration::hours(2))
        .await;
    h.oracle
        .set_agent_prompt("You own the CSV export. Start from src/report.rs.");

    let sweep = h.monitor.run_guardian_sweep().await;
    let report = sweep.report_for(&id).unwrap();
    assert_eq!(report.state, AgentState::Unrecoverable);
    assert_eq!(report.decision, MonitoringDecision::Recreate);
    assert!(matches!(report.intervention, Intervention::Recreated { .. }));
    assert_eq!(h.oracle.trajectory_calls(), 0);
    assert_eq!(
        *h.sessions.recreate_prompts.lock().unwrap(),
        vec![Some("You own the CSV export. Start from src/report.rs.".to_string())]
    );
    assert!(!h.monitor.registry().read().await.contains(&id));
}

/// Test: A task within its time budget is evaluated normally
/// Given a thirty minute base timeout and an agent working for ten minutes
/// When a Guardian cycle runs
/// Then no recreation happens
#[tokio::test]
async fn test_task_within_budget_is_not_recreated() {
    let mut config = test_config();
    config.monitor.agent_timeout_mins = 30;
    let h = Harness::new(config);
    let id = h
        .add_agent_created("agent-1", &["$ claude", "editing"], Utc::now() - ChronoDuration::minutes(10))
        .await;

    let sweep = h.monitor.run_guardian_sweep().await;
    assert_eq!(sweep.report_for(&id).unwrap().state, AgentState::Healthy);
    assert_eq!(h.sessions.lifecycle_calls(), 0);
}

// ========== Orphan Session Scenarios ==========

/// Test: Unowned agent sessions are killed
/// Given a registered agent, a stray agent session and an unrelated session
/// When orphan sessions are reaped with no grace period
/// Then only the stray agent session is killed
#[tokio::test]
async fn test_orphaned_agent_session_is_killed() {
    let mut config = test_config();
    config.monitor.orphan_grace_secs = 0;
    let mut h = Harness::new(config);
    h.add_agent("agent-1", &["$ claude"]).await;
    h.sessions.open("overseer_stray", &["$ claude"]);
    h.sessions.open("editor", &["vim"]);

    let reaped = h.monitor.reap_orphan_sessions().await;
    assert_eq!(reaped, vec![SessionHandle::new("overseer_stray")]);
    assert!(!h.sessions.is_open("overseer_stray"));
    assert!(h.sessions.is_open(&session_of("agent-1")));
    assert!(h.sessions.is_open("editor"));
    assert!(h.drain_events().iter().any(|e| matches!(
        e,
        MonitorEvent::SessionReaped { session } if session.name() == "overseer_stray"
    )));
}

/// Test: A fresh unowned session gets a grace period
/// Given a stray agent session first seen just now and a two minute grace
/// When orphan sessions are reaped
/// Then nothing is killed
#[tokio::test]
async fn test_new_orphan_survives_grace_period() {
    let h = Harness::new(test_config());
    h.sessions.open("overseer_stray", &["$ claude"]);

    assert!(h.monitor.reap_orphan_sessions().await.is_empty());
    assert!(h.monitor.reap_orphan_sessions().await.is_empty());
    assert!(h.sessions.is_open("overseer_stray"));
    assert!(h.sessions.killed.lock().unwrap().is_empty());
}

// ========== Conductor Scenarios ==========

/// Test: Duplicate work
/// Given agent-1 created before agent-2, both reported as duplicates
/// When the Conductor runs
/// Then agent-2 is terminated and agent-1 kept
#[tokio::test]
async fn test_duplicate_keeps_older_agent() {
    let mut h = Harness::new(test_config());
    let t0 = Utc::now() - ChronoDuration::seconds(60);
    let first = h.add_agent_created("agent-1", &["$ claude"], t0).await;
    let second = h
        .add_agent_created("agent-2", &["$ claude"], t0 + ChronoDuration::seconds(10))
        .await;

    let mut judgment = coherent(0.8);
    judgment.duplicates = vec![DuplicateGroup {
        agents: vec!["agent-1".to_string(), "agent-2".to_string()],
        work: "CSV export".to_string(),
    }];
    h.oracle.push_coherence(Script::Reply(judgment));

    let report = h.monitor.run_conductor_cycle().await;
    assert_eq!(
        report.decision,
        SystemDecision::TerminateDuplicate {
            targets: vec![second.clone()],
            kept: vec![first.clone()],
        }
    );
    assert_eq!(*h.sessions.terminated.lock().unwrap(), vec![second.clone()]);

    let registry = h.monitor.registry();
    assert!(registry.read().await.contains(&first));
    assert!(!registry.read().await.contains(&second));
    assert!(h.drain_events().iter().any(|e| matches!(
        e,
        MonitorEvent::AgentRemoved { agent_id, reason } if agent_id == &second && reason == "duplicate"
    )));
}

/// Test: Oracle timeouts
/// Given a coherence call that never answers
/// When the Conductor runs
/// Then three attempts time out and the cycle continues without acting
#[tokio::test(start_paused = true)]
async fn test_coherence_timeouts_fall_back_to_continue() {
    let mut h = Harness::new(test_config());
    h.add_agent("agent-1", &["$ claude"]).await;
    h.add_agent("agent-2", &["$ claude"]).await;
    for _ in 0..3 {
        h.oracle.push_coherence(Script::Hang);
    }

    let report = h.monitor.run_conductor_cycle().await;
    assert!(report.fell_back);
    assert_eq!(report.decision, SystemDecision::Continue);
    assert_eq!(h.oracle.coherence_calls(), 3);
    assert_eq!(h.sessions.lifecycle_calls(), 0);
    assert!(h.drain_escalations().is_empty());
}

/// Test: Single agent
/// Given only one registered agent
/// When the Conductor runs
/// Then the oracle is not consulted
#[tokio::test]
async fn test_single_agent_skips_coherence() {
    let h = Harness::new(test_config());
    h.add_agent("agent-1", &["$ claude"]).await;

    let report = h.monitor.run_conductor_cycle().await;
    assert_eq!(report.decision, SystemDecision::Continue);
    assert_eq!(h.oracle.coherence_calls(), 0);
}

/// Test: Resource contention
/// Given two agents contending for the migrations directory
/// When the Conductor runs
/// Then both receive a coordination message
#[tokio::test]
async fn test_coordination_messages_reach_both_agents() {
    let h = Harness::new(test_config());
    let first = h.add_agent("agent-1", &["$ claude"]).await;
    let second = h.add_agent("agent-2", &["$ claude"]).await;
    let mut judgment = coherent(0.7);
    judgment.coordination_needs = vec![CoordinationNeed {
        resource: "db/migrations".to_string(),
        agents: vec!["agent-1".to_string(), "agent-2".to_string()],
        action: "serialize schema changes".to_string(),
    }];
    h.oracle.push_coherence(Script::Reply(judgment));

    let report = h.monitor.run_conductor_cycle().await;
    assert!(matches!(report.decision, SystemDecision::CoordinateResources { .. }));

    let sent = h.sessions.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().any(|(a, m)| a == &first && m.contains("priority access")));
    assert!(sent.iter().any(|(a, m)| a == &second && m.contains("wait for agent agent-1")));
}

/// Test: Missing work
/// Given a coherence judgment reporting unassigned work
/// When the Conductor runs
/// Then a task request is forwarded with the hint
#[tokio::test]
async fn test_missing_task_is_requested() {
    let mut h = Harness::new(test_config());
    h.add_agent("agent-1", &["$ claude"]).await;
    h.add_agent("agent-2", &["$ claude"]).await;
    let mut judgment = coherent(0.6);
    judgment.alignment_issues = vec!["Nobody is updating the user documentation".to_string()];
    h.oracle.push_coherence(Script::Reply(judgment));

    let report = h.monitor.run_conductor_cycle().await;
    assert!(matches!(report.decision, SystemDecision::CreateMissingTask { .. }));
    let hints = h.tasks.try_recv().expect("task requested");
    assert_eq!(hints, vec!["Nobody is updating the user documentation".to_string()]);
}

/// Test: Low coherence
/// Given a coherence score under the escalation threshold
/// When the Conductor runs
/// Then the system is escalated and the summary reflects the analysis
#[tokio::test]
async fn test_low_coherence_escalates() {
    let mut h = Harness::new(test_config());
    h.add_agent("agent-1", &["$ claude"]).await;
    h.add_agent("agent-2", &["$ claude"]).await;
    h.oracle.push_coherence(Script::Reply(coherent(0.1)));

    let report = h.monitor.run_conductor_cycle().await;
    assert!(matches!(report.decision, SystemDecision::Escalate { .. }));
    let escalations = h.drain_escalations();
    assert_eq!(escalations.len(), 1);
    assert_eq!(escalations[0].source, EscalationSource::Conductor);
    assert!(h.monitor.system_summary().await.contains("Coherence: 0.10"));
}
