//! Loop-level tests driving `run_loop` with scripted agents and validators.
//!
//! Each test sets up a scratch workspace, scripts the agent's transcripts and
//! backlog edits, and checks the stop reason plus the files the loop leaves behind.

use std::fs;
use std::path::{Path, PathBuf};

use ralph::core::decision::CycleDecision;
use ralph::core::memory::MemoryTier;
use ralph::core::types::{ReasonCode, WorkMode};
use ralph::cycle::LoopEvent;
use ralph::io::config::{ConfigError, LoopConfig};
use ralph::io::lock::{LockHeldError, LockMetadata};
use ralph::looping::{LoopOutcome, LoopStop, run_loop};
use ralph::test_support::{AgentTurn, ScriptedAgent, ScriptedValidator, TestWorkspace};

/// Owned copy of the interesting events.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Seen {
    Started(u32, String, WorkMode),
    Fallback(u32, MemoryTier, ReasonCode),
    Finished(u32, CycleDecision),
    Preflight(i32),
}

fn run(
    ws: &TestWorkspace,
    config: &LoopConfig,
    agent: &ScriptedAgent,
    validator: &ScriptedValidator,
) -> (LoopOutcome, Vec<Seen>) {
    let mut seen = Vec::new();
    let outcome = run_loop(ws.root(), config, agent, validator, |event| match event {
        LoopEvent::CycleStarted {
            iteration,
            item_id,
            work_mode,
            ..
        } => seen.push(Seen::Started(*iteration, item_id.to_string(), *work_mode)),
        LoopEvent::FallbackAppended {
            iteration,
            tier,
            reason,
        } => seen.push(Seen::Fallback(*iteration, *tier, *reason)),
        LoopEvent::CycleFinished {
            iteration,
            decision,
        } => seen.push(Seen::Finished(*iteration, *decision)),
        LoopEvent::PreflightValidation { exit_code } => seen.push(Seen::Preflight(*exit_code)),
        _ => {}
    })
    .expect("loop");
    (outcome, seen)
}

fn fallbacks(seen: &[Seen], iteration: u32) -> Vec<MemoryTier> {
    seen.iter()
        .filter_map(|event| match event {
            Seen::Fallback(i, tier, _) if *i == iteration => Some(*tier),
            _ => None,
        })
        .collect()
}

fn iteration_dir(root: &Path, outcome: &LoopOutcome, iteration: u32) -> PathBuf {
    root.join(".ralph/runtime/iterations")
        .join(&outcome.run_id)
        .join(iteration.to_string())
}

/// Items `[A:5, B:null, C:1]` are worked C, A, B; the loop stops once all pass.
#[test]
fn backlog_is_worked_in_priority_order_until_done() {
    let ws = TestWorkspace::new(
        r#"{"items":[
            {"id":"A","priority":5,"passes":false},
            {"id":"B","priority":null,"passes":false},
            {"id":"C","priority":1,"passes":false}
        ]}"#,
    );
    let agent = ScriptedAgent::new(vec![
        AgentTurn::output("did C\n").mark_passed("C"),
        AgentTurn::output("did A\n").mark_passed("A"),
        AgentTurn::output("did B\n").mark_passed("B"),
    ]);
    let validator = ScriptedValidator::always(0);

    let (outcome, seen) = run(&ws, &ws.config(), &agent, &validator);

    assert_eq!(outcome.stop, LoopStop::Complete);
    assert_eq!(outcome.iterations, 3);
    let started: Vec<&Seen> = seen
        .iter()
        .filter(|event| matches!(event, Seen::Started(..)))
        .collect();
    assert_eq!(
        started,
        vec![
            &Seen::Started(1, "C".to_string(), WorkMode::Feature),
            &Seen::Started(2, "A".to_string(), WorkMode::Feature),
            &Seen::Started(3, "B".to_string(), WorkMode::Feature),
        ]
    );
    assert_eq!(
        seen.last(),
        Some(&Seen::Finished(3, CycleDecision::BacklogComplete))
    );
    agent.assert_drained();
}

/// Every memory file changes every iteration, whatever the agent touched.
#[test]
fn memory_files_change_every_iteration() {
    let ws = TestWorkspace::new(r#"{"items":[{"id":"A","passes":false}]}"#);
    let config = LoopConfig {
        max_iterations: 2,
        ..ws.config()
    };
    let agent = ScriptedAgent::new(vec![
        AgentTurn::output("no notes\n"),
        AgentTurn::output("notes\n")
            .append(".agent/GUARDRAILS.md", "\n- agent rule\n")
            .append(".agent/RECENT.md", "\n- agent summary\n"),
    ]);
    let validator = ScriptedValidator::always(0);

    let (outcome, seen) = run(&ws, &config, &agent, &validator);

    assert_eq!(outcome.stop, LoopStop::MaxIterationsReached);
    assert_eq!(fallbacks(&seen, 1), MemoryTier::ALL.to_vec());
    assert_eq!(fallbacks(&seen, 2), vec![MemoryTier::Style]);
    let style = ws.read(".agent/STYLE.md");
    assert!(style.starts_with("# Style"));
    assert_eq!(style.matches("Iteration ").count(), 2);
    assert!(ws.read(".agent/RECENT.md").contains("- Outcome: progressed"));
}

#[test]
fn abort_wins_over_completion_and_green_validation() {
    let ws = TestWorkspace::new(r#"{"items":[{"id":"A","passes":false}]}"#);
    let agent = ScriptedAgent::new(vec![
        AgentTurn::output("<promise>COMPLETE</promise>\n<promise>ABORT</promise>\n")
            .mark_passed("A"),
    ]);
    let validator = ScriptedValidator::always(0);

    let (outcome, seen) = run(&ws, &ws.config(), &agent, &validator);

    assert_eq!(outcome.stop, LoopStop::Aborted);
    assert_eq!(outcome.stop.exit_code(), 1);
    assert_eq!(validator.calls(), 0);
    assert_eq!(fallbacks(&seen, 1).len(), 3);
    assert!(ws.read(".agent/GUARDRAILS.md").contains("- Reason: abort"));
    assert!(ws.read(".agent/RECENT.md").contains("- Validation: skipped"));
}

/// A marker mentioned inside a sentence is not a marker in plain mode.
#[test]
fn marker_inside_a_line_does_not_complete() {
    let ws = TestWorkspace::new(r#"{"items":[{"id":"A","passes":false}]}"#);
    let config = LoopConfig {
        max_iterations: 1,
        ..ws.config()
    };
    let agent = ScriptedAgent::new(vec![AgentTurn::output(
        "I considered printing <promise>COMPLETE</promise> but didn't\n",
    )]);
    let validator = ScriptedValidator::always(0);

    let (outcome, _) = run(&ws, &config, &agent, &validator);

    assert_eq!(outcome.stop, LoopStop::MaxIterationsReached);
    assert_eq!(outcome.last_decision, Some(CycleDecision::Continue));
}

#[test]
fn completion_marker_needs_green_validation() {
    let ws =
        TestWorkspace::new(r#"{"items":[{"id":"A","passes":false},{"id":"B","passes":false}]}"#);
    let agent = ScriptedAgent::new(vec![
        AgentTurn::output("<promise>COMPLETE</promise>\n"),
        AgentTurn::output("<promise>NO MORE TASKS</promise>\n"),
    ]);
    let validator = ScriptedValidator::sequence(vec![
        (1, "FAILED test_a - assert 1 == 2\n".to_string()),
        (0, "ok\n".to_string()),
    ]);

    let (outcome, seen) = run(&ws, &ws.config(), &agent, &validator);

    assert_eq!(outcome.stop, LoopStop::Complete);
    assert!(seen.contains(&Seen::Finished(1, CycleDecision::MarkerRejected)));
    assert!(seen.contains(&Seen::Finished(2, CycleDecision::MarkerComplete)));
    assert!(agent.prompts()[1].contains("FAILED test_a - assert 1 == 2"));
    let guardrails = ws.read(".agent/GUARDRAILS.md");
    assert!(guardrails.contains("- Reason: validation_failed"));
    assert!(guardrails.contains("  - FAILED test_a - assert 1 == 2"));
}

/// Done backlog with green validation: one validation run, zero agent runs.
#[test]
fn finished_backlog_with_green_validation_exits_before_the_loop() {
    let ws = TestWorkspace::new(r#"{"items":[{"id":"A","passes":true}]}"#);
    let agent = ScriptedAgent::new(Vec::new());
    let validator = ScriptedValidator::always(0);

    let (outcome, seen) = run(&ws, &ws.config(), &agent, &validator);

    assert_eq!(outcome.stop, LoopStop::Complete);
    assert_eq!(outcome.iterations, 0);
    assert_eq!(seen, vec![Seen::Preflight(0)]);
    assert_eq!(agent.calls(), 0);
    assert_eq!(validator.calls(), 1);
    assert!(iteration_dir(ws.root(), &outcome, 0).join("meta.json").is_file());
}

/// Scope `[X]` with X passing is done even though Y is not.
#[test]
fn scoped_backlog_counts_only_scoped_items() {
    let ws =
        TestWorkspace::new(r#"{"items":[{"id":"X","passes":true},{"id":"Y","passes":false}]}"#);
    let config = LoopConfig {
        prd_ids: vec!["X".to_string()],
        ..ws.config()
    };
    let agent = ScriptedAgent::new(Vec::new());
    let validator = ScriptedValidator::always(0);

    let (outcome, _) = run(&ws, &config, &agent, &validator);

    assert_eq!(outcome.stop, LoopStop::Complete);
    assert_eq!(agent.calls(), 0);
}

/// Done backlog with red validation switches to the stabilization item.
#[test]
fn red_validation_on_done_backlog_enters_stabilize_mode() {
    let ws = TestWorkspace::new(r#"{"items":[{"id":"A","passes":true}]}"#);
    let agent = ScriptedAgent::new(vec![AgentTurn::output("fixed the build\n")]);
    let validator = ScriptedValidator::sequence(vec![
        (1, "error: build failed\n".to_string()),
        (0, "ok\n".to_string()),
    ]);

    let (outcome, seen) = run(&ws, &ws.config(), &agent, &validator);

    assert_eq!(outcome.stop, LoopStop::Complete);
    assert_eq!(outcome.iterations, 1);
    assert_eq!(seen[0], Seen::Preflight(1));
    assert_eq!(
        seen[1],
        Seen::Started(1, "STABILIZE".to_string(), WorkMode::Stabilize)
    );
    assert_eq!(fallbacks(&seen, 1).len(), 3);
    assert!(seen.contains(&Seen::Fallback(
        1,
        MemoryTier::Guardrails,
        ReasonCode::StabilizedValidation
    )));
    let prompt = &agent.prompts()[0];
    assert!(prompt.contains("- Work mode: stabilize"));
    assert!(prompt.contains("error: build failed"));
}

#[test]
fn timed_out_agent_is_recorded_as_timeout() {
    let ws = TestWorkspace::new(r#"{"items":[{"id":"A","passes":false}]}"#);
    let config = LoopConfig {
        max_iterations: 1,
        ..ws.config()
    };
    let agent = ScriptedAgent::new(vec![AgentTurn::timed_out("partial output\n")]);
    let validator = ScriptedValidator::always(1);

    let (outcome, seen) = run(&ws, &config, &agent, &validator);

    assert_eq!(outcome.stop, LoopStop::MaxIterationsReached);
    assert!(seen.contains(&Seen::Fallback(
        1,
        MemoryTier::Guardrails,
        ReasonCode::AgentTimeout
    )));
    let meta: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(iteration_dir(ws.root(), &outcome, 1).join("meta.json"))
            .expect("meta"),
    )
    .expect("meta json");
    assert_eq!(meta["timed_out"], true);
    assert_eq!(meta["agent_exit_code"], 124);
    assert_eq!(meta["fallback"]["guardrails"], "agent_timeout");
}

#[test]
fn iteration_artifacts_are_kept() {
    let ws = TestWorkspace::new(r#"{"items":[{"id":"A","passes":false}]}"#);
    let agent = ScriptedAgent::new(vec![AgentTurn::output("done\n").mark_passed("A")]);
    let validator = ScriptedValidator::always(0);

    let (outcome, _) = run(&ws, &ws.config(), &agent, &validator);

    let dir = iteration_dir(ws.root(), &outcome, 1);
    for name in ["prompt.md", "agent.log", "validate.log", "meta.json"] {
        assert!(dir.join(name).is_file(), "missing {name}");
    }
    let prompt = fs::read_to_string(dir.join("prompt.md")).expect("prompt");
    assert!(prompt.starts_with("# Test prompt"));
    assert!(prompt.contains("- Id: A"));
}

#[test]
fn missing_template_is_a_config_error() {
    let ws = TestWorkspace::new(r#"{"items":[{"id":"A","passes":false}]}"#);
    fs::remove_file(ws.root().join(".ralph/agent-prompt.md")).expect("remove template");
    let agent = ScriptedAgent::new(Vec::new());
    let validator = ScriptedValidator::always(0);

    let err = run_loop(ws.root(), &ws.config(), &agent, &validator, |_| {}).unwrap_err();

    assert!(err.downcast_ref::<ConfigError>().is_some());
    assert!(!ws.root().join(".ralph/ralph.lock").exists());
}

#[test]
fn live_lock_holder_blocks_the_loop() {
    let ws = TestWorkspace::new(r#"{"items":[{"id":"A","passes":false}]}"#);
    ws.write(
        ".ralph/ralph.lock",
        &serde_json::to_string(&LockMetadata::current("run-other")).expect("lock json"),
    );
    let agent = ScriptedAgent::new(Vec::new());
    let validator = ScriptedValidator::always(0);

    let err = run_loop(ws.root(), &ws.config(), &agent, &validator, |_| {}).unwrap_err();

    let held = err.downcast_ref::<LockHeldError>().expect("lock held");
    assert_eq!(
        held.holder.as_ref().map(|holder| holder.run_id.as_str()),
        Some("run-other")
    );
    assert_eq!(agent.calls(), 0);
}

/// A dead owner's lock is reclaimed and removed when the loop ends.
#[test]
fn stale_lock_is_reclaimed() {
    let ws = TestWorkspace::new(r#"{"items":[{"id":"A","passes":false}]}"#);
    let mut stale = LockMetadata::current("run-dead");
    stale.pid = u32::MAX - 1;
    ws.write(
        ".ralph/ralph.lock",
        &serde_json::to_string(&stale).expect("lock json"),
    );
    let agent = ScriptedAgent::new(vec![AgentTurn::output("done\n").mark_passed("A")]);
    let validator = ScriptedValidator::always(0);

    let (outcome, _) = run(&ws, &ws.config(), &agent, &validator);

    assert_eq!(outcome.stop, LoopStop::Complete);
    assert!(!ws.root().join(".ralph/ralph.lock").exists());
}
