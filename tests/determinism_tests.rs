use std::time::Duration;

use dtf_core::{Event, FailureDetails, OrchestrationContext, OrchestrationError, ReplayOutcome, run_turn};

mod common;
use common::*;

fn violation_message(out: &ReplayOutcome) -> String {
    assert!(out.commands.is_empty(), "a violation must not emit commands");
    assert!(out.tasks.is_empty());
    match &out.terminal {
        Some(Err(OrchestrationError::DeterminismViolation(msg))) => {
            assert_eq!(
                out.new_events,
                vec![Event::OrchestratorCompleted {
                    result: Err(OrchestrationError::DeterminismViolation(msg.clone()))
                }]
            );
            msg.clone()
        }
        other => panic!("expected determinism violation, got {other:?}"),
    }
}

fn recorded_hello() -> Vec<Event> {
    vec![
        started("Greet", "World"),
        turn(0),
        activity(1, "Hello", "World"),
        turn(1),
        completed(1, "Hello World!"),
    ]
}

#[test]
fn same_code_replays_cleanly() {
    let out = run_turn(&recorded_hello(), |ctx| async move {
        let greeting = ctx.schedule_activity("Hello", "World").await?;
        Ok(greeting)
    });
    assert_eq!(out.terminal, Some(Ok("Hello World!".to_string())));
}

#[test]
fn renamed_activity_is_detected() {
    let out = run_turn(&recorded_hello(), |ctx| async move {
        let greeting = ctx.schedule_activity("Goodbye", "World").await?;
        Ok(greeting)
    });
    let msg = violation_message(&out);
    assert!(msg.contains("task 1"), "{msg}");
    assert!(msg.contains("Goodbye"), "{msg}");
}

#[test]
fn changed_kind_is_detected() {
    let out = run_turn(&recorded_hello(), |ctx| async move {
        ctx.schedule_timer(Duration::from_secs(1)).await?;
        Ok(String::new())
    });
    let msg = violation_message(&out);
    assert!(msg.contains("timer"), "{msg}");
}

#[test]
fn changed_input_is_detected() {
    let out = run_turn(&recorded_hello(), |ctx| async move {
        let greeting = ctx.schedule_activity("Hello", "Moon").await?;
        Ok(greeting)
    });
    let msg = violation_message(&out);
    assert!(msg.contains("input changed"), "{msg}");
}

#[test]
fn timer_delay_changes_are_tolerated() {
    let history = vec![started("Sleep", ""), turn(0), timer(1, 5_000), turn(5_000), fired(1, 5_000)];
    let out = run_turn(&history, |ctx| async move {
        ctx.schedule_timer(Duration::from_secs(30)).await?;
        Ok("awake".into())
    });
    assert_eq!(out.terminal, Some(Ok("awake".to_string())));
}

#[test]
fn recorded_task_the_code_skips_is_detected() {
    let history = vec![
        started("Pair", ""),
        turn(0),
        activity(1, "A", ""),
        activity(2, "B", ""),
    ];
    let out = run_turn(&history, |ctx| async move {
        let a = ctx.schedule_activity("A", "").await?;
        Ok(a)
    });
    let msg = violation_message(&out);
    assert!(msg.contains("task 2"), "{msg}");
}

#[test]
fn completion_for_unscheduled_task_is_rejected() {
    let history = vec![started("Greet", ""), turn(0), completed(7, "stray")];
    let out = run_turn(&history, |_ctx| async move { Ok("never".to_string()) });
    let msg = violation_message(&out);
    assert!(msg.contains("never scheduled"), "{msg}");
}

#[test]
fn completion_of_wrong_kind_in_history_is_rejected() {
    let history = vec![
        started("Greet", ""),
        turn(0),
        activity(1, "Hello", ""),
        turn(1),
        fired(1, 10),
    ];
    let out = run_turn(&history, |ctx| async move {
        let greeting = ctx.schedule_activity("Hello", "").await?;
        Ok(greeting)
    });
    violation_message(&out);
}

#[test]
fn second_completion_for_one_task_is_rejected() {
    let history = vec![
        started("Sleep", ""),
        turn(0),
        timer(1, 5_000),
        turn(5_000),
        fired(1, 5_000),
        turn(5_001),
        fired(1, 5_000),
    ];
    let out = run_turn(&history, |ctx| async move {
        ctx.schedule_timer(Duration::from_secs(5)).await?;
        Ok("awake".into())
    });
    let msg = violation_message(&out);
    assert!(msg.contains("second time"), "{msg}");
}

#[test]
fn duplicate_schedule_in_history_is_rejected() {
    let history = vec![
        started("Greet", ""),
        turn(0),
        activity(1, "Hello", ""),
        activity(1, "Hello", ""),
    ];
    let out = run_turn(&history, |ctx| async move {
        let greeting = ctx.schedule_activity("Hello", "").await?;
        Ok(greeting)
    });
    let msg = violation_message(&out);
    assert!(msg.contains("scheduled twice"), "{msg}");
}

#[test]
fn branching_on_recorded_results_stays_deterministic() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        match ctx.schedule_activity("Check", "").await {
            Ok(v) if v == "fast" => Ok("fast path".to_string()),
            Ok(_) => {
                let slow = ctx.schedule_activity("Slow", "").await?;
                Ok(format!("slow path: {slow}"))
            }
            Err(e) => Err(e),
        }
    };
    let history = vec![
        started("Branch", ""),
        turn(0),
        activity(1, "Check", ""),
        turn(1),
        completed(1, "slow"),
        activity(2, "Slow", ""),
        turn(2),
        completed(2, "ok"),
    ];
    let out = run_turn(&history, orchestrator);
    assert_eq!(out.terminal, Some(Ok("slow path: ok".to_string())));
}

#[test]
fn failed_task_surfaces_as_permanent_failure() {
    let history = vec![
        started("Greet", ""),
        turn(0),
        activity(1, "Hello", ""),
        turn(1),
        failed(1, FailureDetails::permanent("Invalid", "bad name")),
    ];
    let out = run_turn(&history, |ctx| async move {
        let greeting = ctx.schedule_activity("Hello", "").await?;
        Ok(greeting)
    });
    assert_eq!(
        out.terminal,
        Some(Err(OrchestrationError::PermanentTaskFailure {
            task_id: 1,
            name: "Hello".into(),
            attempts: 1,
            failure: FailureDetails::permanent("Invalid", "bad name"),
        }))
    );
}
