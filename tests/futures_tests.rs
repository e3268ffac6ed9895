use std::future::Future;
use std::time::Duration;

use dtf_core::{
    Command, Event, Executor, FailureDetails, OrchestrationContext, OrchestrationError, RetryPolicy, TaskState,
    run_turn,
};

mod common;
use common::*;

fn fetch_three(ctx: OrchestrationContext) -> impl Future<Output = Result<String, OrchestrationError>> {
    async move {
        let a = ctx.schedule_activity("Fetch", "A");
        let b = ctx.schedule_activity("Fetch", "B");
        let c = ctx.schedule_activity("Fetch", "C");
        let results = ctx.wait_all(vec![a, b, c]).await?;
        Ok(results.join(","))
    }
}

fn fan_out_history() -> Vec<Event> {
    vec![
        started("FanOut", ""),
        turn(0),
        activity(1, "Fetch", "A"),
        activity(2, "Fetch", "B"),
        activity(3, "Fetch", "C"),
    ]
}

#[test]
fn wait_all_keeps_submission_order() {
    let mut history = fan_out_history();
    history.extend([turn(10), completed(3, "c!")]);
    let partial = run_turn(&history, fetch_three);
    assert!(partial.terminal.is_none());
    assert!(partial.commands.is_empty());

    history.extend([turn(20), completed(1, "a!"), turn(30), completed(2, "b!")]);
    let out = run_turn(&history, fetch_three);
    assert_eq!(out.terminal, Some(Ok("a!,b!,c!".to_string())));
}

#[test]
fn wait_all_reports_every_failed_branch() {
    let mut history = fan_out_history();
    history.extend([
        turn(10),
        failed(1, FailureDetails::permanent("NotFound", "A")),
        completed(2, "b!"),
        failed(3, FailureDetails::permanent("NotFound", "C")),
    ]);
    let out = run_turn(&history, fetch_three);
    match out.terminal {
        Some(Err(OrchestrationError::FanIn { total, failures })) => {
            assert_eq!(total, 3);
            assert_eq!(failures.iter().map(|f| f.index).collect::<Vec<_>>(), vec![0, 2]);
            assert!(matches!(
                &failures[1].error,
                OrchestrationError::PermanentTaskFailure { task_id: 3, attempts: 1, .. }
            ));
        }
        other => panic!("expected fan-in failure, got {other:?}"),
    }
}

#[test]
fn caught_fan_in_error_exposes_partial_results() {
    let mut history = fan_out_history();
    history.extend([
        turn(10),
        completed(1, "a!"),
        failed(2, FailureDetails::permanent("NotFound", "B")),
        completed(3, "c!"),
    ]);
    let out = run_turn(&history, |ctx| async move {
        let futures = ["A", "B", "C"].map(|k| ctx.schedule_activity("Fetch", k));
        match ctx.wait_all(futures).await {
            Ok(all) => Ok(all.join(",")),
            Err(fan_in) => {
                let kept: Vec<String> = fan_in.successes().map(|(_, v)| v.clone()).collect();
                Ok(format!("partial {} ({} failed)", kept.join(","), fan_in.failure_count()))
            }
        }
    });
    assert_eq!(out.terminal, Some(Ok("partial a!,c! (1 failed)".to_string())));
}

fn race(ctx: OrchestrationContext) -> impl Future<Output = Result<String, OrchestrationError>> {
    async move {
        let work = ctx.schedule_activity("Slow", "");
        let deadline = ctx.schedule_timer(Duration::from_secs(30));
        match ctx.wait_any(vec![work, deadline]).await {
            (0, result) => Ok(format!("work:{}", result?)),
            _ => Ok("timeout".to_string()),
        }
    }
}

fn race_history() -> Vec<Event> {
    vec![
        started("Race", ""),
        turn(0),
        activity(1, "Slow", ""),
        timer(2, 30_000),
    ]
}

#[test]
fn wait_any_winner_is_the_first_recorded_completion() {
    let mut history = race_history();
    history.extend([turn(30_000), fired(2, 30_000)]);
    let out = run_turn(&history, race);
    assert_eq!(out.terminal, Some(Ok("timeout".to_string())));

    // The activity finishing later does not change the recorded outcome.
    history.extend(out.new_events);
    history.extend([turn(31_000), completed(1, "late")]);
    let again = run_turn(&history, race);
    assert!(again.commands.is_empty());
    assert_eq!(again.terminal, Some(Ok("timeout".to_string())));
}

#[test]
fn wait_any_takes_activity_when_it_lands_first() {
    let mut history = race_history();
    history.extend([turn(100), completed(1, "fast"), turn(30_000), fired(2, 30_000)]);
    let out = run_turn(&history, race);
    assert_eq!(out.terminal, Some(Ok("work:fast".to_string())));
}

#[test]
#[should_panic(expected = "at least one future")]
fn wait_any_rejects_empty_input() {
    let _ = dtf_core::futures::wait_any(Vec::<dtf_core::DurableFuture>::new());
}

#[test]
fn cancelled_timer_is_tracked_and_late_fire_is_ignored() {
    let orchestrator = |ctx: OrchestrationContext| async move {
        let mut deadline = ctx.schedule_timer(Duration::from_secs(60));
        let mut work = ctx.schedule_activity("Work", "");
        let (winner, result) = ctx.wait_any(vec![&mut work, &mut deadline]).await;
        if winner == 0 {
            assert!(ctx.cancel_timer(&deadline));
            assert!(!deadline.cancel(), "second cancel is a no-op");
        }
        let next = ctx.schedule_activity("Next", result?).await?;
        Ok(next)
    };
    let mut history = vec![
        started("Cancel", ""),
        turn(0),
        timer(1, 60_000),
        activity(2, "Work", ""),
        turn(10),
        completed(2, "done"),
    ];
    let out = run_turn(&history, orchestrator);
    assert_eq!(out.tasks.get(1).map(|t| t.state), Some(TaskState::Cancelled));
    assert_eq!(
        out.commands,
        vec![Command::ScheduleActivity {
            task_id: 3,
            name: "Next".into(),
            input: "done".into(),
        }]
    );

    history.extend(out.new_events);
    history.extend([turn(60_000), fired(1, 60_000)]);
    let late = run_turn(&history, orchestrator);
    assert!(late.commands.is_empty());
    assert!(late.terminal.is_none());
    assert_eq!(late.tasks.get(1).map(|t| t.state), Some(TaskState::Cancelled));
}

#[test]
fn fired_timer_cannot_be_cancelled() {
    let history = vec![started("Sleep", ""), turn(0), timer(1, 5_000), turn(5_000), fired(1, 5_000)];
    let out = run_turn(&history, |ctx| async move {
        let mut t = ctx.schedule_timer(Duration::from_secs(5));
        (&mut t).await?;
        Ok(t.cancel().to_string())
    });
    assert_eq!(out.terminal, Some(Ok("false".to_string())));
}

// ---- retries ----

fn call_flaky(ctx: OrchestrationContext, policy: RetryPolicy) -> impl Future<Output = Result<String, OrchestrationError>> {
    async move { ctx.schedule_activity_with_retry("Flaky", "x", policy).await }
}

#[derive(Default)]
struct Trace {
    attempts: Vec<u64>,
    timers: Vec<(u64, u64)>,
}

/// Fail the first `failures` attempts with `failure`, fire every timer on
/// time.
fn failing(failures: usize, failure: FailureDetails, trace: &mut Trace) -> impl FnMut(Vec<Command>, &mut Vec<Event>) + '_ {
    move |commands: Vec<Command>, out: &mut Vec<Event>| {
        for command in commands {
            match command {
                Command::ScheduleActivity { task_id, .. } => {
                    trace.attempts.push(task_id);
                    if trace.attempts.len() <= failures {
                        out.push(failed(task_id, failure.clone()));
                    } else {
                        out.push(completed(task_id, "ok"));
                    }
                }
                Command::StartTimer { task_id, fire_at_ms } => {
                    trace.timers.push((task_id, fire_at_ms));
                    out.push(fired(task_id, fire_at_ms));
                }
                _ => {}
            }
        }
    }
}

#[test]
fn retry_backs_off_five_then_fifteen_seconds_and_gives_up() {
    let policy = RetryPolicy::new(Duration::from_secs(5), 3).with_backoff_coefficient(3.0);
    let mut trace = Trace::default();
    let (history, result) = Executor::drive_to_completion(
        vec![started("Retry", "")],
        |ctx| call_flaky(ctx, policy.clone()),
        failing(usize::MAX, flaky(), &mut trace),
    );

    // Drive timestamps are pass numbers: attempt 1 fails in pass 1, attempt 2
    // in pass 3.
    assert_eq!(trace.timers, vec![(2, 1 + 5_000), (4, 3 + 15_000)]);
    assert_eq!(trace.attempts, vec![1, 3, 5]);
    assert_eq!(
        result,
        Err(OrchestrationError::PermanentTaskFailure {
            task_id: 5,
            name: "Flaky".into(),
            attempts: 3,
            failure: flaky(),
        })
    );
    let backoffs = history
        .iter()
        .filter(|e| matches!(e, Event::TaskScheduled { name, .. } if name == "backoff:Flaky"))
        .count();
    assert_eq!(backoffs, 2);
}

#[test]
fn retry_succeeds_after_transient_failure() {
    let policy = RetryPolicy::new(Duration::from_secs(5), 3);
    let mut trace = Trace::default();
    let (_, result) = Executor::drive_to_completion(
        vec![started("Retry", "")],
        |ctx| call_flaky(ctx, policy.clone()),
        failing(1, flaky(), &mut trace),
    );
    assert_eq!(result, Ok("ok".to_string()));
    assert_eq!(trace.attempts, vec![1, 3]);
    assert_eq!(trace.timers.len(), 1);
}

#[test]
fn permanent_failures_are_not_retried() {
    let policy = RetryPolicy::new(Duration::from_secs(5), 5);
    let mut trace = Trace::default();
    let (_, result) = Executor::drive_to_completion(
        vec![started("Retry", "")],
        |ctx| call_flaky(ctx, policy.clone()),
        failing(usize::MAX, FailureDetails::permanent("Invalid", "no"), &mut trace),
    );
    assert!(matches!(result, Err(OrchestrationError::PermanentTaskFailure { attempts: 1, .. })));
    assert_eq!(trace.attempts, vec![1]);
    assert!(trace.timers.is_empty());
}

#[test]
fn retry_predicate_can_reject_a_failure() {
    let policy = RetryPolicy::new(Duration::from_secs(5), 5).with_handle(|f| f.kind != "Unavailable");
    let mut trace = Trace::default();
    let (_, result) = Executor::drive_to_completion(
        vec![started("Retry", "")],
        |ctx| call_flaky(ctx, policy.clone()),
        failing(usize::MAX, flaky(), &mut trace),
    );
    assert!(matches!(result, Err(OrchestrationError::PermanentTaskFailure { attempts: 1, .. })));
    assert_eq!(trace.attempts, vec![1]);
}

#[test]
fn zero_interval_retries_immediately() {
    let policy = RetryPolicy::new(Duration::ZERO, 2);
    let mut trace = Trace::default();
    let (_, result) = Executor::drive_to_completion(
        vec![started("Retry", "")],
        |ctx| call_flaky(ctx, policy.clone()),
        failing(1, flaky(), &mut trace),
    );
    assert_eq!(result, Ok("ok".to_string()));
    assert_eq!(trace.attempts, vec![1, 2]);
    assert!(trace.timers.is_empty());
}

#[test]
fn hand_edited_policy_is_rejected_before_scheduling() {
    let mut policy = RetryPolicy::new(Duration::from_secs(1), 3);
    policy.backoff_coefficient = 0.5;
    let out = run_turn(&[started("Retry", ""), turn(0)], |ctx| call_flaky(ctx, policy.clone()));
    assert!(out.commands.is_empty());
    match out.terminal {
        Some(Err(OrchestrationError::Panicked(msg))) => {
            assert!(msg.contains("invalid retry policy for 'Flaky'"), "{msg}");
            assert!(msg.contains("backoff_coefficient"), "{msg}");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn pending_retry_records_next_attempt_time() {
    let policy = RetryPolicy::new(Duration::from_secs(5), 3);
    let history = vec![
        started("Retry", ""),
        turn(1_000),
        activity(1, "Flaky", "x"),
        turn(2_000),
        failed(1, flaky()),
    ];
    let out = run_turn(&history, |ctx| call_flaky(ctx, policy.clone()));
    assert!(out.terminal.is_none());
    assert_eq!(
        out.commands,
        vec![Command::StartTimer {
            task_id: 2,
            fire_at_ms: 7_000
        }]
    );
    let failed_task = out.tasks.get(1).cloned();
    assert_eq!(failed_task.as_ref().map(|t| t.state), Some(TaskState::Failed));
    assert_eq!(failed_task.and_then(|t| t.next_retry_at), Some(7_000));
}

#[test]
fn standard_combinators_compose_with_durable_futures() {
    let history = vec![
        started("Join", ""),
        turn(0),
        activity(1, "A", ""),
        activity(2, "B", ""),
        activity(3, "C", ""),
        turn(5),
        completed(3, "c"),
        completed(1, "a"),
        completed(2, "b"),
    ];
    let out = run_turn(&history, |ctx| async move {
        let (a, b, c) = futures::future::join3(
            ctx.schedule_activity("A", ""),
            ctx.schedule_activity("B", ""),
            ctx.schedule_activity("C", ""),
        )
        .await;
        Ok(format!("{}{}{}", a?, b?, c?))
    });
    assert_eq!(out.terminal, Some(Ok("abc".to_string())));
}
