//! One replay pass: re-run orchestrator code against a history and collect
//! the decisions it makes beyond what is already recorded.
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use tracing::{debug, error};

use crate::runtime::OrchestrationHandler;
use crate::{Command, Event, LogLevel, OrchestrationContext, OrchestrationError, TaskSet};

/// Everything a pass produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayOutcome {
    pub commands: Vec<Command>,
    /// Events to append after the input history: new `TaskScheduled`
    /// records and, when terminal, the `OrchestratorCompleted` event.
    pub new_events: Vec<Event>,
    pub terminal: Option<Result<String, OrchestrationError>>,
    /// Task bookkeeping as of the end of the pass.
    pub tasks: TaskSet,
    /// Replay-safe log lines buffered by orchestrator code.
    pub logs: Vec<(LogLevel, String)>,
}

impl ReplayOutcome {
    fn violation(message: String, logs: Vec<(LogLevel, String)>) -> Self {
        let result = Err(OrchestrationError::DeterminismViolation(message));
        Self {
            commands: Vec::new(),
            new_events: vec![Event::OrchestratorCompleted { result: result.clone() }],
            terminal: Some(result),
            tasks: TaskSet::new(),
            logs,
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

type Output = Result<String, OrchestrationError>;

fn poll_guarded(fut: &mut Pin<Box<dyn Future<Output = Output> + '_>>) -> Option<Output> {
    let mut cx = Context::from_waker(Waker::noop());
    match catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx))) {
        Ok(Poll::Ready(out)) => Some(out),
        Ok(Poll::Pending) => None,
        Err(payload) => Some(Err(OrchestrationError::Panicked(panic_message(payload)))),
    }
}

/// Replay `orchestrator` over `history` for one pass.
///
/// The code is first polled with no completion visible, then completions are
/// revealed one at a time in history order with a poll after each. The pass
/// ends when the code returns, or when every completion has been revealed
/// and the code is still waiting.
pub fn execute<F, Fut>(instance_id: &str, history: &[Event], input: &str, orchestrator: F) -> ReplayOutcome
where
    F: FnOnce(OrchestrationContext, String) -> Fut,
    Fut: Future<Output = Output>,
{
    let ctx = OrchestrationContext::new(instance_id, history.to_vec());
    if let Err(message) = ctx.validate_history() {
        error!(instance = %instance_id, %message, "history is inconsistent with itself");
        return ReplayOutcome::violation(message, Vec::new());
    }

    let created = catch_unwind(AssertUnwindSafe(|| orchestrator(ctx.clone(), input.to_string())));
    let mut fut: Pin<Box<dyn Future<Output = Output> + '_>> = match created {
        Ok(fut) => Box::pin(fut),
        Err(payload) => {
            let message = panic_message(payload);
            Box::pin(async move { Err(OrchestrationError::Panicked(message)) })
        }
    };

    let stages = ctx.stage_count();
    let mut terminal = None;
    for stage in 0..=stages {
        ctx.enter_stage(stage);
        terminal = poll_guarded(&mut fut);
        if terminal.is_some() || ctx.nondeterminism().is_some() {
            break;
        }
    }
    drop(fut);

    let products = ctx.finish();
    if let Some(message) = products.violation {
        error!(instance = %instance_id, %message, "nondeterministic orchestration");
        return ReplayOutcome::violation(message, products.logs);
    }

    let mut new_events = products.new_events;
    if let Some(result) = &terminal {
        new_events.push(Event::OrchestratorCompleted { result: result.clone() });
    }
    debug!(
        instance = %instance_id,
        commands = products.commands.len(),
        terminal = terminal.is_some(),
        "replay pass finished"
    );
    ReplayOutcome {
        commands: products.commands,
        new_events,
        terminal,
        tasks: products.tasks,
        logs: products.logs,
    }
}

/// Seam between the engine and the replay algorithm.
pub trait ReplayEngine: Send + Sync {
    fn replay(
        &self,
        instance_id: &str,
        history: &[Event],
        input: &str,
        handler: Arc<dyn OrchestrationHandler>,
    ) -> ReplayOutcome;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultReplayEngine;

impl DefaultReplayEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ReplayEngine for DefaultReplayEngine {
    fn replay(
        &self,
        instance_id: &str,
        history: &[Event],
        input: &str,
        handler: Arc<dyn OrchestrationHandler>,
    ) -> ReplayOutcome {
        execute(instance_id, history, input, |ctx, input| async move {
            handler.invoke(ctx, input).await
        })
    }
}
