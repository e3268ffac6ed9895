#![allow(dead_code)]

use std::sync::Arc;

use dtf_core::providers::HistoryStore;
use dtf_core::providers::in_memory::InMemoryHistoryStore;
use dtf_core::runtime::dispatch::LocalDispatcher;
use dtf_core::runtime::registry::ActivityRegistry;
use dtf_core::runtime::{ManualClock, OrchestrationEngine};
use dtf_core::{DispatchItem, EngineOptions, Event, FailureDetails, OrchestrationRegistry, TaskKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ---- history builders ----

pub fn started(name: &str, input: &str) -> Event {
    Event::ExecutionStarted {
        name: name.into(),
        input: input.into(),
    }
}

pub fn turn(timestamp: u64) -> Event {
    Event::OrchestratorStarted { timestamp }
}

pub fn activity(task_id: u64, name: &str, input: &str) -> Event {
    Event::TaskScheduled {
        task_id,
        kind: TaskKind::Activity,
        name: name.into(),
        input: input.into(),
        fire_at_ms: None,
    }
}

pub fn sub_orchestration(task_id: u64, name: &str, input: &str) -> Event {
    Event::TaskScheduled {
        task_id,
        kind: TaskKind::SubOrchestration,
        name: name.into(),
        input: input.into(),
        fire_at_ms: None,
    }
}

pub fn timer(task_id: u64, fire_at_ms: u64) -> Event {
    Event::TaskScheduled {
        task_id,
        kind: TaskKind::Timer,
        name: "timer".into(),
        input: String::new(),
        fire_at_ms: Some(fire_at_ms),
    }
}

pub fn completed(task_id: u64, result: &str) -> Event {
    Event::TaskCompleted {
        task_id,
        result: result.into(),
    }
}

pub fn failed(task_id: u64, failure: FailureDetails) -> Event {
    Event::TaskFailed { task_id, failure }
}

pub fn fired(task_id: u64, fired_at_ms: u64) -> Event {
    Event::TimerFired { task_id, fired_at_ms }
}

pub fn flaky() -> FailureDetails {
    FailureDetails::transient("Unavailable", "try again later")
}

// ---- engine harnesses ----

/// Engine over an in-memory store with a manual clock; the test plays the
/// dispatcher by reading commands off the returned channel.
pub fn manual_engine(
    registry: OrchestrationRegistry,
    clock: Arc<ManualClock>,
) -> (Arc<OrchestrationEngine>, mpsc::UnboundedReceiver<DispatchItem>) {
    let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::default());
    OrchestrationEngine::new(registry, store, EngineOptions::default().with_clock(clock))
}

/// Engine with a [`LocalDispatcher`] consuming its commands.
pub fn local_engine(
    registry: OrchestrationRegistry,
    activities: ActivityRegistry,
    store: Arc<dyn HistoryStore>,
) -> (Arc<OrchestrationEngine>, JoinHandle<()>) {
    let (engine, rx) = OrchestrationEngine::new(registry, store, EngineOptions::default());
    let dispatcher = LocalDispatcher::new(engine.clone(), activities);
    let join = dispatcher.spawn(rx);
    (engine, join)
}

/// Drain whatever commands are queued right now.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<DispatchItem>) -> Vec<DispatchItem> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}
