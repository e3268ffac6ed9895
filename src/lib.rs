//! Deterministic orchestration replay core.
//!
//! Orchestrations are ordinary async functions. Every decision they make
//! (schedule an activity, start a timer, launch a sub-orchestration) is
//! recorded as an append-only [`Event`], and each time a completion arrives
//! the function is re-run from the start against the recorded history. Code
//! that already ran observes recorded results instantly; the first await with
//! no recorded result ends the pass and the new decisions become commands.
//!
//! - Data model: [`Event`], [`HistoryLog`], [`Command`], [`TaskSet`]
//! - Replay: [`execute`], [`run_turn`] and the [`Executor`] test harness
//! - Orchestrator API: [`OrchestrationContext`], [`DurableFuture`], retries via
//!   [`RetryPolicy`], fan-out/fan-in via `wait_all` / `wait_any`
//! - Host side: [`runtime::OrchestrationEngine`], [`providers::HistoryStore`],
//!   [`runtime::dispatch::LocalDispatcher`]
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub mod error;
pub mod futures;
pub mod history;
pub mod logging;
pub mod providers;
pub mod retry;
pub mod runtime;
pub mod tasks;

pub use error::{BranchFailure, EngineError, FailureDetails, FanInError, OrchestrationError};
pub use futures::{DurableFuture, WaitAll, WaitAny};
pub use history::{Event, HistoryError, HistoryLog, HistoryRecord, TaskKind};
pub use logging::LogLevel;
pub use retry::{RetryPolicy, RetryPolicyError};
pub use runtime::replay::{ReplayOutcome, execute};
pub use runtime::{
    Completion, DispatchItem, EngineOptions, OrchestrationEngine, OrchestrationHandler, OrchestrationRegistry,
    OrchestrationStatus, StatusReport,
};
pub use tasks::{PendingTask, TaskSet, TaskState};

// JSON codec behind the typed helpers. Plain strings travel unquoted so
// typed and untyped callers can share activities.
pub(crate) mod codec {
    use serde::{Serialize, de::DeserializeOwned};
    use serde_json::Value;

    pub(crate) fn encode<T: Serialize>(value: &T) -> Result<String, String> {
        match serde_json::to_value(value).map_err(|e| e.to_string())? {
            Value::String(s) => Ok(s),
            other => Ok(other.to_string()),
        }
    }

    pub(crate) fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
        serde_json::from_str::<T>(raw)
            .or_else(|_| serde_json::from_value(Value::String(raw.to_string())).map_err(|e| e.to_string()))
    }
}

/// Decisions produced by a replay pass for the dispatcher to carry out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    ScheduleActivity {
        task_id: u64,
        name: String,
        input: String,
    },
    /// `instance_id` is the deterministic child id `"{parent}::sub::{task_id}"`.
    ScheduleSubOrchestration {
        task_id: u64,
        name: String,
        input: String,
        instance_id: String,
    },
    StartTimer {
        task_id: u64,
        fire_at_ms: u64,
    },
    /// Advisory: the orchestrator stopped waiting on this timer.
    CancelTimer {
        task_id: u64,
    },
}

impl Command {
    pub fn task_id(&self) -> u64 {
        match self {
            Command::ScheduleActivity { task_id, .. }
            | Command::ScheduleSubOrchestration { task_id, .. }
            | Command::StartTimer { task_id, .. }
            | Command::CancelTimer { task_id } => *task_id,
        }
    }
}

/// A completion as seen by orchestrator code once it is visible in replay.
#[derive(Debug, Clone)]
pub(crate) enum Resolution {
    Completed(String),
    Failed(FailureDetails),
    Fired,
}

#[derive(Debug)]
struct CtxInner {
    instance_id: String,
    // Recorded history followed by the TaskScheduled events decided this pass.
    history: Vec<Event>,
    baseline_len: usize,
    scheduled_at: HashMap<u64, usize>,
    completed_at: HashMap<u64, usize>,
    // Indices of completion events, in history order.
    stages: Vec<usize>,
    // (index, timestamp) of every OrchestratorStarted.
    episodes: Vec<(usize, u64)>,
    revealed_through: Option<usize>,

    commands: Vec<Command>,
    next_task_id: u64,
    tasks: TaskSet,

    current_time_ms: u64,
    turn_index: u64,
    replaying: bool,
    log_buffer: Vec<(LogLevel, String)>,
    nondeterminism: Option<String>,
}

impl CtxInner {
    fn new(instance_id: String, history: Vec<Event>) -> Self {
        let mut scheduled_at = HashMap::new();
        let mut completed_at = HashMap::new();
        let mut stages = Vec::new();
        let mut episodes = Vec::new();
        for (idx, event) in history.iter().enumerate() {
            match event {
                Event::TaskScheduled { task_id, .. } => {
                    scheduled_at.entry(*task_id).or_insert(idx);
                }
                Event::TaskCompleted { task_id, .. }
                | Event::TaskFailed { task_id, .. }
                | Event::TimerFired { task_id, .. } => {
                    completed_at.entry(*task_id).or_insert(idx);
                    stages.push(idx);
                }
                Event::OrchestratorStarted { timestamp } => episodes.push((idx, *timestamp)),
                _ => {}
            }
        }
        let current_time_ms = episodes.first().map_or(0, |(_, ts)| *ts);
        Self {
            instance_id,
            baseline_len: history.len(),
            history,
            scheduled_at,
            completed_at,
            replaying: !stages.is_empty(),
            stages,
            episodes,
            revealed_through: None,
            commands: Vec::new(),
            next_task_id: 0,
            tasks: TaskSet::new(),
            current_time_ms,
            turn_index: 0,
            log_buffer: Vec::new(),
            nondeterminism: None,
        }
    }

    // Structural checks on the recorded history before any code runs.
    fn validate(&self) -> Result<(), String> {
        let mut seen = HashMap::new();
        let mut resolved = HashSet::new();
        for (idx, event) in self.history[..self.baseline_len].iter().enumerate() {
            match event {
                Event::TaskScheduled { task_id, kind, .. } => {
                    if seen.insert(*task_id, *kind).is_some() {
                        return Err(format!("task {task_id} is scheduled twice in history"));
                    }
                }
                Event::TaskCompleted { task_id, .. }
                | Event::TaskFailed { task_id, .. }
                | Event::TimerFired { task_id, .. } => {
                    let Some(kind) = seen.get(task_id) else {
                        return Err(format!(
                            "completion at position {} refers to task {task_id}, which was never scheduled",
                            idx + 1
                        ));
                    };
                    let timer_event = matches!(event, Event::TimerFired { .. });
                    if timer_event != (*kind == TaskKind::Timer) {
                        return Err(format!(
                            "completion at position {} does not fit task {task_id}, a {kind}",
                            idx + 1
                        ));
                    }
                    if !resolved.insert(*task_id) {
                        return Err(format!(
                            "completion at position {} resolves task {task_id} a second time",
                            idx + 1
                        ));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    // Stage 0 reveals nothing; stage k reveals the kth completion.
    fn enter_stage(&mut self, stage: usize) {
        let episode = if stage == 0 {
            self.revealed_through = None;
            (!self.episodes.is_empty()).then_some(0)
        } else {
            let idx = self.stages[stage - 1];
            self.revealed_through = Some(idx);
            self.episodes.iter().rposition(|(e, _)| *e < idx)
        };
        if let Some(pos) = episode {
            self.current_time_ms = self.episodes[pos].1;
            self.turn_index = pos as u64;
        }
        self.replaying = stage < self.stages.len();
    }

    fn is_visible(&self, idx: usize) -> bool {
        self.revealed_through.is_some_and(|r| idx <= r)
    }

    fn violate(&mut self, message: String) {
        if self.nondeterminism.is_none() {
            self.nondeterminism = Some(message);
        }
    }

    /// Claim the next task id, matching it against history or recording a
    /// new decision. Returns the id and, for timers, the fire time.
    fn schedule(&mut self, kind: TaskKind, name: &str, input: &str, delay: Option<Duration>, attempt: u32) -> (u64, Option<u64>) {
        self.next_task_id += 1;
        let task_id = self.next_task_id;
        let mut fire_at_ms = delay.map(|d| self.current_time_ms.saturating_add(d.as_millis() as u64));

        let recorded = self.scheduled_at.get(&task_id).map(|idx| self.history[*idx].clone());
        match recorded {
            Some(Event::TaskScheduled {
                kind: h_kind,
                name: h_name,
                input: h_input,
                fire_at_ms: h_fire_at,
                ..
            }) => {
                if h_kind != kind || h_name != name {
                    self.violate(format!(
                        "task {task_id}: history recorded {h_kind} '{h_name}' but the orchestrator scheduled {kind} '{name}'"
                    ));
                } else if kind != TaskKind::Timer && h_input != input {
                    self.violate(format!(
                        "task {task_id} ({kind} '{name}'): input changed from {h_input:?} to {input:?}"
                    ));
                }
                if kind == TaskKind::Timer {
                    fire_at_ms = h_fire_at.or(fire_at_ms);
                }
            }
            _ => {
                let command = match kind {
                    TaskKind::Activity => Command::ScheduleActivity {
                        task_id,
                        name: name.to_string(),
                        input: input.to_string(),
                    },
                    TaskKind::SubOrchestration => Command::ScheduleSubOrchestration {
                        task_id,
                        name: name.to_string(),
                        input: input.to_string(),
                        instance_id: format!("{}::sub::{task_id}", self.instance_id),
                    },
                    TaskKind::Timer => Command::StartTimer {
                        task_id,
                        fire_at_ms: fire_at_ms.unwrap_or(self.current_time_ms),
                    },
                };
                self.history.push(Event::TaskScheduled {
                    task_id,
                    kind,
                    name: name.to_string(),
                    input: input.to_string(),
                    fire_at_ms,
                });
                self.commands.push(command);
            }
        }
        self.tasks.insert_scheduled(task_id, kind, name.to_string(), attempt);
        (task_id, fire_at_ms)
    }

    fn resolution(&self, task_id: u64) -> Option<Resolution> {
        let idx = *self.completed_at.get(&task_id)?;
        if !self.is_visible(idx) {
            return None;
        }
        match &self.history[idx] {
            Event::TaskCompleted { result, .. } => Some(Resolution::Completed(result.clone())),
            Event::TaskFailed { failure, .. } => Some(Resolution::Failed(failure.clone())),
            Event::TimerFired { .. } => Some(Resolution::Fired),
            _ => None,
        }
    }

    // Recorded tasks the code never claimed mean it took a different path.
    fn check_unclaimed(&mut self) {
        let claimed = self.next_task_id;
        let skipped = self.history[..self.baseline_len].iter().find_map(|e| match e {
            Event::TaskScheduled { task_id, kind, name, .. } if *task_id > claimed => {
                Some(format!("history records task {task_id} ({kind} '{name}') which the orchestrator did not schedule"))
            }
            _ => None,
        });
        if let Some(message) = skipped {
            self.violate(message);
        }
    }
}

/// User-facing orchestration context for scheduling and replay-safe helpers.
///
/// Cloning is cheap; all clones share the same pass state.
#[derive(Clone)]
pub struct OrchestrationContext {
    inner: Arc<Mutex<CtxInner>>,
}

impl OrchestrationContext {
    pub(crate) fn new(instance_id: impl Into<String>, history: Vec<Event>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CtxInner::new(instance_id.into(), history))),
        }
    }

    // A panic in orchestrator code never happens while this lock is held, so
    // a poisoned lock still guards consistent state.
    fn lock(&self) -> MutexGuard<'_, CtxInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn instance_id(&self) -> String {
        self.lock().instance_id.clone()
    }

    /// Deterministic logical time: the engine clock reading recorded when the
    /// pass that first ran the current code path started.
    pub fn current_time_ms(&self) -> u64 {
        self.lock().current_time_ms
    }

    /// True while the code is re-executing decisions already in history.
    pub fn is_replaying(&self) -> bool {
        self.lock().replaying
    }

    pub fn is_logging_enabled(&self) -> bool {
        !self.is_replaying()
    }

    /// Zero-based index of the pass that first ran the current code path.
    pub fn turn_index(&self) -> u64 {
        self.lock().turn_index
    }

    /// Buffer a log line for this pass. Suppressed while replaying so each
    /// line is emitted once over the life of the instance.
    pub fn trace(&self, level: LogLevel, message: impl Into<String>) {
        let mut inner = self.lock();
        if !inner.replaying {
            inner.log_buffer.push((level, message.into()));
        }
    }

    pub fn trace_info(&self, message: impl Into<String>) {
        self.trace(LogLevel::Info, message);
    }
    pub fn trace_warn(&self, message: impl Into<String>) {
        self.trace(LogLevel::Warn, message);
    }

    /// Schedule an activity. The decision is recorded immediately; awaiting
    /// the returned future observes its completion.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture::schedule(self.clone(), TaskKind::Activity, name.into(), input.into(), None, None)
    }

    /// Like [`schedule_activity`](Self::schedule_activity), retrying transient
    /// failures under `policy` with durable backoff timers between attempts.
    pub fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) -> DurableFuture {
        DurableFuture::schedule(
            self.clone(),
            TaskKind::Activity,
            name.into(),
            input.into(),
            None,
            Some(policy),
        )
    }

    /// Typed activity call: input is JSON-encoded, output decoded.
    pub fn schedule_activity_typed<In, Out>(
        &self,
        name: &str,
        input: &In,
    ) -> impl Future<Output = Result<Out, OrchestrationError>> + use<In, Out>
    where
        In: Serialize,
        Out: serde::de::DeserializeOwned,
    {
        let scheduled = codec::encode(input).map(|payload| self.schedule_activity(name, payload));
        async move {
            let fut = scheduled.map_err(|e| OrchestrationError::Application(format!("encode: {e}")))?;
            fut.into_typed::<Out>().await
        }
    }

    pub fn schedule_sub_orchestration(&self, name: impl Into<String>, input: impl Into<String>) -> DurableFuture {
        DurableFuture::schedule(
            self.clone(),
            TaskKind::SubOrchestration,
            name.into(),
            input.into(),
            None,
            None,
        )
    }

    pub fn schedule_sub_orchestration_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        policy: RetryPolicy,
    ) -> DurableFuture {
        DurableFuture::schedule(
            self.clone(),
            TaskKind::SubOrchestration,
            name.into(),
            input.into(),
            None,
            Some(policy),
        )
    }

    pub fn schedule_sub_orchestration_typed<In, Out>(
        &self,
        name: &str,
        input: &In,
    ) -> impl Future<Output = Result<Out, OrchestrationError>> + use<In, Out>
    where
        In: Serialize,
        Out: serde::de::DeserializeOwned,
    {
        let scheduled = codec::encode(input).map(|payload| self.schedule_sub_orchestration(name, payload));
        async move {
            let fut = scheduled.map_err(|e| OrchestrationError::Application(format!("encode: {e}")))?;
            fut.into_typed::<Out>().await
        }
    }

    /// Durable timer firing `delay` after the current logical time. Resolves
    /// to `Ok` with an empty payload.
    pub fn schedule_timer(&self, delay: Duration) -> DurableFuture {
        DurableFuture::schedule(self.clone(), TaskKind::Timer, "timer".into(), String::new(), Some(delay), None)
    }

    /// Stop waiting on a timer. Equivalent to [`DurableFuture::cancel`].
    pub fn cancel_timer(&self, timer: &DurableFuture) -> bool {
        timer.cancel()
    }

    /// Fan-in: resolve once every branch resolved, results in submission order.
    pub fn wait_all<T, F>(&self, futures: impl IntoIterator<Item = F>) -> WaitAll<F>
    where
        F: Future<Output = Result<T, OrchestrationError>>,
    {
        futures::wait_all(futures)
    }

    /// Race: resolve with the index and output of the first branch whose
    /// completion appears in history. Panics if `futures` is empty.
    pub fn wait_any<F: Future>(&self, futures: impl IntoIterator<Item = F>) -> WaitAny<F> {
        futures::wait_any(futures)
    }

    // ---- hooks for DurableFuture and the replay executor ----

    pub(crate) fn schedule_task(
        &self,
        kind: TaskKind,
        name: &str,
        input: &str,
        delay: Option<Duration>,
        attempt: u32,
    ) -> u64 {
        self.lock().schedule(kind, name, input, delay, attempt).0
    }

    /// Schedule the backoff timer that precedes the next attempt of
    /// `failed_task` and note when it fires.
    pub(crate) fn schedule_backoff(&self, failed_task: u64, name: &str, delay: Duration) -> u64 {
        let mut inner = self.lock();
        let (timer_id, fire_at) = inner.schedule(TaskKind::Timer, &format!("backoff:{name}"), "", Some(delay), 1);
        inner.tasks.set_next_retry_at(failed_task, fire_at);
        timer_id
    }

    pub(crate) fn resolution(&self, task_id: u64) -> Option<Resolution> {
        self.lock().resolution(task_id)
    }

    pub(crate) fn cancel_task(&self, task_id: u64) -> bool {
        let mut inner = self.lock();
        if inner.resolution(task_id).is_some() {
            return false;
        }
        inner.tasks.cancel(task_id)
    }

    pub(crate) fn validate_history(&self) -> Result<(), String> {
        self.lock().validate()
    }

    pub(crate) fn stage_count(&self) -> usize {
        self.lock().stages.len()
    }

    pub(crate) fn enter_stage(&self, stage: usize) {
        self.lock().enter_stage(stage);
    }

    pub(crate) fn nondeterminism(&self) -> Option<String> {
        self.lock().nondeterminism.clone()
    }

    /// Close the pass: run end-of-pass checks and hand back everything the
    /// pass produced.
    pub(crate) fn finish(&self) -> PassProducts {
        let mut inner = self.lock();
        inner.check_unclaimed();
        let baseline_len = inner.baseline_len;
        let new_events = inner.history.split_off(baseline_len);
        let mut tasks = std::mem::take(&mut inner.tasks);
        tasks.apply_history(&inner.history);
        PassProducts {
            commands: std::mem::take(&mut inner.commands),
            new_events,
            tasks,
            logs: std::mem::take(&mut inner.log_buffer),
            violation: inner.nondeterminism.take(),
        }
    }
}

pub(crate) struct PassProducts {
    pub(crate) commands: Vec<Command>,
    pub(crate) new_events: Vec<Event>,
    pub(crate) tasks: TaskSet,
    pub(crate) logs: Vec<(LogLevel, String)>,
    pub(crate) violation: Option<String>,
}

/// Run one replay pass of `orchestrator` over `history`. The input comes
/// from the `ExecutionStarted` event when present.
pub fn run_turn<F, Fut>(history: &[Event], orchestrator: F) -> ReplayOutcome
where
    F: FnOnce(OrchestrationContext) -> Fut,
    Fut: Future<Output = Result<String, OrchestrationError>>,
{
    let input = history
        .iter()
        .find_map(|e| match e {
            Event::ExecutionStarted { input, .. } => Some(input.clone()),
            _ => None,
        })
        .unwrap_or_default();
    execute("inline", history, &input, |ctx, _input| orchestrator(ctx))
}

/// Helper for single-threaded, host-driven execution in tests and samples.
pub struct Executor;

impl Executor {
    /// Alternate replay passes with `materialize`, which turns commands into
    /// completion events, until the orchestrator reaches a terminal result.
    ///
    /// Each pass after the first is preceded by an `OrchestratorStarted`
    /// whose timestamp is the pass number. A pass that leaves the
    /// orchestration waiting while `materialize` records nothing stalls the
    /// drive, which is reported as an application error.
    pub fn drive_to_completion<F, Fut, X>(
        mut history: Vec<Event>,
        orchestrator: F,
        mut materialize: X,
    ) -> (Vec<Event>, Result<String, OrchestrationError>)
    where
        F: Fn(OrchestrationContext) -> Fut,
        Fut: Future<Output = Result<String, OrchestrationError>>,
        X: FnMut(Vec<Command>, &mut Vec<Event>),
    {
        let mut pass = 0u64;
        if !history.iter().any(|e| matches!(e, Event::OrchestratorStarted { .. })) {
            history.push(Event::OrchestratorStarted { timestamp: pass });
        }
        loop {
            let outcome = run_turn(&history, &orchestrator);
            history.extend(outcome.new_events);
            if let Some(result) = outcome.terminal {
                return (history, result);
            }
            pass += 1;
            let mut completions = Vec::new();
            materialize(outcome.commands, &mut completions);
            if completions.is_empty() {
                return (
                    history,
                    Err(OrchestrationError::Application(
                        "orchestration stalled: no completions materialized".into(),
                    )),
                );
            }
            history.push(Event::OrchestratorStarted { timestamp: pass });
            history.extend(completions);
        }
    }
}
