//! Instance lifecycle: start, deliver completions, replay, persist, emit
//! commands.
//!
//! Each instance sits behind its own async mutex so at most one replay pass
//! runs per instance at a time; the instance map lock is only held to look
//! instances up or insert them. Commands leave the engine through an
//! unbounded channel of [`DispatchItem`]s.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::providers::HistoryStore;
use crate::runtime::replay::{DefaultReplayEngine, ReplayEngine};
use crate::{
    Command, EngineError, Event, FailureDetails, HistoryError, HistoryLog, HistoryRecord, OrchestrationError, TaskKind,
    TaskSet, TaskState, logging,
};

pub mod dispatch;
pub mod options;
pub mod registry;
pub mod replay;

pub use options::{Clock, EngineOptions, ManualClock, SystemClock};
pub use registry::{
    ActivityHandler, ActivityRegistry, ActivityRegistryBuilder, FnActivity, FnOrchestration, OrchestrationHandler,
    OrchestrationRegistry, OrchestrationRegistryBuilder,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestrationStatus {
    /// Created; first pass not yet recorded.
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
}

impl OrchestrationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrchestrationStatus::Completed | OrchestrationStatus::Failed | OrchestrationStatus::Terminated
        )
    }
}

/// Result of a task as reported by a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Success(String),
    Failure(FailureDetails),
    TimerFired { fired_at_ms: u64 },
}

/// A command addressed to the instance that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchItem {
    pub instance_id: String,
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub instance_id: String,
    pub name: String,
    pub status: OrchestrationStatus,
    pub output: Option<String>,
    pub error: Option<OrchestrationError>,
    pub created_at: u64,
    pub last_updated_at: u64,
}

/// Error type returned by the wait helper.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out waiting for instance to finish")]
    Timeout,
    #[error(transparent)]
    Engine(#[from] EngineError),
}

struct OrchestrationInstance {
    instance_id: String,
    name: String,
    input: String,
    status: OrchestrationStatus,
    output: Option<String>,
    error: Option<OrchestrationError>,
    created_at: u64,
    last_updated_at: u64,
    history: HistoryLog,
    tasks: TaskSet,
}

impl OrchestrationInstance {
    fn report(&self) -> StatusReport {
        StatusReport {
            instance_id: self.instance_id.clone(),
            name: self.name.clone(),
            status: self.status,
            output: self.output.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            last_updated_at: self.last_updated_at,
        }
    }

    /// Rebuild lifecycle fields from a validated history. Tasks are left
    /// empty for the caller to fill by replay.
    fn from_history(instance_id: &str, history: HistoryLog) -> Result<Self, EngineError> {
        let (name, input) = history
            .header()
            .map(|(n, i)| (n.to_string(), i.to_string()))
            .ok_or_else(|| EngineError::Store(format!("history of {instance_id} does not start with ExecutionStarted")))?;
        let mut stamps = history.records().iter().filter_map(|r| match r.event {
            Event::OrchestratorStarted { timestamp } => Some(timestamp),
            _ => None,
        });
        let created_at = stamps.next();
        let last_updated_at = stamps.last().or(created_at).unwrap_or(0);

        let (status, output, error) = match history.terminal() {
            Some(Event::OrchestratorCompleted { result: Ok(out) }) => {
                (OrchestrationStatus::Completed, Some(out.clone()), None)
            }
            Some(Event::OrchestratorCompleted { result: Err(err) }) => {
                (OrchestrationStatus::Failed, None, Some(err.clone()))
            }
            Some(Event::ExecutionTerminated { reason }) => (
                OrchestrationStatus::Terminated,
                None,
                Some(OrchestrationError::Terminated(reason.clone())),
            ),
            _ if created_at.is_some() => (OrchestrationStatus::Running, None, None),
            _ => (OrchestrationStatus::Pending, None, None),
        };
        Ok(Self {
            instance_id: instance_id.to_string(),
            name,
            input,
            status,
            output,
            error,
            created_at: created_at.unwrap_or(0),
            last_updated_at,
            history,
            tasks: TaskSet::new(),
        })
    }

    /// An instance whose stored history breaks the sequence. It is kept as
    /// `Failed`, described by the readable prefix of its records.
    fn corrupt(instance_id: &str, records: Vec<HistoryRecord>, err: HistoryError, now: u64) -> Self {
        let prefix = records
            .into_iter()
            .enumerate()
            .take_while(|(pos, r)| r.seq == *pos as u64 + 1)
            .map(|(_, r)| r);
        let history = HistoryLog::from_records(prefix).unwrap_or_default();
        let (name, input) = history
            .header()
            .map(|(n, i)| (n.to_string(), i.to_string()))
            .unwrap_or_default();
        let created_at = history
            .records()
            .iter()
            .find_map(|r| match r.event {
                Event::OrchestratorStarted { timestamp } => Some(timestamp),
                _ => None,
            })
            .unwrap_or(now);
        Self {
            instance_id: instance_id.to_string(),
            name,
            input,
            status: OrchestrationStatus::Failed,
            output: None,
            error: Some(err.into()),
            created_at,
            last_updated_at: now,
            history,
            tasks: TaskSet::new(),
        }
    }
}

type InstanceHandle = Arc<Mutex<OrchestrationInstance>>;

/// Owns orchestration instances, drives replay and persists history.
pub struct OrchestrationEngine {
    registry: OrchestrationRegistry,
    store: Arc<dyn HistoryStore>,
    replay: Arc<dyn ReplayEngine>,
    options: EngineOptions,
    instances: Mutex<HashMap<String, InstanceHandle>>,
    outbound: mpsc::UnboundedSender<DispatchItem>,
}

impl OrchestrationEngine {
    /// Create an engine and the receiving end of its command channel.
    pub fn new(
        registry: OrchestrationRegistry,
        store: Arc<dyn HistoryStore>,
        options: EngineOptions,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DispatchItem>) {
        Self::with_replay_engine(registry, store, options, Arc::new(DefaultReplayEngine::new()))
    }

    pub fn with_replay_engine(
        registry: OrchestrationRegistry,
        store: Arc<dyn HistoryStore>,
        options: EngineOptions,
        replay: Arc<dyn ReplayEngine>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<DispatchItem>) {
        // Install a default subscriber if none set (ok to call many times)
        logging::init_tracing();
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            registry,
            store,
            replay,
            options,
            instances: Mutex::new(HashMap::new()),
            outbound: tx,
        });
        (engine, rx)
    }

    pub fn now_ms(&self) -> u64 {
        self.options.clock.now_ms()
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Start an instance under a generated id and run its first pass.
    pub async fn start_instance(&self, name: &str, input: impl Into<String>) -> Result<String, EngineError> {
        let instance_id = format!("{}{}", self.options.id_prefix, uuid::Uuid::new_v4());
        self.start_instance_with_id(&instance_id, name, input).await
    }

    /// Start an instance under a caller-chosen id and run its first pass.
    pub async fn start_instance_with_id(
        &self,
        instance_id: &str,
        name: &str,
        input: impl Into<String>,
    ) -> Result<String, EngineError> {
        if !self.registry.contains(name) {
            return Err(EngineError::UnknownOrchestration(name.to_string()));
        }
        let input = input.into();
        let now = self.now_ms();
        let mut history = HistoryLog::new();
        let header = history.push(Event::ExecutionStarted {
            name: name.to_string(),
            input: input.clone(),
        });

        let mut guard = {
            let mut map = self.instances.lock().await;
            if map.contains_key(instance_id) || self.store.exists(instance_id).await {
                return Err(EngineError::InstanceAlreadyExists(instance_id.to_string()));
            }
            self.store.create_instance(instance_id).await.map_err(EngineError::Store)?;
            self.store
                .append(instance_id, vec![header])
                .await
                .map_err(EngineError::Store)?;
            let inst = Arc::new(Mutex::new(OrchestrationInstance {
                instance_id: instance_id.to_string(),
                name: name.to_string(),
                input,
                status: OrchestrationStatus::Pending,
                output: None,
                error: None,
                created_at: now,
                last_updated_at: now,
                history,
                tasks: TaskSet::new(),
            }));
            map.insert(instance_id.to_string(), inst.clone());
            inst.lock_owned().await
        };
        info!(instance = %instance_id, orchestration = %name, "instance started");
        self.run_pass(&mut guard, Vec::new()).await?;
        Ok(instance_id.to_string())
    }

    /// Record a task result and run a replay pass.
    pub async fn deliver_completion(
        &self,
        instance_id: &str,
        task_id: u64,
        completion: Completion,
    ) -> Result<(), EngineError> {
        let handle = self.instance(instance_id).await?;
        let mut inst = handle.lock().await;
        if inst.status.is_terminal() {
            return Err(EngineError::UnknownInstance(instance_id.to_string()));
        }
        let unknown_task = || EngineError::UnknownTask {
            instance: instance_id.to_string(),
            task_id,
        };
        let (kind, state) = inst
            .tasks
            .get(task_id)
            .map(|t| (t.kind, t.state))
            .ok_or_else(unknown_task)?;
        // A cancelled timer may still fire once; that is accepted and has no effect.
        let open = match state {
            TaskState::Scheduled => true,
            TaskState::Cancelled => !inst.history.is_resolved(task_id),
            TaskState::Completed | TaskState::Failed => false,
        };
        if !open {
            return Err(unknown_task());
        }
        let event = match (kind, completion) {
            (TaskKind::Timer, Completion::TimerFired { fired_at_ms }) => Event::TimerFired { task_id, fired_at_ms },
            (TaskKind::Activity | TaskKind::SubOrchestration, Completion::Success(result)) => {
                Event::TaskCompleted { task_id, result }
            }
            (TaskKind::Activity | TaskKind::SubOrchestration, Completion::Failure(failure)) => {
                Event::TaskFailed { task_id, failure }
            }
            (kind, _) => return Err(EngineError::CompletionKindMismatch { task_id, kind }),
        };
        debug!(instance = %instance_id, task_id, "completion accepted");
        self.run_pass(&mut inst, vec![event]).await
    }

    pub async fn query_status(&self, instance_id: &str) -> Result<StatusReport, EngineError> {
        let handle = self.instance(instance_id).await?;
        let inst = handle.lock().await;
        Ok(inst.report())
    }

    /// Full history of an instance, for diagnostics.
    pub async fn read_history(&self, instance_id: &str) -> Result<Vec<HistoryRecord>, EngineError> {
        let handle = self.instance(instance_id).await?;
        let inst = handle.lock().await;
        Ok(inst.history.read_all())
    }

    /// Stop an instance. Outstanding timers get an advisory `CancelTimer`;
    /// other tasks are left to finish and their completions are rejected.
    pub async fn terminate_instance(&self, instance_id: &str, reason: impl Into<String>) -> Result<(), EngineError> {
        let reason = reason.into();
        let handle = self.instance(instance_id).await?;
        let mut inst = handle.lock().await;
        if inst.status.is_terminal() {
            return Err(EngineError::UnknownInstance(instance_id.to_string()));
        }
        let mut history = inst.history.clone();
        let record = history.push(Event::ExecutionTerminated { reason: reason.clone() });
        self.store
            .append(instance_id, vec![record])
            .await
            .map_err(EngineError::Store)?;
        inst.history = history;
        inst.status = OrchestrationStatus::Terminated;
        inst.error = Some(OrchestrationError::Terminated(reason.clone()));
        inst.last_updated_at = self.now_ms();

        let timers: Vec<u64> = inst
            .tasks
            .outstanding()
            .filter(|t| t.kind == TaskKind::Timer)
            .map(|t| t.task_id)
            .collect();
        for task_id in timers {
            self.send(instance_id, Command::CancelTimer { task_id });
        }
        info!(instance = %instance_id, %reason, "instance terminated");
        Ok(())
    }

    /// Wait until the instance reaches a terminal status or the timeout elapses.
    pub async fn wait_for_instance(&self, instance_id: &str, timeout: Duration) -> Result<StatusReport, WaitError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let max_backoff = self.options.completion_wait_max_backoff.max(Duration::from_millis(1));
        let mut delay = Duration::from_millis(5).min(max_backoff);
        loop {
            let report = self.query_status(instance_id).await?;
            if report.status.is_terminal() {
                return Ok(report);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(WaitError::Timeout);
            }
            tokio::time::sleep(delay.min(deadline - now)).await;
            delay = (delay * 2).min(max_backoff);
        }
    }

    /// Look an instance up, rebuilding it from the store when it is not in
    /// memory.
    async fn instance(&self, instance_id: &str) -> Result<InstanceHandle, EngineError> {
        let mut map = self.instances.lock().await;
        if let Some(inst) = map.get(instance_id) {
            return Ok(inst.clone());
        }
        let records = self.store.read(instance_id).await;
        if records.is_empty() {
            return Err(EngineError::UnknownInstance(instance_id.to_string()));
        }
        let inst = match HistoryLog::from_records(records.clone()) {
            Ok(history) => {
                let mut inst = OrchestrationInstance::from_history(instance_id, history)?;
                if !inst.status.is_terminal() {
                    inst.tasks = self.silent_replay(&inst);
                }
                inst
            }
            Err(e) => {
                error!(instance = %instance_id, error = %e, "stored history is corrupt; instance failed");
                OrchestrationInstance::corrupt(instance_id, records, e, self.now_ms())
            }
        };
        info!(instance = %instance_id, status = ?inst.status, "instance rehydrated from store");
        let handle = Arc::new(Mutex::new(inst));
        map.insert(instance_id.to_string(), handle.clone());
        Ok(handle)
    }

    // Rebuild the task set without appending or dispatching anything.
    fn silent_replay(&self, inst: &OrchestrationInstance) -> TaskSet {
        let events = inst.history.events();
        let Some(handler) = self.registry.get(&inst.name) else {
            warn!(instance = %inst.instance_id, orchestration = %inst.name, "orchestration not registered");
            return TaskSet::from_history(&events);
        };
        let outcome = self.replay.replay(&inst.instance_id, &events, &inst.input, handler);
        if outcome.terminal.is_some() {
            // Recorded by the next pass; until then accept completions by history.
            warn!(instance = %inst.instance_id, "rehydrated instance reaches a terminal result on replay");
            return TaskSet::from_history(&events);
        }
        outcome.tasks
    }

    /// Append `incoming` after a fresh `OrchestratorStarted`, replay, persist,
    /// then publish status and commands. Nothing changes if persisting fails.
    async fn run_pass(&self, inst: &mut OrchestrationInstance, incoming: Vec<Event>) -> Result<(), EngineError> {
        let handler = self
            .registry
            .get(&inst.name)
            .ok_or_else(|| EngineError::UnknownOrchestration(inst.name.clone()))?;
        let now = self.now_ms();
        let mut history = inst.history.clone();
        let mut appended = vec![history.push(Event::OrchestratorStarted { timestamp: now })];
        appended.extend(incoming.into_iter().map(|e| history.push(e)));

        let outcome = self
            .replay
            .replay(&inst.instance_id, &history.events(), &inst.input, handler);
        appended.extend(outcome.new_events.into_iter().map(|e| history.push(e)));
        self.store
            .append(&inst.instance_id, appended)
            .await
            .map_err(EngineError::Store)?;

        inst.history = history;
        inst.last_updated_at = now;
        logging::emit(&inst.instance_id, &outcome.logs);

        let mut commands = outcome.commands;
        for task in outcome.tasks.cancelled() {
            let newly = inst.tasks.get(task.task_id).is_none_or(|t| t.state != TaskState::Cancelled);
            if newly {
                commands.push(Command::CancelTimer { task_id: task.task_id });
            }
        }
        inst.tasks = outcome.tasks;

        match outcome.terminal {
            None => inst.status = OrchestrationStatus::Running,
            Some(Ok(output)) => {
                info!(instance = %inst.instance_id, "instance completed");
                inst.status = OrchestrationStatus::Completed;
                inst.output = Some(output);
            }
            Some(Err(err)) => {
                if err.is_engine_failure() {
                    error!(instance = %inst.instance_id, error = %err, "instance failed by the engine");
                } else {
                    warn!(instance = %inst.instance_id, error = %err, "instance failed");
                }
                inst.status = OrchestrationStatus::Failed;
                inst.error = Some(err);
            }
        }

        for command in commands {
            self.send(&inst.instance_id, command);
        }
        Ok(())
    }

    fn send(&self, instance_id: &str, command: Command) {
        debug!(instance = %instance_id, ?command, "dispatching command");
        let item = DispatchItem {
            instance_id: instance_id.to_string(),
            command,
        };
        if self.outbound.send(item).is_err() {
            warn!(instance = %instance_id, "command channel closed; command dropped");
        }
    }
}
