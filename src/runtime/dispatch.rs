//! In-process dispatcher: carries out engine commands and reports results
//! back through `deliver_completion`.
//!
//! - activities run on the tokio runtime from an [`ActivityRegistry`]
//! - sub-orchestrations start as child instances of the same engine
//! - timers are tokio sleeps that `CancelTimer` aborts
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::registry::ActivityRegistry;
use super::{Completion, DispatchItem, OrchestrationEngine, OrchestrationStatus, StatusReport, WaitError};
use crate::{Command, EngineError, FailureDetails, OrchestrationError};

pub struct LocalDispatcher {
    engine: Arc<OrchestrationEngine>,
    activities: ActivityRegistry,
    timers: Mutex<HashMap<(String, u64), JoinHandle<()>>>,
    child_poll: Duration,
}

/// Child results as the parent sees them. Application-level failures may be
/// retried by the parent; engine failures, panics and terminations may not.
fn child_completion(report: StatusReport) -> Completion {
    match report.status {
        OrchestrationStatus::Completed => Completion::Success(report.output.unwrap_or_default()),
        _ => {
            let err = report
                .error
                .unwrap_or_else(|| OrchestrationError::Application("child ended without a result".into()));
            let retriable = matches!(
                err,
                OrchestrationError::Application(_)
                    | OrchestrationError::PermanentTaskFailure { .. }
                    | OrchestrationError::FanIn { .. }
            );
            Completion::Failure(FailureDetails {
                kind: err.kind_name().to_string(),
                message: err.to_string(),
                retriable,
            })
        }
    }
}

impl LocalDispatcher {
    pub fn new(engine: Arc<OrchestrationEngine>, activities: ActivityRegistry) -> Arc<Self> {
        Arc::new(Self {
            engine,
            activities,
            timers: Mutex::new(HashMap::new()),
            child_poll: Duration::from_secs(30),
        })
    }

    /// Consume the engine's command channel until it closes.
    pub fn spawn(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<DispatchItem>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                self.dispatch(item).await;
            }
            debug!("command channel closed; dispatcher exiting");
        })
    }

    pub async fn dispatch(self: &Arc<Self>, item: DispatchItem) {
        let DispatchItem { instance_id, command } = item;
        match command {
            Command::ScheduleActivity { task_id, name, input } => {
                let this = self.clone();
                tokio::spawn(async move { this.run_activity(instance_id, task_id, name, input).await });
            }
            Command::ScheduleSubOrchestration {
                task_id,
                name,
                input,
                instance_id: child_id,
            } => {
                let this = self.clone();
                tokio::spawn(async move {
                    this.run_sub_orchestration(instance_id, task_id, name, input, child_id)
                        .await
                });
            }
            Command::StartTimer { task_id, fire_at_ms } => {
                let this = self.clone();
                let key = (instance_id.clone(), task_id);
                // Held until the handle is stored, so a zero-delay timer cannot
                // remove its entry before it exists.
                let mut timers = self.timers.lock().await;
                let handle = tokio::spawn(async move {
                    let wait = fire_at_ms.saturating_sub(this.engine.now_ms());
                    tokio::time::sleep(Duration::from_millis(wait)).await;
                    this.timers.lock().await.remove(&(instance_id.clone(), task_id));
                    let fired_at_ms = this.engine.now_ms().max(fire_at_ms);
                    this.deliver(&instance_id, task_id, Completion::TimerFired { fired_at_ms })
                        .await;
                });
                timers.insert(key, handle);
            }
            Command::CancelTimer { task_id } => {
                if let Some(handle) = self.timers.lock().await.remove(&(instance_id.clone(), task_id)) {
                    debug!(instance = %instance_id, task_id, "timer cancelled");
                    handle.abort();
                }
            }
        }
    }

    async fn run_activity(&self, instance_id: String, task_id: u64, name: String, input: String) {
        let completion = match self.activities.get(&name) {
            Some(handler) => match tokio::spawn(async move { handler.invoke(input).await }).await {
                Ok(Ok(output)) => Completion::Success(output),
                Ok(Err(failure)) => Completion::Failure(failure),
                Err(join) => Completion::Failure(FailureDetails::permanent("Panicked", join.to_string())),
            },
            None => Completion::Failure(FailureDetails::permanent("Unregistered", format!("unregistered:{name}"))),
        };
        self.deliver(&instance_id, task_id, completion).await;
    }

    async fn run_sub_orchestration(
        &self,
        parent_id: String,
        task_id: u64,
        name: String,
        input: String,
        child_id: String,
    ) {
        match self.engine.start_instance_with_id(&child_id, &name, input).await {
            // An existing child means the parent was rehydrated after it started.
            Ok(_) | Err(EngineError::InstanceAlreadyExists(_)) => {}
            Err(e) => {
                let failure = FailureDetails::permanent("SubOrchestrationStart", e.to_string());
                self.deliver(&parent_id, task_id, Completion::Failure(failure)).await;
                return;
            }
        }
        let completion = loop {
            match self.engine.wait_for_instance(&child_id, self.child_poll).await {
                Ok(report) => break child_completion(report),
                Err(WaitError::Timeout) => continue,
                Err(WaitError::Engine(e)) => {
                    break Completion::Failure(FailureDetails::permanent("SubOrchestration", e.to_string()));
                }
            }
        };
        self.deliver(&parent_id, task_id, completion).await;
    }

    async fn deliver(&self, instance_id: &str, task_id: u64, completion: Completion) {
        match self.engine.deliver_completion(instance_id, task_id, completion).await {
            Ok(()) => {}
            // The instance finished or moved on; late results are expected.
            Err(e @ (EngineError::UnknownInstance(_) | EngineError::UnknownTask { .. })) => {
                debug!(instance = %instance_id, task_id, error = %e, "completion not accepted");
            }
            Err(e) => warn!(instance = %instance_id, task_id, error = %e, "completion delivery failed"),
        }
    }
}
