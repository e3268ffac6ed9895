//! Bookkeeping of the tasks an instance has scheduled, rebuilt on every pass.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::history::{Event, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Scheduled,
    Completed,
    Failed,
    /// Timer abandoned by the orchestrator; a late fire is accepted and ignored.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTask {
    pub task_id: u64,
    pub kind: TaskKind,
    pub name: String,
    pub state: TaskState,
    pub attempt: u32,
    /// Fire time of the backoff timer this failed attempt is waiting on.
    pub next_retry_at: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskSet {
    tasks: BTreeMap<u64, PendingTask>,
}

impl TaskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive task states straight from a history. Attempt numbers are not
    /// recorded in history, so every entry reports attempt 1.
    pub fn from_history(events: &[Event]) -> Self {
        let mut set = Self::new();
        for event in events {
            if let Event::TaskScheduled { task_id, kind, name, .. } = event {
                set.insert_scheduled(*task_id, *kind, name.clone(), 1);
            }
        }
        set.apply_history(events);
        set
    }

    pub fn insert_scheduled(&mut self, task_id: u64, kind: TaskKind, name: String, attempt: u32) {
        self.tasks.insert(
            task_id,
            PendingTask {
                task_id,
                kind,
                name,
                state: TaskState::Scheduled,
                attempt,
                next_retry_at: None,
            },
        );
    }

    /// Fold completion events into task states. Only `Scheduled` tasks
    /// transition; a fire for a cancelled timer leaves it cancelled.
    pub fn apply_history(&mut self, events: &[Event]) {
        for event in events {
            let (task_id, state) = match event {
                Event::TaskCompleted { task_id, .. } | Event::TimerFired { task_id, .. } => {
                    (*task_id, TaskState::Completed)
                }
                Event::TaskFailed { task_id, .. } => (*task_id, TaskState::Failed),
                _ => continue,
            };
            self.transition(task_id, state);
        }
    }

    /// Cancel a still-scheduled timer. Returns false for anything else.
    pub fn cancel(&mut self, task_id: u64) -> bool {
        match self.tasks.get(&task_id) {
            Some(t) if t.kind == TaskKind::Timer => self.transition(task_id, TaskState::Cancelled),
            _ => false,
        }
    }

    fn transition(&mut self, task_id: u64, state: TaskState) -> bool {
        match self.tasks.get_mut(&task_id) {
            Some(task) if task.state == TaskState::Scheduled => {
                task.state = state;
                true
            }
            _ => false,
        }
    }

    pub fn set_next_retry_at(&mut self, task_id: u64, fire_at_ms: Option<u64>) {
        if let Some(task) = self.tasks.get_mut(&task_id) {
            task.next_retry_at = fire_at_ms;
        }
    }

    pub fn get(&self, task_id: u64) -> Option<&PendingTask> {
        self.tasks.get(&task_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingTask> {
        self.tasks.values()
    }

    /// Tasks still waiting for a completion, in id order.
    pub fn outstanding(&self) -> impl Iterator<Item = &PendingTask> {
        self.tasks.values().filter(|t| t.state == TaskState::Scheduled)
    }

    pub fn cancelled(&self) -> impl Iterator<Item = &PendingTask> {
        self.tasks.values().filter(|t| t.state == TaskState::Cancelled)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
