//! Append-only, sequenced history for a single orchestration instance.
//!
//! Every record carries a sequence number starting at 1. The log refuses any
//! record that does not continue the sequence, which is how gaps or reordering
//! in a backing store surface as [`HistoryError::OrderingViolation`].
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FailureDetails, OrchestrationError};

/// What a scheduled task is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    Activity,
    SubOrchestration,
    Timer,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskKind::Activity => "activity",
            TaskKind::SubOrchestration => "sub-orchestration",
            TaskKind::Timer => "timer",
        };
        f.write_str(s)
    }
}

/// Immutable history event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// First event of every instance.
    ExecutionStarted { name: String, input: String },
    /// Marks the start of one replay pass; carries the engine clock reading.
    OrchestratorStarted { timestamp: u64 },
    TaskScheduled {
        task_id: u64,
        kind: TaskKind,
        name: String,
        input: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fire_at_ms: Option<u64>,
    },
    TaskCompleted { task_id: u64, result: String },
    TaskFailed { task_id: u64, failure: FailureDetails },
    TimerFired { task_id: u64, fired_at_ms: u64 },
    OrchestratorCompleted { result: Result<String, OrchestrationError> },
    ExecutionTerminated { reason: String },
}

impl Event {
    pub fn task_id(&self) -> Option<u64> {
        match self {
            Event::TaskScheduled { task_id, .. }
            | Event::TaskCompleted { task_id, .. }
            | Event::TaskFailed { task_id, .. }
            | Event::TimerFired { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::OrchestratorCompleted { .. } | Event::ExecutionTerminated { .. }
        )
    }
}

/// An event together with its position in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub seq: u64,
    pub event: Event,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("history ordering violation: expected sequence {expected}, found {found}")]
    OrderingViolation { expected: u64, found: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryLog {
    records: Vec<HistoryRecord>,
}

impl HistoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a log from stored records, validating the sequence.
    pub fn from_records(records: impl IntoIterator<Item = HistoryRecord>) -> Result<Self, HistoryError> {
        let mut log = Self::new();
        for record in records {
            log.append(record)?;
        }
        Ok(log)
    }

    pub fn last_seq(&self) -> u64 {
        self.records.last().map_or(0, |r| r.seq)
    }

    pub fn append(&mut self, record: HistoryRecord) -> Result<(), HistoryError> {
        let expected = self.last_seq() + 1;
        if record.seq != expected {
            return Err(HistoryError::OrderingViolation {
                expected,
                found: record.seq,
            });
        }
        self.records.push(record);
        Ok(())
    }

    /// Append an event under the next sequence number and return a copy of
    /// the stored record.
    pub fn push(&mut self, event: Event) -> HistoryRecord {
        let record = HistoryRecord {
            seq: self.last_seq() + 1,
            event,
        };
        self.records.push(record.clone());
        record
    }

    pub fn records(&self) -> &[HistoryRecord] {
        &self.records
    }

    pub fn read_all(&self) -> Vec<HistoryRecord> {
        self.records.clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.records.iter().map(|r| r.event.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The `ExecutionStarted` header, if the log has one at its head.
    pub fn header(&self) -> Option<(&str, &str)> {
        match self.records.first().map(|r| &r.event) {
            Some(Event::ExecutionStarted { name, input }) => Some((name, input)),
            _ => None,
        }
    }

    /// Whether a completion, failure or fire is already recorded for `task_id`.
    pub fn is_resolved(&self, task_id: u64) -> bool {
        self.records.iter().any(|r| match &r.event {
            Event::TaskCompleted { task_id: id, .. }
            | Event::TaskFailed { task_id: id, .. }
            | Event::TimerFired { task_id: id, .. } => *id == task_id,
            _ => false,
        })
    }

    /// The recorded terminal event, if any.
    pub fn terminal(&self) -> Option<&Event> {
        self.records.iter().rev().map(|r| &r.event).find(|e| e.is_terminal())
    }
}
