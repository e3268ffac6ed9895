use crate::HistoryRecord;

/// Storage abstraction for append-only, sequenced history per instance.
///
/// Stores keep records exactly as given. They reject an append whose first
/// sequence number does not continue the stored history, but the engine
/// re-validates every record through [`crate::HistoryLog`] on rehydration.
#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// Read full history for an instance; empty when the instance is unknown.
    async fn read(&self, instance: &str) -> Vec<HistoryRecord>;
    /// Append records; fails if the instance is missing, the sequence does
    /// not continue, or provider limits would be exceeded.
    async fn append(&self, instance: &str, records: Vec<HistoryRecord>) -> Result<(), String>;
    /// Create a new, empty instance. Fails if it already exists.
    async fn create_instance(&self, instance: &str) -> Result<(), String>;
    /// Enumerate known instances, sorted.
    async fn list_instances(&self) -> Vec<String>;

    async fn exists(&self, instance: &str) -> bool {
        self.list_instances().await.iter().any(|i| i == instance)
    }
}

// Shared append precondition: the batch must continue the stored sequence
// and stay consecutive within itself.
pub(crate) fn check_continuation(last_seq: u64, records: &[HistoryRecord]) -> Result<(), String> {
    let mut expected = last_seq + 1;
    for r in records {
        if r.seq != expected {
            return Err(format!("out-of-order append: expected seq {expected}, got {}", r.seq));
        }
        expected += 1;
    }
    Ok(())
}

/// In-memory provider for tests.
pub mod in_memory;
/// Filesystem-backed provider for local development.
pub mod fs;
