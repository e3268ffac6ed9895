use std::collections::HashMap;

use tokio::sync::Mutex;

use super::{HistoryStore, check_continuation};
use crate::HistoryRecord;

const CAP: usize = 1024;

#[derive(Default)]
pub struct InMemoryHistoryStore {
    inner: Mutex<HashMap<String, Vec<HistoryRecord>>>,
}

#[async_trait::async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn read(&self, instance: &str) -> Vec<HistoryRecord> {
        self.inner.lock().await.get(instance).cloned().unwrap_or_default()
    }

    async fn append(&self, instance: &str, records: Vec<HistoryRecord>) -> Result<(), String> {
        let mut g = self.inner.lock().await;
        let hist = g
            .get_mut(instance)
            .ok_or_else(|| format!("instance not found: {instance}"))?;
        if hist.len() + records.len() > CAP {
            return Err(format!(
                "history cap exceeded (cap={CAP}, have={}, append={})",
                hist.len(),
                records.len()
            ));
        }
        check_continuation(hist.last().map_or(0, |r| r.seq), &records)?;
        hist.extend(records);
        Ok(())
    }

    async fn create_instance(&self, instance: &str) -> Result<(), String> {
        let mut g = self.inner.lock().await;
        if g.contains_key(instance) {
            return Err(format!("instance already exists: {instance}"));
        }
        g.insert(instance.to_string(), Vec::new());
        Ok(())
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn exists(&self, instance: &str) -> bool {
        self.inner.lock().await.contains_key(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Event;

    fn rec(seq: u64, timestamp: u64) -> HistoryRecord {
        HistoryRecord {
            seq,
            event: Event::OrchestratorStarted { timestamp },
        }
    }

    #[tokio::test]
    async fn append_requires_instance_and_continuous_sequence() {
        let store = InMemoryHistoryStore::default();
        assert!(store.append("i", vec![rec(1, 0)]).await.is_err());

        store.create_instance("i").await.unwrap();
        assert!(store.create_instance("i").await.is_err());
        store.append("i", vec![rec(1, 0), rec(2, 5)]).await.unwrap();
        let err = store.append("i", vec![rec(4, 9)]).await.unwrap_err();
        assert!(err.contains("expected seq 3"));
        assert_eq!(store.read("i").await.len(), 2);
        assert!(store.exists("i").await);
    }
}
