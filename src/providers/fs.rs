use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::{fs, io::AsyncWriteExt};

use super::{HistoryStore, check_continuation};
use crate::HistoryRecord;

const DEFAULT_CAP: usize = 1024;
const EXT: &str = "jsonl";

/// Filesystem-backed history store writing one JSONL file per instance.
///
/// Lines that fail to parse are skipped on read, so a damaged file shows up
/// as a sequence gap when the engine rebuilds the instance.
#[derive(Clone)]
pub struct FsHistoryStore {
    dir: PathBuf,
    cap: usize,
}

fn io_err(e: std::io::Error) -> String {
    e.to_string()
}

// Instance ids may contain `:` and `/` (child ids look like `parent::sub::3`).
fn encode_id(instance: &str) -> String {
    instance.replace('%', "%25").replace(':', "%3A").replace('/', "%2F")
}

fn decode_id(stem: &str) -> String {
    stem.replace("%2F", "/").replace("%3A", ":").replace("%25", "%")
}

impl FsHistoryStore {
    /// Open a store under `dir`, wiping anything already there when `fresh`.
    pub fn new(dir: impl AsRef<Path>, fresh: bool) -> Self {
        Self::new_with_cap(dir, fresh, DEFAULT_CAP)
    }

    /// Like [`FsHistoryStore::new`] with a per-instance record limit.
    pub fn new_with_cap(dir: impl AsRef<Path>, fresh: bool, cap: usize) -> Self {
        let dir = dir.as_ref().to_path_buf();
        if fresh {
            let _ = std::fs::remove_dir_all(&dir);
        }
        let _ = std::fs::create_dir_all(&dir);
        Self { dir, cap }
    }

    fn log_path(&self, instance: &str) -> PathBuf {
        self.dir.join(format!("{}.{EXT}", encode_id(instance)))
    }

    fn encode_batch(records: &[HistoryRecord]) -> Result<Vec<u8>, String> {
        let mut buf = Vec::new();
        for r in records {
            serde_json::to_writer(&mut buf, r).map_err(|e| e.to_string())?;
            buf.push(b'\n');
        }
        Ok(buf)
    }
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn read(&self, instance: &str) -> Vec<HistoryRecord> {
        let Ok(text) = fs::read_to_string(self.log_path(instance)).await else {
            return Vec::new();
        };
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    async fn append(&self, instance: &str, records: Vec<HistoryRecord>) -> Result<(), String> {
        if !self.exists(instance).await {
            return Err(format!("instance not found: {instance}"));
        }
        let stored = self.read(instance).await;
        let total = stored.len() + records.len();
        if total > self.cap {
            return Err(format!(
                "history cap exceeded (cap={}, have={}, append={})",
                self.cap,
                stored.len(),
                records.len()
            ));
        }
        check_continuation(stored.last().map_or(0, |r| r.seq), &records)?;

        let bytes = Self::encode_batch(&records)?;
        let mut log = fs::OpenOptions::new()
            .append(true)
            .open(self.log_path(instance))
            .await
            .map_err(io_err)?;
        log.write_all(&bytes).await.map_err(io_err)?;
        log.flush().await.map_err(io_err)
    }

    async fn create_instance(&self, instance: &str) -> Result<(), String> {
        fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        let created = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.log_path(instance))
            .await;
        match created {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(format!("instance already exists: {instance}"))
            }
            Err(e) => Err(io_err(e)),
        }
    }

    async fn list_instances(&self) -> Vec<String> {
        let mut ids = Vec::new();
        let Ok(mut entries) = fs::read_dir(&self.dir).await else {
            return ids;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(decode_id(stem));
            }
        }
        ids.sort();
        ids
    }

    async fn exists(&self, instance: &str) -> bool {
        fs::try_exists(self.log_path(instance)).await.unwrap_or(false)
    }
}
