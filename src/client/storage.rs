use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use uuid::Uuid;

use crate::error::Result;
use crate::models::attempt::{AnswerMap, ExamState, FlagMap};
use crate::models::event::ProgressEvent;

/// Delivery state of a locally recorded event.
///
/// `Sent` marks an event as in flight; if the process dies before the
/// acknowledgment lands, reopening the log demotes it to `Failed` and the
/// server's revision gate makes the redelivery harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event: ProgressEvent,
    pub status: EventStatus,
}

/// Whole-state backup written before the client risks losing its session
/// (failed sync, tab close). Competes with server state at restore time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamBackup {
    pub attempt_id: Uuid,
    pub answers: AnswerMap,
    pub flags: FlagMap,
    pub current_subtest: i32,
    pub current_question_index: i32,
    pub exam_state: ExamState,
    pub saved_at: DateTime<Utc>,
}

/// Durable client-side storage for the event log and the state backup.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn load_events(&self) -> Result<Vec<StoredEvent>>;
    async fn save_events(&self, events: &[StoredEvent]) -> Result<()>;
    async fn load_backup(&self) -> Result<Option<ExamBackup>>;
    async fn save_backup(&self, backup: &ExamBackup) -> Result<()>;
    async fn clear(&self) -> Result<()>;
}

/// Volatile store for tests and platforms without usable disk.
#[derive(Default)]
pub struct MemoryStore {
    events: Mutex<Vec<StoredEvent>>,
    backup: Mutex<Option<ExamBackup>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn load_events(&self) -> Result<Vec<StoredEvent>> {
        Ok(self.events.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn save_events(&self, events: &[StoredEvent]) -> Result<()> {
        *self.events.lock().unwrap_or_else(|e| e.into_inner()) = events.to_vec();
        Ok(())
    }

    async fn load_backup(&self) -> Result<Option<ExamBackup>> {
        Ok(self.backup.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    async fn save_backup(&self, backup: &ExamBackup) -> Result<()> {
        *self.backup.lock().unwrap_or_else(|e| e.into_inner()) = Some(backup.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
        *self.backup.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}

/// File-backed store: one directory, `events.json` and `backup.json`,
/// written via temp file + rename so a crash never leaves a torn file.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn events_path(&self) -> PathBuf {
        self.dir.join("events.json")
    }

    fn backup_path(&self) -> PathBuf {
        self.dir.join("backup.json")
    }

    async fn write_atomic(&self, path: &Path, bytes: Vec<u8>) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, path).await?;
        Ok(())
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl LocalStore for FileStore {
    async fn load_events(&self) -> Result<Vec<StoredEvent>> {
        Ok(read_json(&self.events_path()).await?.unwrap_or_default())
    }

    async fn save_events(&self, events: &[StoredEvent]) -> Result<()> {
        self.write_atomic(&self.events_path(), serde_json::to_vec(events)?)
            .await
    }

    async fn load_backup(&self) -> Result<Option<ExamBackup>> {
        read_json(&self.backup_path()).await
    }

    async fn save_backup(&self, backup: &ExamBackup) -> Result<()> {
        self.write_atomic(&self.backup_path(), serde_json::to_vec(backup)?)
            .await
    }

    async fn clear(&self) -> Result<()> {
        for path in [self.events_path(), self.backup_path()] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }
}
