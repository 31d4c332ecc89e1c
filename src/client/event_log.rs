use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::client::storage::{EventStatus, LocalStore, StoredEvent};
use crate::error::Result;
use crate::models::event::{revision_key, sort_for_replay, EventKind, ProgressEvent};

struct LogInner {
    entries: Vec<StoredEvent>,
    /// Highest revision handed out (or seen from the server) per event key.
    revisions: HashMap<String, i64>,
}

/// Durable, ordered log of the user's answer and flag actions.
///
/// Works as a claim/ack queue: `take_batch` claims events for a delivery
/// attempt, `ack` retires them, `nack` re-queues them. Every mutation is
/// persisted before it is reported back, so a crash at any point loses at
/// most nothing and duplicates at most one in-flight batch.
pub struct EventLog {
    store: Arc<dyn LocalStore>,
    inner: Mutex<LogInner>,
}

impl EventLog {
    /// Reopen the log from storage. Events that were in flight when the
    /// process died come back as `Failed` so they get retried.
    pub async fn open(store: Arc<dyn LocalStore>) -> Result<Self> {
        let mut entries = store.load_events().await?;
        let mut revisions: HashMap<String, i64> = HashMap::new();
        let mut recovered = 0;
        for stored in entries.iter_mut() {
            if stored.status == EventStatus::Sent {
                stored.status = EventStatus::Failed;
                recovered += 1;
            }
            let key = stored.event.revision_key();
            let highest = revisions.entry(key).or_insert(0);
            *highest = (*highest).max(stored.event.revision);
        }
        if recovered > 0 {
            tracing::info!("Recovered {} in-flight events for redelivery", recovered);
            store.save_events(&entries).await?;
        }
        Ok(Self {
            store,
            inner: Mutex::new(LogInner { entries, revisions }),
        })
    }

    /// Raise revision counters to at least what the server has already
    /// accepted, so everything recorded from here on outranks it. Never
    /// lowers a counter.
    pub async fn seed_revisions(&self, server: &HashMap<String, i64>) {
        let mut inner = self.inner.lock().await;
        for (key, revision) in server {
            let highest = inner.revisions.entry(key.clone()).or_insert(0);
            *highest = (*highest).max(*revision);
        }
    }

    pub async fn record_answer(
        &self,
        subtest_id: Uuid,
        question_id: Uuid,
        answer_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<ProgressEvent> {
        self.record(EventKind::Answer, subtest_id, question_id, answer_id, None, now)
            .await
    }

    pub async fn record_flag(
        &self,
        subtest_id: Uuid,
        question_id: Uuid,
        flagged: bool,
        now: DateTime<Utc>,
    ) -> Result<ProgressEvent> {
        self.record(EventKind::Flag, subtest_id, question_id, None, Some(flagged), now)
            .await
    }

    async fn record(
        &self,
        kind: EventKind,
        subtest_id: Uuid,
        question_id: Uuid,
        answer_id: Option<Uuid>,
        flagged: Option<bool>,
        now: DateTime<Utc>,
    ) -> Result<ProgressEvent> {
        let mut inner = self.inner.lock().await;
        let key = revision_key(kind, subtest_id, question_id);
        let next = inner.revisions.get(&key).copied().unwrap_or(0) + 1;
        inner.revisions.insert(key, next);
        let event = ProgressEvent {
            id: Uuid::new_v4(),
            kind,
            subtest_id,
            question_id,
            answer_id,
            flagged,
            revision: next,
            client_ts: now,
        };
        inner.entries.push(StoredEvent {
            event: event.clone(),
            status: EventStatus::Pending,
        });
        self.store.save_events(&inner.entries).await?;
        Ok(event)
    }

    /// Claim up to `limit` undelivered events, oldest first, marking them in
    /// flight. Failed events are retried alongside fresh ones.
    pub async fn take_batch(&self, limit: usize) -> Result<Vec<ProgressEvent>> {
        let mut inner = self.inner.lock().await;
        let mut batch: Vec<ProgressEvent> = inner
            .entries
            .iter()
            .filter(|s| s.status != EventStatus::Sent)
            .map(|s| s.event.clone())
            .collect();
        sort_for_replay(&mut batch);
        batch.truncate(limit);
        if batch.is_empty() {
            return Ok(batch);
        }

        let claimed: Vec<Uuid> = batch.iter().map(|e| e.id).collect();
        for stored in inner.entries.iter_mut() {
            if claimed.contains(&stored.event.id) {
                stored.status = EventStatus::Sent;
            }
        }
        self.store.save_events(&inner.entries).await?;
        Ok(batch)
    }

    /// Retire delivered events. Their revisions stay in the counters, so
    /// later edits of the same questions still get higher revisions.
    pub async fn ack(&self, ids: &[Uuid]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.entries.retain(|s| !ids.contains(&s.event.id));
        self.store.save_events(&inner.entries).await
    }

    /// Return claimed events to the queue after a failed delivery.
    pub async fn nack(&self, ids: &[Uuid]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for stored in inner.entries.iter_mut() {
            if ids.contains(&stored.event.id) {
                stored.status = EventStatus::Failed;
            }
        }
        self.store.save_events(&inner.entries).await
    }

    /// All undelivered events in replay order, without claiming them.
    pub async fn pending(&self) -> Vec<ProgressEvent> {
        let inner = self.inner.lock().await;
        let mut events: Vec<ProgressEvent> = inner
            .entries
            .iter()
            .filter(|s| s.status != EventStatus::Sent)
            .map(|s| s.event.clone())
            .collect();
        sort_for_replay(&mut events);
        events
    }

    pub async fn pending_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .filter(|s| s.status != EventStatus::Sent)
            .count()
    }

    /// Drop everything, typically after the attempt completed.
    pub async fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.entries.clear();
        inner.revisions.clear();
        self.store.save_events(&inner.entries).await
    }
}
