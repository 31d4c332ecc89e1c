use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::client::event_log::EventLog;
use crate::client::state::{ExamAction, ExamPhase, ExamStateStore};
use crate::client::storage::LocalStore;
use crate::dto::attempt_dto::{
    AttemptStateResponse, AttemptView, SaveProgressBatchRequest, SaveProgressBatchResponse,
    SaveProgressRequest, SubmitAttemptRequest, SubmitAttemptResponse, UpdatePlanRequest,
};
use crate::error::{Error, Result};
use crate::models::attempt::ExamState;

/// Quiet period after an edit before it is flushed, letting a burst of
/// answers ride in one batch.
pub const SYNC_DEBOUNCE: Duration = Duration::from_secs(4);
/// Steady-state cadence; doubles as the server heartbeat when the queue is
/// empty.
pub const SYNC_INTERVAL: Duration = Duration::from_secs(12);
pub const MAX_BATCH_EVENTS: usize = 50;
/// Delay after the nth consecutive failure; the last entry repeats.
pub const RETRY_SCHEDULE: [Duration; 5] = [
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(45),
    Duration::from_secs(120),
    Duration::from_secs(300),
];

/// Server calls the sync engine and restore flow need. Implemented over
/// HTTP for real clients and over an in-process service in tests.
#[async_trait]
pub trait AttemptApi: Send + Sync {
    async fn start_attempt(&self, tryout_id: Uuid) -> Result<AttemptStateResponse>;
    /// `None` when the user has no attempt on this tryout yet.
    async fn fetch_attempt(&self, tryout_id: Uuid) -> Result<Option<AttemptStateResponse>>;
    async fn save_progress(
        &self,
        attempt_id: Uuid,
        req: SaveProgressRequest,
    ) -> Result<AttemptStateResponse>;
    async fn save_batch(
        &self,
        attempt_id: Uuid,
        req: SaveProgressBatchRequest,
    ) -> Result<SaveProgressBatchResponse>;
    async fn submit_attempt(
        &self,
        attempt_id: Uuid,
        req: SubmitAttemptRequest,
    ) -> Result<SubmitAttemptResponse>;
    async fn update_plan(&self, attempt_id: Uuid, req: UpdatePlanRequest) -> Result<AttemptView>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Attempt is not in a live phase; nothing was sent.
    Idle,
    Sent { applied: usize, discarded: usize },
}

struct Backoff {
    consecutive_failures: u32,
    next_allowed: Option<tokio::time::Instant>,
}

/// Pushes the local event log to the server: debounced after edits, on an
/// interval as a heartbeat, with exponential backoff while the network is
/// down. Flushes are strictly serialized; there is never more than one
/// batch in flight.
pub struct SyncEngine {
    api: Arc<dyn AttemptApi>,
    log: Arc<EventLog>,
    state: Arc<ExamStateStore>,
    store: Arc<dyn LocalStore>,
    attempt_id: Uuid,
    flush_lock: Mutex<()>,
    dirty: Notify,
    backoff: std::sync::Mutex<Backoff>,
}

impl SyncEngine {
    pub fn new(
        api: Arc<dyn AttemptApi>,
        log: Arc<EventLog>,
        state: Arc<ExamStateStore>,
        store: Arc<dyn LocalStore>,
        attempt_id: Uuid,
    ) -> Self {
        Self {
            api,
            log,
            state,
            store,
            attempt_id,
            flush_lock: Mutex::new(()),
            dirty: Notify::new(),
            backoff: std::sync::Mutex::new(Backoff {
                consecutive_failures: 0,
                next_allowed: None,
            }),
        }
    }

    /// Record an answer locally (log + UI state) and schedule a flush.
    /// Returns immediately; delivery happens in the background.
    pub async fn record_answer(
        &self,
        subtest_id: Uuid,
        question_id: Uuid,
        answer_id: Option<Uuid>,
    ) -> Result<()> {
        self.log
            .record_answer(subtest_id, question_id, answer_id, Utc::now())
            .await?;
        self.state.dispatch(ExamAction::SelectAnswer {
            subtest_id,
            question_id,
            answer_id,
        });
        self.note_change();
        Ok(())
    }

    pub async fn record_flag(
        &self,
        subtest_id: Uuid,
        question_id: Uuid,
        flagged: bool,
    ) -> Result<()> {
        self.log
            .record_flag(subtest_id, question_id, flagged, Utc::now())
            .await?;
        self.state.dispatch(ExamAction::SetFlag {
            subtest_id,
            question_id,
            flagged,
        });
        self.note_change();
        Ok(())
    }

    /// Wake the run loop; the actual send happens after the debounce.
    pub fn note_change(&self) {
        self.dirty.notify_one();
    }

    /// One delivery round: claim a batch, send it, settle the outcome.
    /// An empty batch is still sent as a heartbeat.
    pub async fn flush(&self) -> Result<FlushOutcome> {
        let _guard = self.flush_lock.lock().await;

        let snapshot = self.state.snapshot();
        if !snapshot.is_live() {
            return Ok(FlushOutcome::Idle);
        }

        let events = self.log.take_batch(MAX_BATCH_EVENTS).await?;
        let ids: Vec<Uuid> = events.iter().map(|e| e.id).collect();
        let request = SaveProgressBatchRequest {
            batch_id: Uuid::new_v4(),
            events,
            current_subtest: Some(snapshot.current_subtest),
            current_question_index: Some(snapshot.current_question_index),
            exam_state: Some(match snapshot.phase {
                ExamPhase::Bridging => ExamState::Bridging,
                _ => ExamState::Running,
            }),
        };

        match self.api.save_batch(self.attempt_id, request).await {
            Ok(response) => {
                if response.duplicate {
                    // fresh uuids should never collide; requeue to be safe
                    self.log.nack(&ids).await?;
                } else {
                    self.log.ack(&ids).await?;
                }
                self.clear_backoff();
                self.state.dispatch(ExamAction::SyncTimer {
                    subtest_deadline_at: response.timer.subtest_deadline_at,
                    seconds_remaining: response.timer.seconds_remaining,
                    updated_at: response.attempt.updated_at,
                });
                Ok(FlushOutcome::Sent {
                    applied: response.applied,
                    discarded: response.discarded,
                })
            }
            Err(err) => {
                self.log.nack(&ids).await?;
                let delay = self.bump_backoff();
                if let Some(backup) = snapshot.to_backup(Utc::now()) {
                    if let Err(backup_err) = self.store.save_backup(&backup).await {
                        tracing::error!("Failed to write local backup: {}", backup_err);
                    }
                }
                tracing::warn!(
                    "Sync flush failed, next try in {:?} ({} events re-queued): {}",
                    delay,
                    ids.len(),
                    err
                );
                Err(err)
            }
        }
    }

    /// Backup to local storage first, then a best-effort flush. For moments
    /// when the process may not live much longer.
    pub async fn force_flush(&self) -> Result<FlushOutcome> {
        let snapshot = self.state.snapshot();
        if let Some(backup) = snapshot.to_backup(Utc::now()) {
            self.store.save_backup(&backup).await?;
        }
        self.flush().await
    }

    /// Whether the backoff gate allows a send right now.
    pub fn ready(&self) -> bool {
        let backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
        backoff
            .next_allowed
            .map_or(true, |at| tokio::time::Instant::now() >= at)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.backoff
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .consecutive_failures
    }

    fn bump_backoff(&self) -> Duration {
        let mut backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
        backoff.consecutive_failures += 1;
        let index = (backoff.consecutive_failures as usize - 1).min(RETRY_SCHEDULE.len() - 1);
        let delay = RETRY_SCHEDULE[index];
        backoff.next_allowed = Some(tokio::time::Instant::now() + delay);
        delay
    }

    fn clear_backoff(&self) {
        let mut backoff = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
        backoff.consecutive_failures = 0;
        backoff.next_allowed = None;
    }

    /// Drive the engine until `shutdown` flips to true (or its sender goes
    /// away), then make one final flush attempt.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(SYNC_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.dirty.notified() => {
                    tokio::time::sleep(SYNC_DEBOUNCE).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let _ = self.force_flush().await;
                        return;
                    }
                    continue;
                }
            }
            if !self.ready() {
                continue;
            }
            if let Err(err) = self.flush().await {
                tracing::debug!("Scheduled flush failed: {}", err);
            }
        }
    }
}

/// HTTP implementation of [`AttemptApi`] against the server in this crate.
pub struct HttpAttemptApi {
    http: reqwest::Client,
    base_url: String,
    bearer_token: String,
}

impl HttpAttemptApi {
    pub fn new(base_url: impl Into<String>, bearer_token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: bearer_token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        if !response.status().is_success() {
            return Err(decode_error(response).await);
        }
        Ok(response.json().await?)
    }
}

/// Map an error body back onto the crate's error type so client code can
/// branch on the same variants the server raised.
async fn decode_error(response: reqwest::Response) -> Error {
    let status = response.status().as_u16();
    let body: JsonValue = response.json().await.unwrap_or(JsonValue::Null);
    let code = body.get("error").and_then(|v| v.as_str()).unwrap_or("");
    let message = body
        .get("message")
        .and_then(|v| v.as_str())
        .unwrap_or("Request failed")
        .to_string();
    match (status, code) {
        (400, _) => Error::BadRequest(message),
        (401, _) => Error::Unauthorized(message),
        (403, "tryout_closed") => Error::Scheduling(message),
        (403, _) => Error::Forbidden(message),
        (404, _) => Error::NotFound(message),
        (409, "deadline_not_elapsed") => Error::PrematureSubmit {
            seconds_remaining: body
                .get("seconds_remaining")
                .and_then(|v| v.as_i64())
                .unwrap_or(0),
        },
        (409, _) => Error::MalformedTimer(message),
        _ => Error::Internal(message),
    }
}

#[async_trait]
impl AttemptApi for HttpAttemptApi {
    async fn start_attempt(&self, tryout_id: Uuid) -> Result<AttemptStateResponse> {
        let response = self
            .http
            .post(self.url(&format!("/api/tryouts/{tryout_id}/attempts")))
            .bearer_auth(&self.bearer_token)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn fetch_attempt(&self, tryout_id: Uuid) -> Result<Option<AttemptStateResponse>> {
        let response = self
            .http
            .get(self.url(&format!("/api/tryouts/{tryout_id}/attempt")))
            .bearer_auth(&self.bearer_token)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::decode(response).await?))
    }

    async fn save_progress(
        &self,
        attempt_id: Uuid,
        req: SaveProgressRequest,
    ) -> Result<AttemptStateResponse> {
        let response = self
            .http
            .patch(self.url(&format!("/api/attempts/{attempt_id}/progress")))
            .bearer_auth(&self.bearer_token)
            .json(&req)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn save_batch(
        &self,
        attempt_id: Uuid,
        req: SaveProgressBatchRequest,
    ) -> Result<SaveProgressBatchResponse> {
        let response = self
            .http
            .post(self.url(&format!("/api/attempts/{attempt_id}/progress/batch")))
            .bearer_auth(&self.bearer_token)
            .json(&req)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn submit_attempt(
        &self,
        attempt_id: Uuid,
        req: SubmitAttemptRequest,
    ) -> Result<SubmitAttemptResponse> {
        let response = self
            .http
            .post(self.url(&format!("/api/attempts/{attempt_id}/submit")))
            .bearer_auth(&self.bearer_token)
            .json(&req)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn update_plan(&self, attempt_id: Uuid, req: UpdatePlanRequest) -> Result<AttemptView> {
        let response = self
            .http
            .patch(self.url(&format!("/api/attempts/{attempt_id}/plan")))
            .bearer_auth(&self.bearer_token)
            .json(&req)
            .send()
            .await?;
        Self::decode(response).await
    }
}
