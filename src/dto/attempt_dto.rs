use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::attempt::{
    AnswerMap, AttemptStatus, AttemptTrack, ExamState, FlagMap, ResultPlan, RetakeStatus,
    ScoreReport, TrackId, TryoutAttempt,
};
use crate::models::event::ProgressEvent;
use crate::services::timer::TimerWindow;

/// Legacy whole-state save. Newer clients send event batches instead; this
/// shape stays accepted for clients that predate the event log.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SaveProgressRequest {
    pub answers: Option<AnswerMap>,
    pub flags: Option<FlagMap>,
    pub current_subtest: Option<i32>,
    pub current_question_index: Option<i32>,
    pub exam_state: Option<ExamState>,
    /// Countdown as the legacy client displayed it. Only trusted to seed a
    /// fresh window while the server has no deadline for this subtest yet.
    pub seconds_remaining: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SaveProgressBatchRequest {
    /// Client-generated id; replays inside the dedup window return the
    /// current state instead of reapplying.
    pub batch_id: Uuid,
    /// Empty batches are valid heartbeats.
    #[validate(length(max = 500, message = "Too many events in one batch"))]
    pub events: Vec<ProgressEvent>,
    pub current_subtest: Option<i32>,
    pub current_question_index: Option<i32>,
    pub exam_state: Option<ExamState>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SubmitAttemptRequest {
    /// Final whole-state answers from the submitting client, merged over the
    /// persisted map before grading. Absent for pure server-state submits.
    pub answers: Option<AnswerMap>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct UpdatePlanRequest {
    pub plan: ResultPlan,
}

/// The authoritative timing triplet clients render their countdown from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerState {
    pub subtest_started_at: DateTime<Utc>,
    pub subtest_deadline_at: DateTime<Utc>,
    pub seconds_remaining: i64,
    /// Server clock at response time, for client-side skew estimation.
    pub server_now: DateTime<Utc>,
}

impl TimerState {
    pub fn from_window(window: &TimerWindow, now: DateTime<Utc>) -> Self {
        Self {
            subtest_started_at: window.subtest_started_at,
            subtest_deadline_at: window.subtest_deadline_at,
            seconds_remaining: window.seconds_remaining,
            server_now: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackView {
    pub answers: AnswerMap,
    pub flags: FlagMap,
    pub current_subtest: i32,
    pub current_question_index: i32,
    pub subtest_started_at: Option<DateTime<Utc>>,
    pub subtest_deadline_at: Option<DateTime<Utc>>,
    pub exam_state: ExamState,
    /// Last applied revision per event key, so reconnecting clients can seed
    /// their counters above anything the server has already accepted.
    pub event_revisions: HashMap<String, i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub score: Option<ScoreReport>,
}

impl TrackView {
    /// `completed` guards the score: grading details never leave the server
    /// for a pass that is still running.
    fn from_track(track: &AttemptTrack, completed: bool) -> Self {
        Self {
            answers: track.answers.clone(),
            flags: track.flags.clone(),
            current_subtest: track.current_subtest,
            current_question_index: track.current_question_index,
            subtest_started_at: track.subtest_started_at,
            subtest_deadline_at: track.subtest_deadline_at,
            exam_state: track.exam_state,
            event_revisions: track.event_revisions.clone(),
            started_at: track.started_at,
            completed_at: track.completed_at,
            score: if completed { track.score.clone() } else { None },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptView {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tryout_id: Uuid,
    pub status: AttemptStatus,
    pub active_track: TrackId,
    pub primary: TrackView,
    pub retake: Option<TrackView>,
    pub retake_status: RetakeStatus,
    pub retake_count: i32,
    pub max_retake: i32,
    pub allow_retake: bool,
    pub result_plan: ResultPlan,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AttemptView {
    pub fn active_track_view(&self) -> &TrackView {
        match self.active_track {
            TrackId::Primary => &self.primary,
            TrackId::Retake => self.retake.as_ref().unwrap_or(&self.primary),
        }
    }

    pub fn from_attempt(attempt: &TryoutAttempt) -> Self {
        Self {
            id: attempt.id,
            user_id: attempt.user_id,
            tryout_id: attempt.tryout_id,
            status: attempt.status,
            active_track: attempt.active_track_id(),
            primary: TrackView::from_track(&attempt.primary, attempt.status == AttemptStatus::Completed),
            retake: attempt.retake.as_ref().map(|track| {
                TrackView::from_track(track, attempt.retake_status == RetakeStatus::Completed)
            }),
            retake_status: attempt.retake_status,
            retake_count: attempt.retake_count,
            max_retake: attempt.max_retake,
            allow_retake: attempt.allow_retake,
            result_plan: attempt.result_plan,
            created_at: attempt.created_at,
            updated_at: attempt.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptStateResponse {
    pub attempt: AttemptView,
    pub timer: TimerState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveProgressBatchResponse {
    pub attempt: AttemptView,
    pub timer: TimerState,
    /// The batch id was already processed; state was returned, not mutated.
    pub duplicate: bool,
    /// Events that mutated the track.
    pub applied: usize,
    /// Events discarded by the per-question revision gate.
    pub discarded: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitAttemptResponse {
    pub attempt: AttemptView,
    /// Present when this submit completed a pass; absent when it only closed
    /// an intermediate subtest.
    pub score: Option<ScoreReport>,
}
