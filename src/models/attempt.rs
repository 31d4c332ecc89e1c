use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::event::ProgressEvent;

/// subtest id -> question id -> selected option id
pub type AnswerMap = HashMap<Uuid, HashMap<Uuid, Uuid>>;
/// subtest id -> question id -> marked-for-review
pub type FlagMap = HashMap<Uuid, HashMap<Uuid, bool>>;

/// Duplicate batch ids are only recognized inside this window; older ids
/// fall out and a very late replay is reprocessed, relying on per-event
/// revision checks to stay harmless.
pub const PROCESSED_BATCH_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Started,
    Completed,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Started => "started",
            AttemptStatus::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "started" => Some(AttemptStatus::Started),
            "completed" => Some(AttemptStatus::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetakeStatus {
    NotStarted,
    Running,
    Completed,
}

impl RetakeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetakeStatus::NotStarted => "not_started",
            RetakeStatus::Running => "running",
            RetakeStatus::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "not_started" => Some(RetakeStatus::NotStarted),
            "running" => Some(RetakeStatus::Running),
            "completed" => Some(RetakeStatus::Completed),
            _ => None,
        }
    }
}

/// `Bridging` is the rest interval between finishing one subtest and
/// starting the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExamState {
    Running,
    Bridging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtestState {
    Running,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultPlan {
    None,
    Free,
    Paid,
}

impl ResultPlan {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultPlan::None => "none",
            ResultPlan::Free => "free",
            ResultPlan::Paid => "paid",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "none" => Some(ResultPlan::None),
            "free" => Some(ResultPlan::Free),
            "paid" => Some(ResultPlan::Paid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackId {
    Primary,
    Retake,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtestSnapshot {
    pub subtest_id: Uuid,
    pub subtest_index: i32,
    pub taken_at: DateTime<Utc>,
    pub answers: HashMap<Uuid, Uuid>,
    pub flags: HashMap<Uuid, bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionResult {
    pub subtest_id: Uuid,
    pub question_id: Uuid,
    pub number: i32,
    pub selected_label: Option<String>,
    pub correct_label: Option<String>,
    pub is_correct: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreReport {
    pub score: i32,
    pub correct_answers_count: i32,
    pub total_questions_count: i32,
    pub question_results: Vec<QuestionResult>,
}

/// One pass over the tryout's subtests. The primary attempt and the retake
/// use the same record; all timer and advance logic operates on a track
/// without knowing which one it is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptTrack {
    #[serde(default)]
    pub answers: AnswerMap,
    #[serde(default)]
    pub flags: FlagMap,
    pub current_subtest: i32,
    pub current_question_index: i32,
    pub subtest_started_at: Option<DateTime<Utc>>,
    pub subtest_deadline_at: Option<DateTime<Utc>>,
    /// Legacy cache of the last computed countdown, kept for pre-deadline
    /// clients; never used for deadline math once a deadline exists.
    pub seconds_remaining: Option<i64>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub exam_state: ExamState,
    #[serde(default)]
    pub processed_batch_ids: VecDeque<Uuid>,
    #[serde(default)]
    pub event_revisions: HashMap<String, i64>,
    #[serde(default)]
    pub subtest_states: HashMap<Uuid, SubtestState>,
    #[serde(default)]
    pub subtest_snapshots: Vec<SubtestSnapshot>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub score: Option<ScoreReport>,
}

impl AttemptTrack {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            answers: AnswerMap::new(),
            flags: FlagMap::new(),
            current_subtest: 0,
            current_question_index: 0,
            subtest_started_at: None,
            subtest_deadline_at: None,
            seconds_remaining: None,
            heartbeat_at: Some(now),
            exam_state: ExamState::Running,
            processed_batch_ids: VecDeque::new(),
            event_revisions: HashMap::new(),
            subtest_states: HashMap::new(),
            subtest_snapshots: Vec::new(),
            started_at: Some(now),
            completed_at: None,
            score: None,
        }
    }

    /// A fresh retake pass: prior answers/flags carry over as the baseline,
    /// everything else (timing, idempotency bookkeeping, snapshots, score)
    /// starts clean at subtest 0.
    pub fn retake_from(baseline: &AttemptTrack, now: DateTime<Utc>) -> Self {
        Self {
            answers: baseline.answers.clone(),
            flags: baseline.flags.clone(),
            ..AttemptTrack::new(now)
        }
    }

    pub fn has_batch(&self, batch_id: Uuid) -> bool {
        self.processed_batch_ids.contains(&batch_id)
    }

    pub fn record_batch(&mut self, batch_id: Uuid) {
        self.processed_batch_ids.push_back(batch_id);
        while self.processed_batch_ids.len() > PROCESSED_BATCH_WINDOW {
            self.processed_batch_ids.pop_front();
        }
    }

    pub fn last_revision(&self, key: &str) -> i64 {
        self.event_revisions.get(key).copied().unwrap_or(0)
    }

    /// Applies one event if its revision is strictly greater than the last
    /// applied revision for its key. Returns whether it mutated the track.
    pub fn apply_event(&mut self, event: &ProgressEvent) -> bool {
        let key = event.revision_key();
        if event.revision <= self.last_revision(&key) {
            return false;
        }
        match event.kind {
            crate::models::event::EventKind::Answer => {
                let per_subtest = self.answers.entry(event.subtest_id).or_default();
                match event.answer_id {
                    Some(answer_id) => {
                        per_subtest.insert(event.question_id, answer_id);
                    }
                    None => {
                        per_subtest.remove(&event.question_id);
                    }
                }
            }
            crate::models::event::EventKind::Flag => {
                self.flags
                    .entry(event.subtest_id)
                    .or_default()
                    .insert(event.question_id, event.flagged.unwrap_or(false));
            }
        }
        self.event_revisions.insert(key, event.revision);
        true
    }

    pub fn capture_snapshot(&mut self, subtest_id: Uuid, subtest_index: i32, now: DateTime<Utc>) {
        let answers = self.answers.get(&subtest_id).cloned().unwrap_or_default();
        let flags = self.flags.get(&subtest_id).cloned().unwrap_or_default();
        self.subtest_snapshots.push(SubtestSnapshot {
            subtest_id,
            subtest_index,
            taken_at: now,
            answers,
            flags,
        });
    }

    pub fn has_any_answers(&self) -> bool {
        self.answers.values().any(|per_subtest| !per_subtest.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TryoutAttempt {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tryout_id: Uuid,
    pub status: AttemptStatus,
    pub primary: AttemptTrack,
    pub retake: Option<AttemptTrack>,
    pub retake_status: RetakeStatus,
    pub retake_count: i32,
    pub max_retake: i32,
    pub allow_retake: bool,
    pub result_plan: ResultPlan,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryoutAttempt {
    pub fn new(user_id: Uuid, tryout_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            tryout_id,
            status: AttemptStatus::Started,
            primary: AttemptTrack::new(now),
            retake: None,
            retake_status: RetakeStatus::NotStarted,
            retake_count: 0,
            max_retake: 1,
            allow_retake: false,
            result_plan: ResultPlan::None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The track currently accepting mutations: the retake while it runs,
    /// otherwise the primary pass.
    pub fn active_track_id(&self) -> TrackId {
        if self.retake_status == RetakeStatus::Running && self.retake.is_some() {
            TrackId::Retake
        } else {
            TrackId::Primary
        }
    }

    pub fn track(&self, id: TrackId) -> Option<&AttemptTrack> {
        match id {
            TrackId::Primary => Some(&self.primary),
            TrackId::Retake => self.retake.as_ref(),
        }
    }

    pub fn track_mut(&mut self, id: TrackId) -> Option<&mut AttemptTrack> {
        match id {
            TrackId::Primary => Some(&mut self.primary),
            TrackId::Retake => self.retake.as_mut(),
        }
    }

    pub fn active_track(&self) -> &AttemptTrack {
        match self.active_track_id() {
            TrackId::Primary => &self.primary,
            TrackId::Retake => self.retake.as_ref().expect("retake running without track"),
        }
    }

    pub fn active_track_mut(&mut self) -> &mut AttemptTrack {
        match self.active_track_id() {
            TrackId::Primary => &mut self.primary,
            TrackId::Retake => self.retake.as_mut().expect("retake running without track"),
        }
    }

    pub fn retake_available(&self) -> bool {
        self.allow_retake && self.retake_count < self.max_retake
    }

    /// Whether any pass is still accepting progress.
    pub fn is_live(&self) -> bool {
        self.status == AttemptStatus::Started || self.retake_status == RetakeStatus::Running
    }
}
