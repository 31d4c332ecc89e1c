use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::client::storage::ExamBackup;
use crate::dto::attempt_dto::{AttemptView, TimerState};
use crate::models::attempt::{AnswerMap, AttemptStatus, ExamState, FlagMap, RetakeStatus};
use crate::models::event::{EventKind, ProgressEvent};
use crate::utils::time::remaining_seconds;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExamPhase {
    Loading,
    Ready,
    Running,
    Bridging,
    Finished,
}

/// Everything the exam UI renders from. One immutable value per update;
/// subscribers see each published snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamSnapshot {
    pub attempt_id: Option<Uuid>,
    pub phase: ExamPhase,
    pub current_subtest: i32,
    pub current_question_index: i32,
    pub answers: AnswerMap,
    pub flags: FlagMap,
    pub subtest_deadline_at: Option<DateTime<Utc>>,
    pub seconds_remaining: i64,
    /// Server-side `updated_at` of the state this snapshot was hydrated
    /// from; restore uses it to rank against local backups.
    pub updated_at: Option<DateTime<Utc>>,
}

impl ExamSnapshot {
    pub fn empty() -> Self {
        Self {
            attempt_id: None,
            phase: ExamPhase::Loading,
            current_subtest: 0,
            current_question_index: 0,
            answers: AnswerMap::new(),
            flags: FlagMap::new(),
            subtest_deadline_at: None,
            seconds_remaining: 0,
            updated_at: None,
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.phase, ExamPhase::Running | ExamPhase::Bridging)
    }

    pub fn to_backup(&self, now: DateTime<Utc>) -> Option<ExamBackup> {
        let attempt_id = self.attempt_id?;
        if !self.is_live() {
            return None;
        }
        Some(ExamBackup {
            attempt_id,
            answers: self.answers.clone(),
            flags: self.flags.clone(),
            current_subtest: self.current_subtest,
            current_question_index: self.current_question_index,
            exam_state: match self.phase {
                ExamPhase::Bridging => ExamState::Bridging,
                _ => ExamState::Running,
            },
            saved_at: now,
        })
    }

    /// Replay one queued event onto the local maps, unconditionally: the
    /// log is the user's own ordered history, so later entries always win.
    pub fn apply_event(&mut self, event: &ProgressEvent) {
        match event.kind {
            EventKind::Answer => {
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
            EventKind::Flag => {
                self.flags
                    .entry(event.subtest_id)
                    .or_default()
                    .insert(event.question_id, event.flagged.unwrap_or(false));
            }
        }
    }
}

/// Hydrate a snapshot from a server response. The active track's state
/// becomes the local state wholesale.
pub fn snapshot_from_server(attempt: &AttemptView, timer: &TimerState) -> ExamSnapshot {
    let track = attempt.active_track_view();
    ExamSnapshot {
        attempt_id: Some(attempt.id),
        phase: phase_for(attempt),
        current_subtest: track.current_subtest,
        current_question_index: track.current_question_index,
        answers: track.answers.clone(),
        flags: track.flags.clone(),
        subtest_deadline_at: Some(timer.subtest_deadline_at),
        seconds_remaining: timer.seconds_remaining,
        updated_at: Some(attempt.updated_at),
    }
}

fn phase_for(attempt: &AttemptView) -> ExamPhase {
    let live = attempt.status == AttemptStatus::Started
        || attempt.retake_status == RetakeStatus::Running;
    if live {
        return match attempt.active_track_view().exam_state {
            ExamState::Running => ExamPhase::Running,
            ExamState::Bridging => ExamPhase::Bridging,
        };
    }
    // A completed primary with retake credit left renders the intro screen
    // for a fresh pass, not the results screen.
    let retake_open = attempt.status == AttemptStatus::Completed
        && attempt.allow_retake
        && attempt.retake_count < attempt.max_retake
        && attempt.retake_status == RetakeStatus::NotStarted;
    if retake_open {
        ExamPhase::Ready
    } else {
        ExamPhase::Finished
    }
}

#[derive(Debug, Clone)]
pub enum ExamAction {
    /// Replace local state with a hydrated snapshot (restore, start).
    Hydrate(ExamSnapshot),
    SelectAnswer {
        subtest_id: Uuid,
        question_id: Uuid,
        answer_id: Option<Uuid>,
    },
    SetFlag {
        subtest_id: Uuid,
        question_id: Uuid,
        flagged: bool,
    },
    Navigate {
        question_index: i32,
    },
    /// Adopt the server's timing after a sync round trip. Local answers are
    /// left alone; they are never behind the server on this device.
    SyncTimer {
        subtest_deadline_at: DateTime<Utc>,
        seconds_remaining: i64,
        updated_at: DateTime<Utc>,
    },
    /// Recompute the countdown from the deadline.
    Tick {
        now: DateTime<Utc>,
    },
    BeginBridging,
    /// Enter the next subtest after the server confirmed the advance.
    EnterSubtest {
        subtest_index: i32,
    },
    Finish,
}

/// Watch-channel-backed state container. `dispatch` applies an action and
/// publishes the result to every subscriber.
pub struct ExamStateStore {
    tx: watch::Sender<ExamSnapshot>,
}

impl Default for ExamStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExamStateStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ExamSnapshot::empty());
        Self { tx }
    }

    pub fn snapshot(&self) -> ExamSnapshot {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ExamSnapshot> {
        self.tx.subscribe()
    }

    pub fn dispatch(&self, action: ExamAction) -> ExamSnapshot {
        let mut next = self.tx.borrow().clone();
        reduce(&mut next, action);
        self.tx.send_replace(next.clone());
        next
    }
}

fn reduce(snapshot: &mut ExamSnapshot, action: ExamAction) {
    match action {
        ExamAction::Hydrate(hydrated) => *snapshot = hydrated,
        ExamAction::SelectAnswer {
            subtest_id,
            question_id,
            answer_id,
        } => {
            let per_subtest = snapshot.answers.entry(subtest_id).or_default();
            match answer_id {
                Some(answer_id) => {
                    per_subtest.insert(question_id, answer_id);
                }
                None => {
                    per_subtest.remove(&question_id);
                }
            }
        }
        ExamAction::SetFlag {
            subtest_id,
            question_id,
            flagged,
        } => {
            snapshot
                .flags
                .entry(subtest_id)
                .or_default()
                .insert(question_id, flagged);
        }
        ExamAction::Navigate { question_index } => {
            snapshot.current_question_index = question_index.max(0);
        }
        ExamAction::SyncTimer {
            subtest_deadline_at,
            seconds_remaining,
            updated_at,
        } => {
            snapshot.subtest_deadline_at = Some(subtest_deadline_at);
            snapshot.seconds_remaining = seconds_remaining;
            snapshot.updated_at = Some(updated_at);
        }
        ExamAction::Tick { now } => {
            if let Some(deadline) = snapshot.subtest_deadline_at {
                snapshot.seconds_remaining = remaining_seconds(deadline, now);
            }
        }
        ExamAction::BeginBridging => {
            if snapshot.phase == ExamPhase::Running {
                snapshot.phase = ExamPhase::Bridging;
            }
        }
        ExamAction::EnterSubtest { subtest_index } => {
            snapshot.current_subtest = subtest_index.max(0);
            snapshot.current_question_index = 0;
            snapshot.phase = ExamPhase::Running;
        }
        ExamAction::Finish => {
            snapshot.phase = ExamPhase::Finished;
            snapshot.seconds_remaining = 0;
        }
    }
}
