use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Answer,
    Flag,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Answer => "answer",
            EventKind::Flag => "flag",
        }
    }
}

/// One locally-queued answer/flag mutation. `revision` is a client-local
/// counter, strictly increasing per (kind, subtest, question) key; the
/// server discards events whose revision is not greater than the last one
/// it applied for that key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub id: Uuid,
    pub kind: EventKind,
    pub subtest_id: Uuid,
    pub question_id: Uuid,
    pub answer_id: Option<Uuid>,
    pub flagged: Option<bool>,
    pub revision: i64,
    pub client_ts: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn revision_key(&self) -> String {
        revision_key(self.kind, self.subtest_id, self.question_id)
    }
}

pub fn revision_key(kind: EventKind, subtest_id: Uuid, question_id: Uuid) -> String {
    format!("{}:{}:{}", kind.as_str(), subtest_id, question_id)
}

/// Replay order within a batch: client timestamp, then revision as the
/// tie-breaker for events stamped in the same millisecond.
pub fn sort_for_replay(events: &mut [ProgressEvent]) {
    events.sort_by(|a, b| {
        a.client_ts
            .cmp(&b.client_ts)
            .then_with(|| a.revision.cmp(&b.revision))
    });
}
