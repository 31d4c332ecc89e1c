use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Tryout {
    pub id: Uuid,
    pub title: String,
    pub date_open: DateTime<Utc>,
    pub date_close: DateTime<Utc>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Tryout {
    /// Attempts are only mutable strictly inside [date_open, date_close].
    pub fn window_contains(&self, now: DateTime<Utc>) -> bool {
        self.date_open <= now && now <= self.date_close
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtest {
    pub id: Uuid,
    pub tryout_id: Uuid,
    pub name: String,
    pub position: i32,
    pub duration_minutes: i32,
    pub questions: Vec<Question>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: Uuid,
    pub text: String,
    pub options: Vec<AnswerOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerOption {
    pub id: Uuid,
    pub text: String,
    #[serde(default)]
    pub is_correct: bool,
}
