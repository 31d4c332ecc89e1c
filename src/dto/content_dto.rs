use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::tryout::{Subtest, Tryout};

/// Participant-facing tryout content. Built from the admin-side models with
/// answer keys stripped; nothing in this shape can leak correctness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TryoutView {
    pub id: Uuid,
    pub title: String,
    pub date_open: DateTime<Utc>,
    pub date_close: DateTime<Utc>,
    pub total_questions: usize,
    pub subtests: Vec<PublicSubtest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicSubtest {
    pub id: Uuid,
    pub name: String,
    pub position: i32,
    pub duration_minutes: i32,
    pub questions: Vec<PublicQuestion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicQuestion {
    pub id: Uuid,
    pub text: String,
    pub options: Vec<PublicOption>,
}

/// Deliberately has no correctness field at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicOption {
    pub id: Uuid,
    pub text: String,
}

impl TryoutView {
    pub fn build(tryout: &Tryout, subtests: &[Subtest]) -> Self {
        let public_subtests: Vec<PublicSubtest> = subtests
            .iter()
            .map(|subtest| PublicSubtest {
                id: subtest.id,
                name: subtest.name.clone(),
                position: subtest.position,
                duration_minutes: subtest.duration_minutes,
                questions: subtest
                    .questions
                    .iter()
                    .map(|question| PublicQuestion {
                        id: question.id,
                        text: question.text.clone(),
                        options: question
                            .options
                            .iter()
                            .map(|option| PublicOption {
                                id: option.id,
                                text: option.text.clone(),
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        let total_questions = public_subtests.iter().map(|s| s.questions.len()).sum();

        Self {
            id: tryout.id,
            title: tryout.title.clone(),
            date_open: tryout.date_open,
            date_close: tryout.date_close,
            total_questions,
            subtests: public_subtests,
        }
    }
}
