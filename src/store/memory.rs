use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::attempt::TryoutAttempt;
use crate::models::tryout::{Subtest, Tryout};
use crate::store::{AttemptStore, ContentStore};

/// In-memory attempt store. Backs the test suites and keeps the lifecycle
/// service honest about going through the store seam only.
#[derive(Default)]
pub struct MemoryAttemptStore {
    attempts: Mutex<Vec<TryoutAttempt>>,
}

impl MemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttemptStore for MemoryAttemptStore {
    async fn find_latest(&self, user_id: Uuid, tryout_id: Uuid) -> Result<Option<TryoutAttempt>> {
        let attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        Ok(attempts
            .iter()
            .filter(|a| a.user_id == user_id && a.tryout_id == tryout_id)
            .max_by_key(|a| a.created_at)
            .cloned())
    }

    async fn find_by_id(&self, attempt_id: Uuid) -> Result<Option<TryoutAttempt>> {
        let attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        Ok(attempts.iter().find(|a| a.id == attempt_id).cloned())
    }

    async fn insert(&self, attempt: &TryoutAttempt) -> Result<()> {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        attempts.push(attempt.clone());
        Ok(())
    }

    async fn update(&self, attempt: &TryoutAttempt) -> Result<()> {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        match attempts.iter_mut().find(|a| a.id == attempt.id) {
            Some(slot) => {
                *slot = attempt.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!(
                "Attempt {} does not exist",
                attempt.id
            ))),
        }
    }
}

/// In-memory content store, seeded once by tests.
#[derive(Default)]
pub struct MemoryContentStore {
    tryouts: Mutex<Vec<Tryout>>,
    subtests: Mutex<Vec<Subtest>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_tryout(&self, tryout: Tryout) {
        let mut tryouts = self.tryouts.lock().unwrap_or_else(|e| e.into_inner());
        tryouts.retain(|t| t.id != tryout.id);
        tryouts.push(tryout);
    }

    pub fn put_subtest(&self, subtest: Subtest) {
        let mut subtests = self.subtests.lock().unwrap_or_else(|e| e.into_inner());
        subtests.retain(|s| s.id != subtest.id);
        subtests.push(subtest);
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn fetch_tryout(&self, tryout_id: Uuid) -> Result<Option<Tryout>> {
        let tryouts = self.tryouts.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tryouts.iter().find(|t| t.id == tryout_id).cloned())
    }

    async fn fetch_subtests(&self, tryout_id: Uuid) -> Result<Vec<Subtest>> {
        let subtests = self.subtests.lock().unwrap_or_else(|e| e.into_inner());
        let mut matched: Vec<Subtest> = subtests
            .iter()
            .filter(|s| s.tryout_id == tryout_id)
            .cloned()
            .collect();
        matched.sort_by_key(|s| s.position);
        Ok(matched)
    }
}
