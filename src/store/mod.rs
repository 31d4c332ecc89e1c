use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::attempt::TryoutAttempt;
use crate::models::tryout::{Subtest, Tryout};

pub mod memory;
pub mod postgres;

/// Persistence seam for attempts. The lifecycle service only ever loads a
/// whole attempt, mutates it in memory and writes the whole row back.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Most recently created attempt for this user on this tryout.
    async fn find_latest(&self, user_id: Uuid, tryout_id: Uuid) -> Result<Option<TryoutAttempt>>;
    async fn find_by_id(&self, attempt_id: Uuid) -> Result<Option<TryoutAttempt>>;
    async fn insert(&self, attempt: &TryoutAttempt) -> Result<()>;
    async fn update(&self, attempt: &TryoutAttempt) -> Result<()>;
}

/// Read-only access to tryout content (schedule windows, subtests with
/// questions). Content is administered elsewhere; this side never writes it.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn fetch_tryout(&self, tryout_id: Uuid) -> Result<Option<Tryout>>;
    /// Subtests ordered by position, each carrying its question list.
    async fn fetch_subtests(&self, tryout_id: Uuid) -> Result<Vec<Subtest>>;
}
