use uuid::Uuid;

use crate::client::event_log::EventLog;
use crate::client::state::{
    snapshot_from_server, ExamAction, ExamPhase, ExamSnapshot, ExamStateStore,
};
use crate::client::storage::{ExamBackup, LocalStore};
use crate::client::sync::AttemptApi;
use crate::dto::attempt_dto::AttemptStateResponse;
use crate::error::Result;
use crate::models::attempt::ExamState;
use crate::models::event::{sort_for_replay, ProgressEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreSource {
    /// Server state was the freshest thing we had.
    Server,
    /// A local backup outranked (or substituted for) the server state.
    Backup,
    /// Neither server nor backup was available.
    Fresh,
}

#[derive(Debug, Clone)]
pub struct RestoredSession {
    pub snapshot: ExamSnapshot,
    pub replayed_events: usize,
    pub source: RestoreSource,
}

/// Rebuild the exam snapshot after a restart. Server state is the base;
/// a local backup overlays it when the backup is demonstrably newer; the
/// unsent event queue is replayed on top. Once the server says the attempt
/// is finished, local leftovers are ignored.
pub fn merge_restore(
    server: Option<&AttemptStateResponse>,
    backup: Option<&ExamBackup>,
    pending: &[ProgressEvent],
    subtest_count: usize,
) -> RestoredSession {
    let mut snapshot = match server {
        Some(response) => snapshot_from_server(&response.attempt, &response.timer),
        None => {
            // No attempt on record anywhere: show the intro screen.
            let mut fresh = ExamSnapshot::empty();
            fresh.phase = ExamPhase::Ready;
            fresh
        }
    };
    let mut source = match server {
        Some(_) => RestoreSource::Server,
        None => RestoreSource::Fresh,
    };

    // Finished means show results; Ready from the server means the previous
    // pass is closed and a retake starts clean. Either way local leftovers
    // from the old pass must not replay.
    if server.is_some() && !snapshot.is_live() {
        clamp_cursor(&mut snapshot, subtest_count);
        return RestoredSession {
            snapshot,
            replayed_events: 0,
            source,
        };
    }

    if let Some(backup) = backup {
        if backup_applies(backup, &snapshot) {
            overlay_backup(&mut snapshot, backup);
            source = RestoreSource::Backup;
        }
    }

    let mut replay = pending.to_vec();
    sort_for_replay(&mut replay);
    for event in &replay {
        snapshot.apply_event(event);
    }

    clamp_cursor(&mut snapshot, subtest_count);
    RestoredSession {
        snapshot,
        replayed_events: replay.len(),
        source,
    }
}

fn backup_applies(backup: &ExamBackup, base: &ExamSnapshot) -> bool {
    if let Some(attempt_id) = base.attempt_id {
        if backup.attempt_id != attempt_id {
            return false;
        }
    }
    // A backup behind the server's subtest cursor can never override it,
    // however fresh its timestamp.
    match base.updated_at {
        None => true,
        Some(server_updated) => {
            backup.current_subtest > base.current_subtest
                || (backup.current_subtest == base.current_subtest
                    && backup.saved_at > server_updated)
        }
    }
}

/// Answers and flags merge with the backup winning per question; the
/// cursor only ever moves forward. Timer fields stay as the server
/// reported them (a backup carries no deadline).
fn overlay_backup(snapshot: &mut ExamSnapshot, backup: &ExamBackup) {
    for (subtest_id, questions) in &backup.answers {
        snapshot
            .answers
            .entry(*subtest_id)
            .or_default()
            .extend(questions.iter().map(|(q, a)| (*q, *a)));
    }
    for (subtest_id, questions) in &backup.flags {
        snapshot
            .flags
            .entry(*subtest_id)
            .or_default()
            .extend(questions.iter().map(|(q, f)| (*q, *f)));
    }
    if backup.current_subtest > snapshot.current_subtest {
        snapshot.current_subtest = backup.current_subtest;
        snapshot.current_question_index = backup.current_question_index;
    } else {
        // Same subtest: the question cursor may only move forward.
        snapshot.current_question_index = snapshot
            .current_question_index
            .max(backup.current_question_index);
    }
    snapshot.phase = match backup.exam_state {
        ExamState::Running => ExamPhase::Running,
        ExamState::Bridging => ExamPhase::Bridging,
    };
    if snapshot.attempt_id.is_none() {
        snapshot.attempt_id = Some(backup.attempt_id);
    }
}

fn clamp_cursor(snapshot: &mut ExamSnapshot, subtest_count: usize) {
    if subtest_count > 0
        && !(0..subtest_count as i32).contains(&snapshot.current_subtest)
    {
        snapshot.current_subtest = 0;
        snapshot.current_question_index = 0;
    }
    if snapshot.current_question_index < 0 {
        snapshot.current_question_index = 0;
    }
}

/// Full restore flow for one tryout: fetch the server state (tolerating
/// being offline), seed the event log's revision counters, merge in the
/// local backup and unsent queue, and publish the result to the UI.
pub async fn restore_session(
    api: &dyn AttemptApi,
    log: &EventLog,
    store: &dyn LocalStore,
    state: &ExamStateStore,
    tryout_id: Uuid,
    subtest_count: usize,
) -> Result<RestoredSession> {
    let server = match api.fetch_attempt(tryout_id).await {
        Ok(found) => found,
        Err(err) => {
            tracing::warn!(
                "Could not reach the server during restore, using local data: {}",
                err
            );
            None
        }
    };
    if let Some(response) = &server {
        log.seed_revisions(&response.attempt.active_track_view().event_revisions)
            .await;
    }

    let backup = match store.load_backup().await {
        Ok(found) => found,
        Err(err) => {
            tracing::warn!("Local backup unreadable, skipping it: {}", err);
            None
        }
    };
    // A backup from a different attempt (e.g. taken before a retake was
    // started elsewhere) must not leak into this one.
    let backup = match (&server, backup) {
        (Some(response), Some(b)) if b.attempt_id != response.attempt.id => None,
        (_, b) => b,
    };

    let pending = log.pending().await;
    let restored = merge_restore(server.as_ref(), backup.as_ref(), &pending, subtest_count);

    let pass_closed = restored.snapshot.phase == ExamPhase::Finished
        || (server.is_some() && restored.snapshot.phase == ExamPhase::Ready);
    if pass_closed {
        // The pass is over; the local queue and backup no longer apply.
        log.reset().await?;
        store.clear().await?;
    }

    state.dispatch(ExamAction::Hydrate(restored.snapshot.clone()));
    tracing::info!(
        "Restored attempt {:?} from {:?} with {} replayed events",
        restored.snapshot.attempt_id,
        restored.source,
        restored.replayed_events
    );
    Ok(restored)
}
