use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::dto::attempt_dto::{
    AttemptStateResponse, AttemptView, SaveProgressBatchRequest, SaveProgressBatchResponse,
    SaveProgressRequest, SubmitAttemptRequest, SubmitAttemptResponse, TimerState,
    UpdatePlanRequest,
};
use crate::error::{Error, Result};
use crate::models::attempt::{
    AttemptStatus, AttemptTrack, ExamState, RetakeStatus, SubtestState, TrackId, TryoutAttempt,
};
use crate::models::event::sort_for_replay;
use crate::models::tryout::{Subtest, Tryout};
use crate::services::content_service::ContentService;
use crate::services::scoring::score_answers;
use crate::services::timer::{resolve_timer_window, TimerOptions, TimerWindow};
use crate::store::AttemptStore;
use crate::utils::time::remaining_seconds;

/// A subtest advance is only honored when the client has checked in within
/// this many seconds; a dormant tab cannot push the attempt forward.
const ADVANCE_HEARTBEAT_SECS: i64 = 300;

/// Attempt lifecycle: start/resume, progress saves, subtest advance,
/// submission and grading, retakes, result plan. All clock reads come in as
/// the `now` argument so every rule stays testable.
#[derive(Clone)]
pub struct AttemptService {
    attempts: Arc<dyn AttemptStore>,
    content: ContentService,
}

impl AttemptService {
    pub fn new(attempts: Arc<dyn AttemptStore>, content: ContentService) -> Self {
        Self { attempts, content }
    }

    /// Start a new attempt, resume a live one, or open a retake pass.
    /// A completed attempt with no retake left is returned as-is so the
    /// caller can show results.
    pub async fn start_attempt(
        &self,
        user_id: Uuid,
        tryout_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<AttemptStateResponse> {
        self.open_tryout(tryout_id, now).await?;
        let subtests = self.content.subtests(tryout_id).await?;

        let Some(mut attempt) = self.attempts.find_latest(user_id, tryout_id).await? else {
            return self.create_attempt(user_id, tryout_id, &subtests, now).await;
        };

        if attempt.is_live() {
            let track = attempt.active_track_mut();
            let window = resolve_timer_window(
                track,
                &subtests,
                track.current_subtest,
                now,
                TimerOptions::default(),
            );
            // Resuming onto an intact window is a pure read.
            if window.differs_from(track) {
                window.apply_to(track);
                track.heartbeat_at = Some(now);
                attempt.updated_at = now;
                self.attempts.update(&attempt).await?;
            }
            tracing::info!("User {} resumed attempt {}", user_id, attempt.id);
            return Ok(state_response(&attempt, &window, now));
        }

        if attempt.retake_available() {
            let baseline = if attempt.retake_status == RetakeStatus::Completed {
                attempt.retake.as_ref().unwrap_or(&attempt.primary)
            } else {
                &attempt.primary
            };
            let mut retake = AttemptTrack::retake_from(baseline, now);
            let window = resolve_timer_window(&retake, &subtests, 0, now, TimerOptions::default());
            window.apply_to(&mut retake);
            attempt.retake = Some(retake);
            attempt.retake_status = RetakeStatus::Running;
            attempt.retake_count += 1;
            attempt.updated_at = now;
            self.attempts.update(&attempt).await?;
            tracing::info!(
                "User {} started retake {} on attempt {}",
                user_id,
                attempt.retake_count,
                attempt.id
            );
            return Ok(state_response(&attempt, &window, now));
        }

        let never_answered = !attempt.primary.has_any_answers()
            && attempt.retake.as_ref().map_or(true, |r| !r.has_any_answers());
        if never_answered {
            // A completed pass that recorded nothing is a dead end for the
            // participant; hand out a fresh attempt instead.
            tracing::warn!(
                "Replacing empty completed attempt {} for user {}",
                attempt.id,
                user_id
            );
            return self.create_attempt(user_id, tryout_id, &subtests, now).await;
        }

        let track = attempt.active_track();
        let window = resolve_timer_window(
            track,
            &subtests,
            track.current_subtest,
            now,
            TimerOptions::default(),
        );
        Ok(state_response(&attempt, &window, now))
    }

    /// Read-only fetch of the latest attempt, for restore flows. Never
    /// persists anything; a synthesized window only becomes authoritative
    /// once a save lands.
    pub async fn get_attempt(
        &self,
        user_id: Uuid,
        tryout_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<AttemptStateResponse>> {
        let Some(attempt) = self.attempts.find_latest(user_id, tryout_id).await? else {
            return Ok(None);
        };
        let subtests = self.content.subtests(tryout_id).await?;
        let track = attempt.active_track();
        let window = resolve_timer_window(
            track,
            &subtests,
            track.current_subtest,
            now,
            TimerOptions::default(),
        );
        Ok(Some(state_response(&attempt, &window, now)))
    }

    /// Legacy whole-state save. Replaces the answer/flag maps wholesale and
    /// may carry the one countdown value the server still honors for
    /// pre-deadline clients.
    pub async fn save_progress(
        &self,
        user_id: Uuid,
        attempt_id: Uuid,
        req: SaveProgressRequest,
        now: DateTime<Utc>,
    ) -> Result<AttemptStateResponse> {
        let mut attempt = self.load_owned(attempt_id, user_id).await?;
        self.open_tryout(attempt.tryout_id, now).await?;
        ensure_live(&attempt)?;
        let subtests = self.content.subtests(attempt.tryout_id).await?;
        let track = attempt.active_track_mut();

        let target =
            resolve_target_subtest(track, req.current_subtest, req.exam_state, subtests.len(), now);
        let options = TimerOptions {
            force_reset: target != track.current_subtest,
            legacy_seconds_remaining: req.seconds_remaining,
        };
        let window = resolve_timer_window(track, &subtests, target, now, options);

        if let Some(answers) = req.answers {
            track.answers = answers;
        }
        if let Some(flags) = req.flags {
            track.flags = flags;
        }
        track.score = Some(score_answers(&subtests, &track.answers));
        apply_cursor(track, target, req.current_question_index, req.exam_state);
        window.apply_to(track);
        track.heartbeat_at = Some(now);
        attempt.updated_at = now;

        self.attempts.update(&attempt).await?;
        Ok(state_response(&attempt, &window, now))
    }

    /// Event-batch save. Replaying a batch id inside the dedup window
    /// answers with current state and touches nothing.
    pub async fn save_progress_batch(
        &self,
        user_id: Uuid,
        attempt_id: Uuid,
        req: SaveProgressBatchRequest,
        now: DateTime<Utc>,
    ) -> Result<SaveProgressBatchResponse> {
        let mut attempt = self.load_owned(attempt_id, user_id).await?;
        self.open_tryout(attempt.tryout_id, now).await?;
        ensure_live(&attempt)?;
        let subtests = self.content.subtests(attempt.tryout_id).await?;
        let track = attempt.active_track_mut();

        if track.has_batch(req.batch_id) {
            tracing::info!(
                "Duplicate batch {} on attempt {}; returning current state",
                req.batch_id,
                attempt_id
            );
            let window = resolve_timer_window(
                track,
                &subtests,
                track.current_subtest,
                now,
                TimerOptions::default(),
            );
            return Ok(SaveProgressBatchResponse {
                attempt: AttemptView::from_attempt(&attempt),
                timer: TimerState::from_window(&window, now),
                duplicate: true,
                applied: 0,
                discarded: 0,
            });
        }

        // Replay order is (client_ts, revision), not payload order.
        let mut events = req.events;
        sort_for_replay(&mut events);

        let mut applied = 0;
        let mut discarded = 0;
        for event in &events {
            if track.apply_event(event) {
                applied += 1;
            } else {
                discarded += 1;
            }
        }
        track.score = Some(score_answers(&subtests, &track.answers));

        let target =
            resolve_target_subtest(track, req.current_subtest, req.exam_state, subtests.len(), now);
        let options = TimerOptions {
            force_reset: target != track.current_subtest,
            legacy_seconds_remaining: None,
        };
        let window = resolve_timer_window(track, &subtests, target, now, options);

        if target > track.current_subtest {
            close_outgoing_subtest(track, &subtests, target, now);
        }
        apply_cursor(track, target, req.current_question_index, req.exam_state);
        window.apply_to(track);
        track.record_batch(req.batch_id);
        track.heartbeat_at = Some(now);
        attempt.updated_at = now;

        self.attempts.update(&attempt).await?;
        if discarded > 0 {
            tracing::debug!(
                "Batch {} on attempt {}: {} applied, {} stale",
                req.batch_id,
                attempt_id,
                applied,
                discarded
            );
        }
        Ok(SaveProgressBatchResponse {
            attempt: AttemptView::from_attempt(&attempt),
            timer: TimerState::from_window(&window, now),
            duplicate: false,
            applied,
            discarded,
        })
    }

    /// Close the active subtest, and on the last subtest grade and complete
    /// the pass. Refused while the authoritative deadline has not elapsed.
    /// Submitting an already-completed attempt is a no-op that returns the
    /// recorded result, so a client retrying a lost response cannot fail.
    pub async fn submit_attempt(
        &self,
        user_id: Uuid,
        attempt_id: Uuid,
        req: SubmitAttemptRequest,
        now: DateTime<Utc>,
    ) -> Result<SubmitAttemptResponse> {
        let mut attempt = self.load_owned(attempt_id, user_id).await?;
        if !attempt.is_live() {
            let score = attempt.active_track().score.clone();
            return Ok(SubmitAttemptResponse {
                attempt: AttemptView::from_attempt(&attempt),
                score,
            });
        }
        self.open_tryout(attempt.tryout_id, now).await?;
        let subtests = self.content.subtests(attempt.tryout_id).await?;
        let active = attempt.active_track_id();
        let track = attempt.active_track_mut();

        let deadline = track.subtest_deadline_at.ok_or_else(|| {
            Error::MalformedTimer(
                "No deadline on record for the active subtest; save progress first".to_string(),
            )
        })?;
        if now < deadline {
            return Err(Error::PrematureSubmit {
                seconds_remaining: remaining_seconds(deadline, now),
            });
        }

        if let Some(final_answers) = req.answers {
            for (subtest_id, questions) in final_answers {
                let per_subtest = track.answers.entry(subtest_id).or_default();
                for (question_id, answer_id) in questions {
                    per_subtest.insert(question_id, answer_id);
                }
            }
        }

        let current_index = track.current_subtest;
        let last_index = (subtests.len() as i32 - 1).max(0);
        let current_subtest_id = usize::try_from(current_index)
            .ok()
            .and_then(|i| subtests.get(i))
            .map(|s| s.id);
        if let Some(id) = current_subtest_id {
            if track.subtest_states.get(&id) != Some(&SubtestState::Finished) {
                track.capture_snapshot(id, current_index, now);
                track.subtest_states.insert(id, SubtestState::Finished);
            }
        }
        track.heartbeat_at = Some(now);

        let completed = current_index >= last_index;
        let report = if completed {
            let report = score_answers(&subtests, &track.answers);
            track.score = Some(report.clone());
            track.completed_at = Some(now);
            Some(report)
        } else {
            track.exam_state = ExamState::Bridging;
            None
        };
        if completed {
            match active {
                TrackId::Primary => attempt.status = AttemptStatus::Completed,
                TrackId::Retake => attempt.retake_status = RetakeStatus::Completed,
            }
        }
        attempt.updated_at = now;

        self.attempts.update(&attempt).await?;
        match &report {
            Some(r) => tracing::info!(
                "Attempt {} completed its {:?} pass with score {}",
                attempt_id,
                active,
                r.score
            ),
            None => tracing::info!(
                "Attempt {} finished subtest {}, bridging to the next",
                attempt_id,
                current_index
            ),
        }
        Ok(SubmitAttemptResponse {
            attempt: AttemptView::from_attempt(&attempt),
            score: report,
        })
    }

    /// Choose how results will be delivered. Ownership-gated only; plans
    /// are typically picked after the tryout window has closed.
    pub async fn update_plan(
        &self,
        user_id: Uuid,
        attempt_id: Uuid,
        req: UpdatePlanRequest,
        now: DateTime<Utc>,
    ) -> Result<AttemptView> {
        let mut attempt = self.load_owned(attempt_id, user_id).await?;
        attempt.result_plan = req.plan;
        attempt.updated_at = now;
        self.attempts.update(&attempt).await?;
        tracing::info!(
            "Attempt {} result plan set to {}",
            attempt_id,
            req.plan.as_str()
        );
        Ok(AttemptView::from_attempt(&attempt))
    }

    async fn create_attempt(
        &self,
        user_id: Uuid,
        tryout_id: Uuid,
        subtests: &[Subtest],
        now: DateTime<Utc>,
    ) -> Result<AttemptStateResponse> {
        let mut attempt = TryoutAttempt::new(user_id, tryout_id, now);
        let window =
            resolve_timer_window(&attempt.primary, subtests, 0, now, TimerOptions::default());
        window.apply_to(&mut attempt.primary);
        self.attempts.insert(&attempt).await?;
        tracing::info!(
            "User {} started attempt {} on tryout {}",
            user_id,
            attempt.id,
            tryout_id
        );
        Ok(state_response(&attempt, &window, now))
    }

    async fn load_owned(&self, attempt_id: Uuid, user_id: Uuid) -> Result<TryoutAttempt> {
        let attempt = self
            .attempts
            .find_by_id(attempt_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Attempt {attempt_id} not found")))?;
        if attempt.user_id != user_id {
            return Err(Error::Forbidden(
                "Attempt belongs to another user".to_string(),
            ));
        }
        Ok(attempt)
    }

    async fn open_tryout(&self, tryout_id: Uuid, now: DateTime<Utc>) -> Result<Tryout> {
        let tryout = self.content.tryout(tryout_id).await?;
        if !tryout.window_contains(now) {
            return Err(Error::Scheduling(format!(
                "Tryout '{}' is not open",
                tryout.title
            )));
        }
        Ok(tryout)
    }
}

fn ensure_live(attempt: &TryoutAttempt) -> Result<()> {
    if attempt.is_live() {
        Ok(())
    } else {
        Err(Error::BadRequest("Attempt is already completed".to_string()))
    }
}

fn state_response(
    attempt: &TryoutAttempt,
    window: &TimerWindow,
    now: DateTime<Utc>,
) -> AttemptStateResponse {
    AttemptStateResponse {
        attempt: AttemptView::from_attempt(attempt),
        timer: TimerState::from_window(window, now),
    }
}

fn heartbeat_is_fresh(track: &AttemptTrack, now: DateTime<Utc>) -> bool {
    track
        .heartbeat_at
        .or(track.started_at)
        .map_or(true, |seen| now - seen <= Duration::seconds(ADVANCE_HEARTBEAT_SECS))
}

/// Clamp a client-requested subtest index: never backwards, at most one
/// step forward, never past the last subtest. A forward step additionally
/// requires a bridging state and a recent heartbeat.
fn resolve_target_subtest(
    track: &AttemptTrack,
    requested: Option<i32>,
    requested_state: Option<ExamState>,
    subtest_count: usize,
    now: DateTime<Utc>,
) -> i32 {
    let current = track.current_subtest;
    let Some(requested) = requested else {
        return current;
    };
    let last_index = (subtest_count as i32 - 1).max(current);
    let resolved = requested.clamp(current, (current + 1).min(last_index));
    if resolved > current {
        let bridging = track.exam_state == ExamState::Bridging
            || requested_state == Some(ExamState::Bridging);
        let fresh = heartbeat_is_fresh(track, now);
        if !bridging || !fresh {
            tracing::warn!(
                "Refusing subtest advance {} -> {} (bridging={}, fresh heartbeat={})",
                current,
                resolved,
                bridging,
                fresh
            );
            return current;
        }
    }
    resolved
}

/// Bookkeeping for a confirmed advance: the subtest being left gets a final
/// snapshot of its answers/flags and is marked finished (unless a submit
/// already closed it), the one being entered is marked running.
fn close_outgoing_subtest(
    track: &mut AttemptTrack,
    subtests: &[Subtest],
    target: i32,
    now: DateTime<Utc>,
) {
    let outgoing = usize::try_from(track.current_subtest)
        .ok()
        .and_then(|i| subtests.get(i));
    if let Some(subtest) = outgoing {
        if track.subtest_states.get(&subtest.id) != Some(&SubtestState::Finished) {
            track.capture_snapshot(subtest.id, track.current_subtest, now);
            track.subtest_states.insert(subtest.id, SubtestState::Finished);
        }
    }
    if let Some(incoming) = usize::try_from(target).ok().and_then(|i| subtests.get(i)) {
        track.subtest_states.insert(incoming.id, SubtestState::Running);
    }
}

fn apply_cursor(
    track: &mut AttemptTrack,
    target: i32,
    question_index: Option<i32>,
    requested_state: Option<ExamState>,
) {
    let advanced = target > track.current_subtest;
    if advanced {
        track.current_subtest = target;
        track.current_question_index = 0;
        track.exam_state = ExamState::Running;
    } else if let Some(state) = requested_state {
        track.exam_state = state;
    }
    if let Some(question) = question_index {
        track.current_question_index = question.max(0);
    }
}
