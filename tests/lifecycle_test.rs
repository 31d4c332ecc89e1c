use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use tryout_backend::dto::attempt_dto::{
    SaveProgressBatchRequest, SaveProgressRequest, SubmitAttemptRequest,
};
use tryout_backend::error::Error;
use tryout_backend::models::attempt::{AnswerMap, AttemptStatus, ExamState, RetakeStatus, TrackId};
use tryout_backend::models::event::{EventKind, ProgressEvent};
use tryout_backend::models::tryout::{AnswerOption, Question, Subtest, Tryout};
use tryout_backend::models::attempt::TryoutAttempt;
use tryout_backend::services::attempt_service::AttemptService;
use tryout_backend::services::content_service::ContentService;
use tryout_backend::store::memory::{MemoryAttemptStore, MemoryContentStore};
use tryout_backend::store::AttemptStore;

struct Fixture {
    service: AttemptService,
    attempts: Arc<MemoryAttemptStore>,
    tryout_id: Uuid,
    subtests: Vec<Subtest>,
    user: Uuid,
    t0: DateTime<Utc>,
}

/// Options are laid out so index 0 is always the correct one, which makes
/// it label "A" in score reports.
fn question(number: usize) -> Question {
    let option = |text: &str, correct: bool| AnswerOption {
        id: Uuid::new_v4(),
        text: text.to_string(),
        is_correct: correct,
    };
    Question {
        id: Uuid::new_v4(),
        text: format!("Question {number}"),
        options: vec![
            option("right", true),
            option("wrong", false),
            option("also wrong", false),
        ],
    }
}

fn fixture(subtest_minutes: &[i32], questions_per_subtest: usize) -> Fixture {
    let t0 = Utc::now();
    let tryout_id = Uuid::new_v4();
    let content_store = Arc::new(MemoryContentStore::new());
    content_store.put_tryout(Tryout {
        id: tryout_id,
        title: "Mock exam".to_string(),
        date_open: t0 - Duration::hours(1),
        date_close: t0 + Duration::hours(8),
        created_at: None,
        updated_at: None,
    });

    let mut subtests = Vec::new();
    for (index, minutes) in subtest_minutes.iter().enumerate() {
        let subtest = Subtest {
            id: Uuid::new_v4(),
            tryout_id,
            name: format!("Section {}", index + 1),
            position: index as i32,
            duration_minutes: *minutes,
            questions: (0..questions_per_subtest).map(question).collect(),
            created_at: None,
        };
        content_store.put_subtest(subtest.clone());
        subtests.push(subtest);
    }

    let attempts = Arc::new(MemoryAttemptStore::new());
    let content = ContentService::new(content_store, StdDuration::ZERO);
    let service = AttemptService::new(attempts.clone(), content);
    Fixture {
        service,
        attempts,
        tryout_id,
        subtests,
        user: Uuid::new_v4(),
        t0,
    }
}

fn save_req() -> SaveProgressRequest {
    SaveProgressRequest {
        answers: None,
        flags: None,
        current_subtest: None,
        current_question_index: None,
        exam_state: None,
        seconds_remaining: None,
    }
}

fn batch(events: Vec<ProgressEvent>) -> SaveProgressBatchRequest {
    SaveProgressBatchRequest {
        batch_id: Uuid::new_v4(),
        events,
        current_subtest: None,
        current_question_index: None,
        exam_state: None,
    }
}

fn answer_event(
    subtest: &Subtest,
    question_index: usize,
    option_index: usize,
    revision: i64,
    at: DateTime<Utc>,
) -> ProgressEvent {
    let question = &subtest.questions[question_index];
    ProgressEvent {
        id: Uuid::new_v4(),
        kind: EventKind::Answer,
        subtest_id: subtest.id,
        question_id: question.id,
        answer_id: Some(question.options[option_index].id),
        flagged: None,
        revision,
        client_ts: at,
    }
}

#[tokio::test]
async fn fresh_attempt_issues_the_first_window() {
    let fx = fixture(&[2], 3);
    let response = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, fx.t0)
        .await
        .unwrap();

    assert_eq!(response.attempt.status, AttemptStatus::Started);
    assert_eq!(response.attempt.active_track, TrackId::Primary);
    assert_eq!(response.attempt.primary.current_subtest, 0);
    assert_eq!(response.timer.seconds_remaining, 120);
    assert_eq!(
        response.timer.subtest_deadline_at,
        fx.t0 + Duration::seconds(120)
    );
    assert_eq!(response.timer.server_now, fx.t0);
}

#[tokio::test]
async fn resume_does_not_restart_the_clock() {
    let fx = fixture(&[2], 3);
    let first = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, fx.t0)
        .await
        .unwrap();

    let resumed = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, fx.t0 + Duration::seconds(30))
        .await
        .unwrap();

    assert_eq!(resumed.attempt.id, first.attempt.id);
    assert_eq!(
        resumed.timer.subtest_deadline_at,
        first.timer.subtest_deadline_at
    );
    assert_eq!(resumed.timer.seconds_remaining, 90);
}

#[tokio::test]
async fn premature_submit_is_refused_with_the_countdown() {
    let fx = fixture(&[2], 3);
    let started = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, fx.t0)
        .await
        .unwrap();

    let err = fx
        .service
        .submit_attempt(
            fx.user,
            started.attempt.id,
            SubmitAttemptRequest { answers: None },
            fx.t0 + Duration::seconds(30),
        )
        .await
        .unwrap_err();

    match err {
        Error::PrematureSubmit { seconds_remaining } => assert_eq!(seconds_remaining, 90),
        other => panic!("expected PrematureSubmit, got {other:?}"),
    }
}

#[tokio::test]
async fn batches_apply_by_revision_and_discard_stale_events() {
    let fx = fixture(&[2], 3);
    let started = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, fx.t0)
        .await
        .unwrap();
    let attempt_id = started.attempt.id;
    let subtest = &fx.subtests[0];
    let question_id = subtest.questions[0].id;

    let response = fx
        .service
        .save_progress_batch(
            fx.user,
            attempt_id,
            batch(vec![
                answer_event(subtest, 0, 1, 1, fx.t0),
                answer_event(subtest, 0, 0, 2, fx.t0 + Duration::seconds(1)),
            ]),
            fx.t0 + Duration::seconds(5),
        )
        .await
        .unwrap();
    assert!(!response.duplicate);
    assert_eq!(response.applied, 2);
    assert_eq!(response.discarded, 0);
    let chosen = response.attempt.primary.answers[&subtest.id][&question_id];
    assert_eq!(chosen, subtest.questions[0].options[0].id);

    // A delayed replay of revision 1 must not roll the answer back.
    let stale = fx
        .service
        .save_progress_batch(
            fx.user,
            attempt_id,
            batch(vec![answer_event(subtest, 0, 1, 1, fx.t0)]),
            fx.t0 + Duration::seconds(8),
        )
        .await
        .unwrap();
    assert_eq!(stale.applied, 0);
    assert_eq!(stale.discarded, 1);
    let kept = stale.attempt.primary.answers[&subtest.id][&question_id];
    assert_eq!(kept, subtest.questions[0].options[0].id);
}

#[tokio::test]
async fn duplicate_batch_is_acknowledged_without_reapplying() {
    let fx = fixture(&[2], 3);
    let started = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, fx.t0)
        .await
        .unwrap();
    let attempt_id = started.attempt.id;
    let subtest = &fx.subtests[0];
    let question_id = subtest.questions[0].id;

    let first = batch(vec![answer_event(subtest, 0, 1, 1, fx.t0)]);
    fx.service
        .save_progress_batch(fx.user, attempt_id, first.clone(), fx.t0 + Duration::seconds(2))
        .await
        .unwrap();
    fx.service
        .save_progress_batch(
            fx.user,
            attempt_id,
            batch(vec![answer_event(subtest, 0, 0, 2, fx.t0 + Duration::seconds(3))]),
            fx.t0 + Duration::seconds(4),
        )
        .await
        .unwrap();

    let replay = fx
        .service
        .save_progress_batch(fx.user, attempt_id, first, fx.t0 + Duration::seconds(6))
        .await
        .unwrap();

    assert!(replay.duplicate);
    assert_eq!(replay.applied, 0);
    let kept = replay.attempt.primary.answers[&subtest.id][&question_id];
    assert_eq!(kept, subtest.questions[0].options[0].id);
}

#[tokio::test]
async fn full_walkthrough_with_bridging_and_global_numbering() {
    let fx = fixture(&[2, 3], 2);
    let started = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, fx.t0)
        .await
        .unwrap();
    let attempt_id = started.attempt.id;
    let (s0, s1) = (&fx.subtests[0], &fx.subtests[1]);

    // Jumping ahead without a finished subtest is silently clamped.
    let early = fx
        .service
        .save_progress(
            fx.user,
            attempt_id,
            SaveProgressRequest {
                current_subtest: Some(1),
                ..save_req()
            },
            fx.t0 + Duration::seconds(30),
        )
        .await
        .unwrap();
    assert_eq!(early.attempt.primary.current_subtest, 0);
    assert_eq!(
        early.timer.subtest_deadline_at,
        fx.t0 + Duration::seconds(120)
    );

    fx.service
        .save_progress_batch(
            fx.user,
            attempt_id,
            batch(vec![
                answer_event(s0, 0, 0, 1, fx.t0 + Duration::seconds(40)),
                answer_event(s0, 1, 0, 1, fx.t0 + Duration::seconds(50)),
            ]),
            fx.t0 + Duration::seconds(55),
        )
        .await
        .unwrap();

    // First subtest closes at its deadline; the attempt bridges.
    let t_submit = fx.t0 + Duration::seconds(120);
    let bridged = fx
        .service
        .submit_attempt(
            fx.user,
            attempt_id,
            SubmitAttemptRequest { answers: None },
            t_submit,
        )
        .await
        .unwrap();
    assert!(bridged.score.is_none());
    assert_eq!(bridged.attempt.status, AttemptStatus::Started);
    assert_eq!(bridged.attempt.primary.exam_state, ExamState::Bridging);

    // The advance is honored now: one step, cursor reset, fresh window.
    let t_advance = t_submit + Duration::seconds(5);
    let advanced = fx
        .service
        .save_progress(
            fx.user,
            attempt_id,
            SaveProgressRequest {
                current_subtest: Some(1),
                current_question_index: Some(0),
                exam_state: Some(ExamState::Running),
                ..save_req()
            },
            t_advance,
        )
        .await
        .unwrap();
    assert_eq!(advanced.attempt.primary.current_subtest, 1);
    assert_eq!(advanced.attempt.primary.current_question_index, 0);
    assert_eq!(advanced.attempt.primary.exam_state, ExamState::Running);
    assert_eq!(advanced.timer.seconds_remaining, 180);
    assert_eq!(
        advanced.timer.subtest_deadline_at,
        t_advance + Duration::seconds(180)
    );

    // Requesting a subtest past the end clamps to the current one.
    let overjump = fx
        .service
        .save_progress(
            fx.user,
            attempt_id,
            SaveProgressRequest {
                current_subtest: Some(5),
                ..save_req()
            },
            t_advance + Duration::seconds(10),
        )
        .await
        .unwrap();
    assert_eq!(overjump.attempt.primary.current_subtest, 1);
    assert_eq!(
        overjump.timer.subtest_deadline_at,
        t_advance + Duration::seconds(180)
    );

    fx.service
        .save_progress_batch(
            fx.user,
            attempt_id,
            batch(vec![
                answer_event(s1, 0, 0, 1, t_advance + Duration::seconds(20)),
                answer_event(s1, 1, 1, 1, t_advance + Duration::seconds(25)),
            ]),
            t_advance + Duration::seconds(30),
        )
        .await
        .unwrap();

    let done = fx
        .service
        .submit_attempt(
            fx.user,
            attempt_id,
            SubmitAttemptRequest { answers: None },
            t_advance + Duration::seconds(180),
        )
        .await
        .unwrap();
    let report = done.score.expect("final submit grades the attempt");
    assert_eq!(done.attempt.status, AttemptStatus::Completed);
    assert_eq!(report.total_questions_count, 4);
    assert_eq!(report.correct_answers_count, 3);
    assert_eq!(report.score, 75);
    let numbers: Vec<i32> = report.question_results.iter().map(|q| q.number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn stale_heartbeat_blocks_an_advance_until_the_client_checks_in() {
    let fx = fixture(&[2, 3], 1);
    let started = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, fx.t0)
        .await
        .unwrap();
    let attempt_id = started.attempt.id;

    let t_submit = fx.t0 + Duration::seconds(120);
    fx.service
        .submit_attempt(
            fx.user,
            attempt_id,
            SubmitAttemptRequest { answers: None },
            t_submit,
        )
        .await
        .unwrap();

    // 400s of silence, then an advance request: refused, clock untouched.
    let t_stale = t_submit + Duration::seconds(400);
    let refused = fx
        .service
        .save_progress(
            fx.user,
            attempt_id,
            SaveProgressRequest {
                current_subtest: Some(1),
                ..save_req()
            },
            t_stale,
        )
        .await
        .unwrap();
    assert_eq!(refused.attempt.primary.current_subtest, 0);

    // That save was itself a check-in, so a retry right after goes through.
    let accepted = fx
        .service
        .save_progress(
            fx.user,
            attempt_id,
            SaveProgressRequest {
                current_subtest: Some(1),
                ..save_req()
            },
            t_stale + Duration::seconds(5),
        )
        .await
        .unwrap();
    assert_eq!(accepted.attempt.primary.current_subtest, 1);
}

#[tokio::test]
async fn closed_tryout_rejects_every_mutation() {
    let fx = fixture(&[2], 2);
    let started = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, fx.t0)
        .await
        .unwrap();
    let attempt_id = started.attempt.id;
    let subtest = &fx.subtests[0];

    let after_close = fx.t0 + Duration::hours(9);

    let err = fx
        .service
        .save_progress(fx.user, attempt_id, save_req(), after_close)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Scheduling(_)));

    let err = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, after_close)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Scheduling(_)));

    let err = fx
        .service
        .save_progress_batch(
            fx.user,
            attempt_id,
            batch(vec![answer_event(subtest, 0, 0, 1, after_close)]),
            after_close,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Scheduling(_)));

    // The deadline elapsed long ago, but submission is still window-gated.
    let err = fx
        .service
        .submit_attempt(
            fx.user,
            attempt_id,
            SubmitAttemptRequest { answers: None },
            after_close,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Scheduling(_)));
}

#[tokio::test]
async fn completed_attempt_rejects_saves_and_resubmits_idempotently() {
    let fx = fixture(&[2], 1);
    let started = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, fx.t0)
        .await
        .unwrap();
    let attempt_id = started.attempt.id;
    let subtest = &fx.subtests[0];

    fx.service
        .save_progress_batch(
            fx.user,
            attempt_id,
            batch(vec![answer_event(subtest, 0, 0, 1, fx.t0)]),
            fx.t0 + Duration::seconds(10),
        )
        .await
        .unwrap();
    fx.service
        .submit_attempt(
            fx.user,
            attempt_id,
            SubmitAttemptRequest { answers: None },
            fx.t0 + Duration::seconds(120),
        )
        .await
        .unwrap();

    let t_after = fx.t0 + Duration::seconds(130);
    let err = fx
        .service
        .save_progress(fx.user, attempt_id, save_req(), t_after)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::BadRequest(_)));

    // A retried submit is answered with the recorded result, not an error.
    let resubmitted = fx
        .service
        .submit_attempt(
            fx.user,
            attempt_id,
            SubmitAttemptRequest { answers: None },
            t_after,
        )
        .await
        .unwrap();
    assert_eq!(resubmitted.attempt.status, AttemptStatus::Completed);
    assert_eq!(resubmitted.score.as_ref().unwrap().score, 100);
    let stored = fx.attempts.find_by_id(attempt_id).await.unwrap().unwrap();
    assert_eq!(stored.updated_at, fx.t0 + Duration::seconds(120));
}

#[tokio::test]
async fn advancing_snapshots_the_outgoing_subtest() {
    let fx = fixture(&[1, 1], 1);
    let started = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, fx.t0)
        .await
        .unwrap();
    let attempt_id = started.attempt.id;
    let (s0, s1) = (&fx.subtests[0], &fx.subtests[1]);

    fx.service
        .save_progress_batch(
            fx.user,
            attempt_id,
            batch(vec![answer_event(s0, 0, 0, 1, fx.t0)]),
            fx.t0 + Duration::seconds(10),
        )
        .await
        .unwrap();

    let advanced = fx
        .service
        .save_progress_batch(
            fx.user,
            attempt_id,
            SaveProgressBatchRequest {
                current_subtest: Some(1),
                exam_state: Some(ExamState::Bridging),
                ..batch(vec![])
            },
            fx.t0 + Duration::seconds(60),
        )
        .await
        .unwrap();
    assert_eq!(advanced.attempt.primary.current_subtest, 1);

    let stored = fx.attempts.find_by_id(attempt_id).await.unwrap().unwrap();
    assert_eq!(stored.primary.subtest_snapshots.len(), 1);
    let snapshot = &stored.primary.subtest_snapshots[0];
    assert_eq!(snapshot.subtest_id, s0.id);
    assert_eq!(snapshot.subtest_index, 0);
    assert_eq!(
        snapshot.answers[&s0.questions[0].id],
        s0.questions[0].options[0].id
    );
    assert_eq!(
        stored.primary.subtest_states[&s0.id],
        tryout_backend::models::attempt::SubtestState::Finished
    );
    assert_eq!(
        stored.primary.subtest_states[&s1.id],
        tryout_backend::models::attempt::SubtestState::Running
    );
}

#[tokio::test]
async fn offline_queue_replays_once_despite_retries() {
    let fx = fixture(&[2], 5);
    let started = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, fx.t0)
        .await
        .unwrap();
    let attempt_id = started.attempt.id;
    let subtest = &fx.subtests[0];

    // Five answers queued while offline, then the same payload retried
    // twice after a timed-out first delivery actually landed.
    let events: Vec<ProgressEvent> = (0..5)
        .map(|i| answer_event(subtest, i, 0, 1, fx.t0 + Duration::seconds(i as i64)))
        .collect();
    let req = batch(events);

    let first = fx
        .service
        .save_progress_batch(fx.user, attempt_id, req.clone(), fx.t0 + Duration::seconds(30))
        .await
        .unwrap();
    assert_eq!(first.applied, 5);

    for retry in 1..=2 {
        let replay = fx
            .service
            .save_progress_batch(
                fx.user,
                attempt_id,
                req.clone(),
                fx.t0 + Duration::seconds(30 + retry),
            )
            .await
            .unwrap();
        assert!(replay.duplicate);
        assert_eq!(replay.applied, 0);
    }

    let stored = fx.attempts.find_by_id(attempt_id).await.unwrap().unwrap();
    assert_eq!(stored.primary.processed_batch_ids.len(), 1);
    assert_eq!(stored.primary.answers[&subtest.id].len(), 5);
}

#[tokio::test]
async fn evicted_batch_id_reprocesses_but_revisions_still_hold() {
    let fx = fixture(&[2], 1);
    let started = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, fx.t0)
        .await
        .unwrap();
    let attempt_id = started.attempt.id;
    let subtest = &fx.subtests[0];

    let first = batch(vec![answer_event(subtest, 0, 0, 1, fx.t0)]);
    fx.service
        .save_progress_batch(fx.user, attempt_id, first.clone(), fx.t0 + Duration::seconds(1))
        .await
        .unwrap();

    // 100 further batches push the first id out of the dedup window.
    for i in 0..100 {
        fx.service
            .save_progress_batch(
                fx.user,
                attempt_id,
                batch(vec![]),
                fx.t0 + Duration::seconds(2 + i),
            )
            .await
            .unwrap();
    }

    // The very late replay is no longer recognized as a duplicate, but the
    // per-question revision gate still discards its events.
    let replay = fx
        .service
        .save_progress_batch(fx.user, attempt_id, first, fx.t0 + Duration::seconds(110))
        .await
        .unwrap();
    assert!(!replay.duplicate);
    assert_eq!(replay.applied, 0);
    assert_eq!(replay.discarded, 1);
}

#[tokio::test]
async fn submit_merges_final_answers_before_grading() {
    let fx = fixture(&[1], 2);
    let started = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, fx.t0)
        .await
        .unwrap();
    let subtest = &fx.subtests[0];

    // The client's last-moment answers ride along with the submit itself.
    let mut per_subtest = HashMap::new();
    per_subtest.insert(subtest.questions[0].id, subtest.questions[0].options[0].id);
    per_subtest.insert(subtest.questions[1].id, subtest.questions[1].options[1].id);
    let mut answers = AnswerMap::new();
    answers.insert(subtest.id, per_subtest);

    let done = fx
        .service
        .submit_attempt(
            fx.user,
            started.attempt.id,
            SubmitAttemptRequest {
                answers: Some(answers),
            },
            fx.t0 + Duration::seconds(60),
        )
        .await
        .unwrap();
    let report = done.score.expect("single-subtest submit grades the attempt");
    assert_eq!(report.total_questions_count, 2);
    assert_eq!(report.correct_answers_count, 1);
    assert_eq!(report.score, 50);
}

#[tokio::test]
async fn retake_runs_on_its_own_track() {
    let fx = fixture(&[2], 3);
    let started = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, fx.t0)
        .await
        .unwrap();
    let attempt_id = started.attempt.id;
    let subtest = &fx.subtests[0];

    fx.service
        .save_progress_batch(
            fx.user,
            attempt_id,
            batch(vec![
                answer_event(subtest, 0, 0, 1, fx.t0),
                answer_event(subtest, 1, 0, 1, fx.t0),
                answer_event(subtest, 2, 0, 1, fx.t0),
            ]),
            fx.t0 + Duration::seconds(10),
        )
        .await
        .unwrap();
    let first_pass = fx
        .service
        .submit_attempt(
            fx.user,
            attempt_id,
            SubmitAttemptRequest { answers: None },
            fx.t0 + Duration::seconds(120),
        )
        .await
        .unwrap();
    assert_eq!(first_pass.score.as_ref().unwrap().score, 100);

    let mut stored = fx.attempts.find_by_id(attempt_id).await.unwrap().unwrap();
    stored.allow_retake = true;
    fx.attempts.update(&stored).await.unwrap();

    let t_retake = fx.t0 + Duration::seconds(300);
    let retake = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, t_retake)
        .await
        .unwrap();
    assert_eq!(retake.attempt.id, attempt_id);
    assert_eq!(retake.attempt.active_track, TrackId::Retake);
    assert_eq!(retake.attempt.retake_status, RetakeStatus::Running);
    assert_eq!(retake.attempt.retake_count, 1);
    // Prior answers carry over as the baseline; the clock starts fresh.
    let retake_track = retake.attempt.retake.as_ref().unwrap();
    assert_eq!(retake_track.answers, retake.attempt.primary.answers);
    assert_eq!(retake.timer.seconds_remaining, 120);
    assert!(retake_track.score.is_none());

    // Worsen one answer on the retake; the primary pass must not move.
    fx.service
        .save_progress_batch(
            fx.user,
            attempt_id,
            batch(vec![answer_event(subtest, 0, 1, 1, t_retake)]),
            t_retake + Duration::seconds(10),
        )
        .await
        .unwrap();
    let second_pass = fx
        .service
        .submit_attempt(
            fx.user,
            attempt_id,
            SubmitAttemptRequest { answers: None },
            t_retake + Duration::seconds(120),
        )
        .await
        .unwrap();

    assert_eq!(second_pass.score.as_ref().unwrap().score, 67);
    assert_eq!(second_pass.attempt.retake_status, RetakeStatus::Completed);
    assert_eq!(second_pass.attempt.primary.score.as_ref().unwrap().score, 100);

    let final_state = fx.attempts.find_by_id(attempt_id).await.unwrap().unwrap();
    assert_eq!(
        final_state.primary.answers[&subtest.id][&subtest.questions[0].id],
        subtest.questions[0].options[0].id
    );
}

#[tokio::test]
async fn legacy_countdown_seeds_a_missing_window() {
    let fx = fixture(&[2], 1);
    let attempt = TryoutAttempt::new(fx.user, fx.tryout_id, fx.t0);
    fx.attempts.insert(&attempt).await.unwrap();

    let now = fx.t0 + Duration::seconds(5);
    let response = fx
        .service
        .save_progress(
            fx.user,
            attempt.id,
            SaveProgressRequest {
                seconds_remaining: Some(45),
                ..save_req()
            },
            now,
        )
        .await
        .unwrap();

    assert_eq!(
        response.timer.subtest_deadline_at,
        now + Duration::seconds(45)
    );
    assert_eq!(response.timer.seconds_remaining, 45);
}

#[tokio::test]
async fn get_attempt_never_persists_a_synthesized_window() {
    let fx = fixture(&[2], 1);
    let attempt = TryoutAttempt::new(fx.user, fx.tryout_id, fx.t0);
    fx.attempts.insert(&attempt).await.unwrap();

    let peeked = fx
        .service
        .get_attempt(fx.user, fx.tryout_id, fx.t0 + Duration::seconds(5))
        .await
        .unwrap()
        .expect("attempt exists");
    assert_eq!(peeked.timer.seconds_remaining, 120);

    let stored = fx.attempts.find_by_id(attempt.id).await.unwrap().unwrap();
    assert!(stored.primary.subtest_deadline_at.is_none());

    // With nothing persisted, submission demands a save first.
    let err = fx
        .service
        .submit_attempt(
            fx.user,
            attempt.id,
            SubmitAttemptRequest { answers: None },
            fx.t0 + Duration::hours(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MalformedTimer(_)));
}

#[tokio::test]
async fn empty_completed_attempt_is_replaced_on_restart() {
    let fx = fixture(&[2], 1);
    let started = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, fx.t0)
        .await
        .unwrap();
    let first_id = started.attempt.id;

    fx.service
        .submit_attempt(
            fx.user,
            first_id,
            SubmitAttemptRequest { answers: None },
            fx.t0 + Duration::seconds(120),
        )
        .await
        .unwrap();

    let again = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, fx.t0 + Duration::seconds(200))
        .await
        .unwrap();
    assert_ne!(again.attempt.id, first_id);
    assert_eq!(again.attempt.status, AttemptStatus::Started);
}

#[tokio::test]
async fn attempts_are_owner_only() {
    let fx = fixture(&[2], 1);
    let started = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, fx.t0)
        .await
        .unwrap();

    let intruder = Uuid::new_v4();
    let err = fx
        .service
        .save_progress(intruder, started.attempt.id, save_req(), fx.t0)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Forbidden(_)));
}

#[tokio::test]
async fn saves_keep_the_stored_score_current_but_off_the_wire() {
    let fx = fixture(&[2], 2);
    let started = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, fx.t0)
        .await
        .unwrap();
    let attempt_id = started.attempt.id;
    let subtest = &fx.subtests[0];

    let saved = fx
        .service
        .save_progress_batch(
            fx.user,
            attempt_id,
            batch(vec![answer_event(subtest, 0, 0, 1, fx.t0)]),
            fx.t0 + Duration::seconds(10),
        )
        .await
        .unwrap();
    // A running track never serializes its score...
    assert!(saved.attempt.primary.score.is_none());

    // ...but the store already holds the graded state: one right answer
    // out of two questions.
    let stored = fx.attempts.find_by_id(attempt_id).await.unwrap().unwrap();
    let report = stored.primary.score.as_ref().expect("score recomputed on save");
    assert_eq!(report.score, 50);

    fx.service
        .save_progress_batch(
            fx.user,
            attempt_id,
            batch(vec![answer_event(subtest, 1, 0, 1, fx.t0 + Duration::seconds(15))]),
            fx.t0 + Duration::seconds(20),
        )
        .await
        .unwrap();
    let stored = fx.attempts.find_by_id(attempt_id).await.unwrap().unwrap();
    assert_eq!(stored.primary.score.as_ref().unwrap().score, 100);
}

#[tokio::test]
async fn batch_events_replay_in_timestamp_order() {
    let fx = fixture(&[2], 1);
    let started = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, fx.t0)
        .await
        .unwrap();
    let attempt_id = started.attempt.id;
    let subtest = &fx.subtests[0];
    let question = &subtest.questions[0];

    // Payload order is scrambled: the older, higher-revision event comes
    // last. Replay must sort by (client_ts, revision) so exactly one event
    // lands and the stale one is counted as discarded.
    let late_stale = answer_event(subtest, 0, 1, 1, fx.t0 + Duration::seconds(10));
    let early_fresh = answer_event(subtest, 0, 0, 2, fx.t0 + Duration::seconds(5));

    let response = fx
        .service
        .save_progress_batch(
            fx.user,
            attempt_id,
            batch(vec![late_stale, early_fresh]),
            fx.t0 + Duration::seconds(12),
        )
        .await
        .unwrap();

    assert_eq!(response.applied, 1);
    assert_eq!(response.discarded, 1);
    let kept = response.attempt.primary.answers[&subtest.id][&question.id];
    assert_eq!(kept, question.options[0].id);
}

#[tokio::test]
async fn resubmitting_a_closed_subtest_keeps_one_snapshot() {
    let fx = fixture(&[1, 1], 1);
    let started = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, fx.t0)
        .await
        .unwrap();
    let attempt_id = started.attempt.id;

    fx.service
        .submit_attempt(
            fx.user,
            attempt_id,
            SubmitAttemptRequest { answers: None },
            fx.t0 + Duration::seconds(61),
        )
        .await
        .unwrap();
    let stored = fx.attempts.find_by_id(attempt_id).await.unwrap().unwrap();
    assert_eq!(stored.primary.subtest_snapshots.len(), 1);

    // The client retries the subtest submission after a lost response.
    let again = fx
        .service
        .submit_attempt(
            fx.user,
            attempt_id,
            SubmitAttemptRequest { answers: None },
            fx.t0 + Duration::seconds(65),
        )
        .await
        .unwrap();
    assert_eq!(again.attempt.status, AttemptStatus::Started);

    let stored = fx.attempts.find_by_id(attempt_id).await.unwrap().unwrap();
    assert_eq!(stored.primary.subtest_snapshots.len(), 1);
    assert_eq!(stored.primary.exam_state, ExamState::Bridging);
}

#[tokio::test]
async fn resume_on_an_intact_window_is_a_pure_read() {
    let fx = fixture(&[2], 1);
    let started = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, fx.t0)
        .await
        .unwrap();
    let attempt_id = started.attempt.id;

    let resumed = fx
        .service
        .start_attempt(fx.user, fx.tryout_id, fx.t0 + Duration::seconds(30))
        .await
        .unwrap();
    assert_eq!(resumed.attempt.id, attempt_id);

    // The persisted window was reused verbatim, so nothing was written.
    let stored = fx.attempts.find_by_id(attempt_id).await.unwrap().unwrap();
    assert_eq!(stored.updated_at, fx.t0);

    // An attempt without a window does get one persisted on resume.
    let other_user = Uuid::new_v4();
    let bare = TryoutAttempt::new(other_user, fx.tryout_id, fx.t0);
    fx.attempts.insert(&bare).await.unwrap();
    fx.service
        .start_attempt(other_user, fx.tryout_id, fx.t0 + Duration::seconds(40))
        .await
        .unwrap();
    let stored = fx.attempts.find_by_id(bare.id).await.unwrap().unwrap();
    assert!(stored.primary.subtest_deadline_at.is_some());
    assert_eq!(stored.updated_at, fx.t0 + Duration::seconds(40));
}
