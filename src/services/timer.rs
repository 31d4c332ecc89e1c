use chrono::{DateTime, Duration, Utc};

use crate::models::attempt::AttemptTrack;
use crate::models::tryout::Subtest;
use crate::utils::time::remaining_seconds;

pub const DEFAULT_SUBTEST_MINUTES: i64 = 20;

/// The server-issued timing triplet for one subtest. Clients only display a
/// countdown derived from it; they are never trusted for deadline math.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerWindow {
    pub subtest_started_at: DateTime<Utc>,
    pub subtest_deadline_at: DateTime<Utc>,
    pub seconds_remaining: i64,
}

impl TimerWindow {
    pub fn apply_to(&self, track: &mut AttemptTrack) {
        track.subtest_started_at = Some(self.subtest_started_at);
        track.subtest_deadline_at = Some(self.subtest_deadline_at);
        track.seconds_remaining = Some(self.seconds_remaining);
    }

    /// Whether persisting this window onto the track would change anything
    /// besides the derived countdown cache.
    pub fn differs_from(&self, track: &AttemptTrack) -> bool {
        track.subtest_started_at != Some(self.subtest_started_at)
            || track.subtest_deadline_at != Some(self.subtest_deadline_at)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TimerOptions {
    pub force_reset: bool,
    /// Deliberate one-shot trust exception: a legacy client's reported
    /// countdown seeds the fresh window, but only while the track is still
    /// on the same subtest index and the value is positive. Do not widen.
    pub legacy_seconds_remaining: Option<i64>,
}

/// Resolves the start/deadline window for `target_subtest` on a track.
///
/// Reuses the persisted window when it already corresponds to the target
/// index and is well-formed; otherwise issues a fresh one from the subtest's
/// configured duration (in subtest order), falling back to 20 minutes.
pub fn resolve_timer_window(
    track: &AttemptTrack,
    subtests: &[Subtest],
    target_subtest: i32,
    now: DateTime<Utc>,
    options: TimerOptions,
) -> TimerWindow {
    if !options.force_reset && track.current_subtest == target_subtest {
        if let (Some(started), Some(deadline)) =
            (track.subtest_started_at, track.subtest_deadline_at)
        {
            if started <= deadline {
                return TimerWindow {
                    subtest_started_at: started,
                    subtest_deadline_at: deadline,
                    seconds_remaining: remaining_seconds(deadline, now),
                };
            }
        }
    }

    let duration_secs = match options.legacy_seconds_remaining {
        Some(secs) if secs > 0 && track.current_subtest == target_subtest => secs,
        _ => configured_duration_secs(subtests, target_subtest),
    };

    let deadline = now + Duration::seconds(duration_secs);
    TimerWindow {
        subtest_started_at: now,
        subtest_deadline_at: deadline,
        seconds_remaining: remaining_seconds(deadline, now),
    }
}

fn configured_duration_secs(subtests: &[Subtest], index: i32) -> i64 {
    usize::try_from(index)
        .ok()
        .and_then(|i| subtests.get(i))
        .map(|subtest| i64::from(subtest.duration_minutes))
        .filter(|minutes| *minutes > 0)
        .unwrap_or(DEFAULT_SUBTEST_MINUTES)
        * 60
}
