/// Weekly schedule matching and the watch-mode loop
///
/// A rule is due when the local time is inside a forward-only window after
/// its scheduled weekday/time, and it has not fired within the cooldown.

use chrono::{DateTime, Timelike, Utc};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::LocalClock;
use crate::rule::{Rule, MINUTES_PER_DAY};

/// Tolerance after the scheduled minute; must exceed the polling interval
pub const WINDOW_MINUTES: i64 = 15;

/// Minimum interval between two firings of the same rule (12 hours)
pub const COOLDOWN_SECS: i64 = 12 * 60 * 60;

pub const MINUTES_PER_WEEK: i64 = 7 * MINUTES_PER_DAY;

/// Minutes elapsed since the most recent scheduled moment, in 0..MINUTES_PER_WEEK
pub fn minutes_since_scheduled(now_week_minutes: i64, sched_week_minutes: i64) -> i64 {
    (now_week_minutes - sched_week_minutes).rem_euclid(MINUTES_PER_WEEK)
}

/// Testable version: is `now` inside the window that opens at the scheduled minute?
pub fn is_in_window_at(now_week_minutes: i64, sched_week_minutes: i64) -> bool {
    minutes_since_scheduled(now_week_minutes, sched_week_minutes) < WINDOW_MINUTES
}

/// True when `last_fired` is absent or strictly more than the cooldown ago.
/// A `last_fired` in the future counts as still cooling down.
pub fn cooldown_elapsed(now: DateTime<Utc>, last_fired: Option<DateTime<Utc>>) -> bool {
    match last_fired {
        None => true,
        Some(last) => now - last > chrono::Duration::seconds(COOLDOWN_SECS),
    }
}

/// Decide whether `rule` should fire at `now`
pub fn is_due(rule: &Rule, now: DateTime<Utc>, last_fired: Option<DateTime<Utc>>) -> bool {
    let clock = match LocalClock::new(rule.offset_minutes) {
        Ok(clock) => clock,
        Err(e) => {
            warn!("Rule has unusable offset: {}", e);
            return false;
        }
    };

    let local = clock.wall_clock(now);
    if !is_in_window_at(local.week_minutes(), rule.schedule.week_minutes()) {
        return false;
    }
    if !cooldown_elapsed(now, last_fired) {
        debug!("Inside window but still cooling down (last fired {:?})", last_fired);
        return false;
    }
    true
}

/// Minutes until the next scheduled minute strictly after the current one
pub fn minutes_until_next_at(now_week_minutes: i64, sched_week_minutes: i64) -> i64 {
    let minutes = (sched_week_minutes - now_week_minutes).rem_euclid(MINUTES_PER_WEEK);
    if minutes == 0 {
        MINUTES_PER_WEEK
    } else {
        minutes
    }
}

/// How long to sleep before the next check: until the earliest upcoming
/// scheduled minute among `rules`, capped by `poll_interval`, at least 1s
pub fn time_until_next_check(rules: &[Rule], now: DateTime<Utc>, poll_interval: Duration) -> Duration {
    let second = now.second() as i64;

    let earliest = rules
        .iter()
        .filter_map(|rule| {
            let clock = LocalClock::new(rule.offset_minutes).ok()?;
            let local = clock.wall_clock(now);
            let minutes = minutes_until_next_at(local.week_minutes(), rule.schedule.week_minutes());
            Some((minutes * 60 - second).max(1) as u64)
        })
        .min()
        .map(Duration::from_secs)
        .unwrap_or(poll_interval);

    earliest.min(poll_interval).max(Duration::from_secs(1))
}

/// Format duration for logging
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;

    if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}

/// Run the watch loop until `cancel` fires.
///
/// Each cycle hands `state` and the current instant to `check_fn` and takes
/// the state back from it, then sleeps until the next scheduled minute or
/// `poll_interval`, whichever comes first. The final state is returned so the
/// caller can flush it.
pub async fn run_scheduler<S, F, Fut>(
    rules: &[Rule],
    poll_interval: Duration,
    cancel: CancellationToken,
    mut state: S,
    mut check_fn: F,
) -> S
where
    F: FnMut(S, DateTime<Utc>) -> Fut,
    Fut: std::future::Future<Output = S>,
{
    info!(
        "Scheduler started ({} rules, polling every {})",
        rules.len(),
        format_duration(poll_interval)
    );

    while !cancel.is_cancelled() {
        state = check_fn(state, Utc::now()).await;

        let wait = time_until_next_check(rules, Utc::now(), poll_interval);
        info!("Next check in {}", format_duration(wait));

        tokio::select! {
            _ = sleep(wait) => {}
            _ = cancel.cancelled() => {
                info!("Scheduler stopping");
                break;
            }
        }
    }

    state
}



/// Kani formal verification proofs
#[cfg(kani)]
mod kani_proofs {
    use super::*;

    #[kani::proof]
    fn minutes_since_scheduled_in_range() {
        let now: i64 = kani::any();
        kani::assume(now >= 0 && now < MINUTES_PER_WEEK);
        let sched: i64 = kani::any();
        kani::assume(sched >= 0 && sched < MINUTES_PER_WEEK);

        let diff = minutes_since_scheduled(now, sched);
        kani::assert(diff >= 0 && diff < MINUTES_PER_WEEK, "diff must be a minute of the week");
    }

    #[kani::proof]
    fn window_implies_small_forward_gap() {
        let now: i64 = kani::any();
        kani::assume(now >= 0 && now < MINUTES_PER_WEEK);
        let sched: i64 = kani::any();
        kani::assume(sched >= 0 && sched < MINUTES_PER_WEEK);

        if is_in_window_at(now, sched) {
            let forward = (now - sched + MINUTES_PER_WEEK) % MINUTES_PER_WEEK;
            kani::assert(forward < WINDOW_MINUTES, "window must only open after the schedule");
        }
    }
}
