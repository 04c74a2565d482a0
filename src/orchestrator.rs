//! Per-run orchestration
//!
//! Walks the rules in order: due check, sunset lookup, message, delivery,
//! dedupe update. A failure on one rule never stops the others.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock::{ClockError, LocalClock};
use crate::dedupe::DedupeStore;
use crate::notify::{render_message, Delivery, Notifier};
use crate::redact;
use crate::rule::{Rule, RuleError, MINUTES_PER_DAY};
use crate::scheduler;
use crate::solar::{self, NoSunsetError};

/// Why a rule's display time could not be computed
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UpcomingError {
    #[error(transparent)]
    NoSunset(#[from] NoSunsetError),
    #[error(transparent)]
    Clock(#[from] ClockError),
    #[error(transparent)]
    Rule(#[from] RuleError),
}

/// The next announced time for a rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpcomingTime {
    /// Local noon of the event day, in UTC
    pub anchor: DateTime<Utc>,
    pub sunset: DateTime<Utc>,
    /// `sunset - lead`
    pub display: DateTime<Utc>,
    /// `display` as local `HH:MM`
    pub hhmm: String,
}

/// Compute anchor, sunset and display time for `rule` as seen at `now`
pub fn display_time(rule: &Rule, now: DateTime<Utc>) -> Result<UpcomingTime, UpcomingError> {
    let clock = LocalClock::new(rule.offset_minutes)?;
    let anchor = clock.next_occurrence_anchor(now, rule.event_weekday)?;
    let sunset = solar::sunset(anchor, rule.location)?;

    let lead_out_of_range = RuleError::LeadOutOfRange(rule.lead_minutes);
    if !(0..MINUTES_PER_DAY).contains(&rule.lead_minutes) {
        return Err(lead_out_of_range.into());
    }
    let display = sunset
        .checked_sub_signed(Duration::minutes(rule.lead_minutes))
        .ok_or(lead_out_of_range)?;

    Ok(UpcomingTime {
        anchor,
        sunset,
        display,
        hhmm: clock.format_hhmm(display),
    })
}

/// Outcome counts for one pass over the rules
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub due: usize,
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Process every rule once at `now`.
///
/// Rules are handled strictly in order; each delivery completes before the
/// next rule is looked at. The store is only updated for confirmed sends.
pub async fn run_once<S, N>(rules: &[Rule], now: DateTime<Utc>, store: &mut S, notifier: &N) -> RunSummary
where
    S: DedupeStore,
    N: Notifier,
{
    let mut summary = RunSummary::default();

    for rule in rules {
        let target = redact::identity(&rule.identity);
        let key = rule.dedupe_key();
        let last_fired = store.get(&key);

        if !scheduler::is_due(rule, now, last_fired) {
            debug!("{} ({}): not due", target, rule.schedule);
            summary.skipped += 1;
            continue;
        }
        summary.due += 1;

        let upcoming = match display_time(rule, now) {
            Ok(upcoming) => upcoming,
            Err(e) => {
                warn!("{} ({}): skipping this run: {}", target, rule.schedule, e);
                summary.failed += 1;
                continue;
            }
        };
        info!(
            "{} ({}): sunset {} -> display {} (offset {} min)",
            target, rule.schedule, upcoming.sunset, upcoming.hhmm, rule.offset_minutes
        );

        let message = render_message(rule.template.as_deref(), &upcoming.hhmm);
        let delivery = Delivery {
            identity: &rule.identity,
            hhmm: &upcoming.hhmm,
            message: &message,
        };

        match notifier.deliver(&delivery).await {
            Ok(()) => {
                store.set(&key, now);
                summary.sent += 1;
            }
            Err(e) => {
                error!("{} ({}): send failed: {:#}", target, rule.schedule, e);
                summary.failed += 1;
            }
        }
    }

    info!(
        "Run complete: {} due, {} sent, {} skipped, {} failed",
        summary.due, summary.sent, summary.skipped, summary.failed
    );
    summary
}

/// Upcoming display time for every rule, in rule order
pub fn preview(rules: &[Rule], now: DateTime<Utc>) -> Vec<(&Rule, Result<UpcomingTime, UpcomingError>)> {
    rules.iter().map(|rule| (rule, display_time(rule, now))).collect()
}
