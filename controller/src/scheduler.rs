use chrono::{DateTime, Utc};
use cron::Schedule;
use snafu::{OptionExt, ResultExt};
use std::str::FromStr;

/// The module-wide result type.
type Result<T> = std::result::Result<T, scheduler_error::Error>;

/// A parsed refresh schedule, plus the due/not-due decision logic around it.
pub struct RefreshSchedule {
    schedule: Schedule,
}

/// The scheduler's answer for one reconcile tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleVerdict {
    /// Whether a refresh should begin now.
    pub due: bool,
    /// The first firing time after `now`; published to status for observability.
    pub next_fire: DateTime<Utc>,
}

impl RefreshSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let normalized = normalize_cron_expression(expression);
        let schedule =
            Schedule::from_str(&normalized).context(scheduler_error::InvalidScheduleSnafu {
                expression: expression.to_string(),
            })?;
        Ok(RefreshSchedule { schedule })
    }

    /// The first firing time strictly after the given instant.
    pub fn next_fire(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.schedule
            .after(&after)
            .next()
            .context(scheduler_error::ScheduleExhaustedSnafu)
    }

    /// A refresh is due when no previous refresh is recorded, or when `now` has reached the
    /// first firing time after the previous refresh.
    pub fn verdict(
        &self,
        last_refresh: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<ScheduleVerdict> {
        let next_fire = self.next_fire(now)?;
        let due = match last_refresh {
            None => true,
            Some(last) => now >= self.next_fire(last)?,
        };
        Ok(ScheduleVerdict { due, next_fire })
    }
}

/// Accepts conventional five-field cron expressions by prefixing a seconds field. Expressions
/// already carrying a seconds (and optionally a years) field pass through untouched.
fn normalize_cron_expression(expression: &str) -> String {
    if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression.trim())
    } else {
        expression.to_string()
    }
}

pub mod scheduler_error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Failed to parse cron expression '{}' due to '{}'", expression, source))]
        InvalidSchedule {
            expression: String,
            source: cron::error::Error,
        },

        #[snafu(display("The cron expression has no remaining firing times"))]
        ScheduleExhausted {},
    }
}
