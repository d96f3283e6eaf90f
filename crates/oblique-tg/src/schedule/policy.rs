use crate::prelude::*;
use crate::Result;
use chrono::prelude::*;
use rand::Rng;
use serde::Deserialize;
use std::ops::RangeInclusive;

const HOURS_PER_DAY: u32 = 24;

/// The notifications are meant to arrive during the daytime of a single
/// household, so the night window is computed in one fixed time zone.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Config {
    #[serde(default = "default_time_zone")]
    pub(crate) time_zone: chrono_tz::Tz,

    #[serde(default = "default_min_delay_hours")]
    pub(crate) min_delay_hours: u32,

    #[serde(default = "default_max_delay_hours")]
    pub(crate) max_delay_hours: u32,

    #[serde(default = "default_day_start_hour")]
    pub(crate) day_start_hour: u32,

    #[serde(default = "default_day_end_hour")]
    pub(crate) day_end_hour: u32,

    /// The periodic trigger may fire several times for a single tick.
    /// Invocations that happen within this window after the latest
    /// notification are considered duplicates and are skipped.
    #[serde(default = "default_duplicate_window_secs")]
    pub(crate) duplicate_window_secs: i64,
}

fn default_time_zone() -> chrono_tz::Tz {
    chrono_tz::US::Pacific
}

fn default_min_delay_hours() -> u32 {
    4
}

fn default_max_delay_hours() -> u32 {
    6
}

fn default_day_start_hour() -> u32 {
    8
}

fn default_day_end_hour() -> u32 {
    23
}

fn default_duplicate_window_secs() -> i64 {
    3 * 60
}

impl Default for Config {
    fn default() -> Self {
        Self {
            time_zone: default_time_zone(),
            min_delay_hours: default_min_delay_hours(),
            max_delay_hours: default_max_delay_hours(),
            day_start_hour: default_day_start_hour(),
            day_end_hour: default_day_end_hour(),
            duplicate_window_secs: default_duplicate_window_secs(),
        }
    }
}

/// Decides when the control loop should run next, and whether the
/// current invocation is a duplicate of a recent one.
#[derive(Debug, Clone)]
pub(crate) struct DelayPolicy {
    cfg: Config,
}

impl DelayPolicy {
    pub(crate) fn new(cfg: Config) -> Result<Self> {
        let Config {
            min_delay_hours,
            max_delay_hours,
            day_start_hour,
            day_end_hour,
            duplicate_window_secs,
            time_zone: _,
        } = cfg;

        if min_delay_hours == 0 {
            return Err(fatal!("Min delay must be at least one hour"));
        }
        if min_delay_hours > max_delay_hours {
            return Err(fatal!(
                "Min delay ({min_delay_hours}h) must not exceed max delay ({max_delay_hours}h)"
            ));
        }
        if max_delay_hours > day_end_hour {
            return Err(fatal!(
                "Max delay ({max_delay_hours}h) must not exceed the day end hour ({day_end_hour})"
            ));
        }
        if !(day_start_hour < day_end_hour && day_end_hour < HOURS_PER_DAY) {
            return Err(fatal!(
                "Day window is invalid, expected 0 <= start < end < {HOURS_PER_DAY}, \
                but got start: {day_start_hour}, end: {day_end_hour}"
            ));
        }
        if duplicate_window_secs < 0 {
            return Err(fatal!(
                "Duplicate suppression window must not be negative: {duplicate_window_secs}"
            ));
        }

        Ok(Self { cfg })
    }

    /// Number of extra hours to push the next run by, so that it lands into
    /// the next day's daytime window. It's zero when even the maximum delay
    /// from `current_hour` doesn't reach the night.
    pub(crate) fn postpone_hours(&self, current_hour: u32) -> u32 {
        let Config {
            min_delay_hours,
            max_delay_hours,
            day_start_hour,
            day_end_hour,
            ..
        } = self.cfg;

        if current_hour > day_end_hour - max_delay_hours {
            return (HOURS_PER_DAY - current_hour + day_start_hour).saturating_sub(min_delay_hours);
        }
        0
    }

    pub(crate) fn delay_range_minutes(&self, current_hour: u32) -> RangeInclusive<u32> {
        let postpone = self.postpone_hours(current_hour);
        let min = (postpone + self.cfg.min_delay_hours) * 60;
        let max = (postpone + self.cfg.max_delay_hours) * 60;
        min..=max
    }

    /// Uniformly random delay in minutes until the next run
    pub(crate) fn next_delay_minutes(&self, now: DateTime<Utc>, rng: &mut impl Rng) -> u32 {
        let local_hour = now.with_timezone(&self.cfg.time_zone).hour();
        let range = self.delay_range_minutes(local_hour);

        debug!(
            local_hour,
            time_zone = %self.cfg.time_zone,
            postpone_hours = self.postpone_hours(local_hour),
            "Computing the next delay"
        );

        rng.gen_range(range)
    }

    /// The boundary is inclusive: an invocation exactly at the window end
    /// is still a duplicate.
    pub(crate) fn is_duplicate(&self, secs_since_last_run: i64) -> bool {
        secs_since_last_run <= self.cfg.duplicate_window_secs
    }
}
