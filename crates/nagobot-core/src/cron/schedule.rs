use std::collections::HashSet;

use anyhow::{bail, Result};
use chrono::{DateTime, Datelike, Duration, LocalResult, TimeZone, Timelike};

use super::types::{CronSchedule, ScheduleKind};

/// Search horizon for cron expressions: 366 days ahead.
const HORIZON_DAYS: i64 = 366;

/// Next run time in ms for a schedule, or 0 when there is none.
/// Fails on malformed schedules (bad cron expression, non-positive interval).
pub fn compute_next_run(schedule: &CronSchedule, now_ms: i64) -> Result<i64> {
    match schedule.kind {
        ScheduleKind::At => Ok(match schedule.at_ms {
            Some(t) if t > now_ms => t,
            _ => 0,
        }),
        ScheduleKind::Every => match schedule.every_ms {
            Some(interval) if interval > 0 => Ok(now_ms + interval),
            _ => bail!("every-schedule requires a positive everyMs"),
        },
        ScheduleKind::Cron => {
            let expr = schedule
                .expr
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("cron schedule missing expr"))?;
            let parsed = CronExpr::parse(expr)?;
            Ok(parsed.next_after(schedule.tz.as_deref().unwrap_or(""), now_ms))
        }
    }
}

/// A parsed 5-field cron expression (`minute hour dom month dow`).
/// A candidate time fires only when all five field sets match.
#[derive(Debug, Clone)]
pub struct CronExpr {
    minutes: HashSet<u32>,
    hours: HashSet<u32>,
    doms: HashSet<u32>,
    months: HashSet<u32>,
    dows: HashSet<u32>,
}

impl CronExpr {
    /// Parse an expression. Fields support `*`, `N`, `a-b`, `a-b/N`, `*/N`
    /// and comma lists; out-of-range values and malformed tokens are errors.
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            bail!("cron expression must have 5 fields, got {}", fields.len());
        }
        Ok(Self {
            minutes: parse_field(fields[0], 0, 59)?,
            hours: parse_field(fields[1], 0, 23)?,
            doms: parse_field(fields[2], 1, 31)?,
            months: parse_field(fields[3], 1, 12)?,
            dows: parse_field(fields[4], 0, 6)?,
        })
    }

    /// Smallest time strictly after `truncate(now, minute)` matching all
    /// five fields, evaluated in `tz` (IANA name; empty or unknown falls
    /// back to local time). Returns 0 when nothing matches within 366 days.
    pub fn next_after(&self, tz: &str, now_ms: i64) -> i64 {
        if tz.is_empty() {
            return self.next_in_zone(&chrono::Local, now_ms);
        }
        match tz.parse::<chrono_tz::Tz>() {
            Ok(zone) => self.next_in_zone(&zone, now_ms),
            Err(_) => {
                tracing::warn!("Unknown timezone '{tz}', using local time");
                self.next_in_zone(&chrono::Local, now_ms)
            }
        }
    }

    fn next_in_zone<Z: TimeZone>(&self, zone: &Z, now_ms: i64) -> i64 {
        let Some(start) = zone.timestamp_millis_opt(now_ms).earliest() else {
            return 0;
        };
        // Start from the next whole minute.
        let mut t =
            start - Duration::milliseconds(now_ms.rem_euclid(60_000)) + Duration::minutes(1);
        let end = t.clone() + Duration::days(HORIZON_DAYS);

        while t < end {
            let month = t.month();
            let day = t.day();
            let dow = t.weekday().num_days_from_sunday();
            let hour = t.hour();
            let minute = t.minute();

            if self.months.contains(&month)
                && self.doms.contains(&day)
                && self.dows.contains(&dow)
                && self.hours.contains(&hour)
                && self.minutes.contains(&minute)
            {
                return t.timestamp_millis();
            }

            // Jump by the coarsest non-matching unit.
            if !self.months.contains(&month) {
                let (y, m) = if month == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), month + 1)
                };
                match zone_time(zone, y, m, 1, 0, 0) {
                    Some(next) => t = next,
                    None => return 0,
                }
                continue;
            }
            if !self.doms.contains(&day) || !self.dows.contains(&dow) {
                let Some(d) = t.date_naive().succ_opt() else {
                    return 0;
                };
                match zone_time(zone, d.year(), d.month(), d.day(), 0, 0) {
                    Some(next) => t = next,
                    None => return 0,
                }
                continue;
            }
            if !self.hours.contains(&hour) {
                t = t + Duration::minutes(i64::from(60 - minute));
                continue;
            }
            t = t + Duration::minutes(1);
        }

        0
    }
}

/// Resolve a wall-clock time in a zone, taking the earlier side of DST
/// ambiguities and skipping forward over nonexistent times.
fn zone_time<Z: TimeZone>(
    zone: &Z,
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
) -> Option<DateTime<Z>> {
    match zone.with_ymd_and_hms(year, month, day, hour, minute, 0) {
        LocalResult::Single(t) => Some(t),
        LocalResult::Ambiguous(earlier, _) => Some(earlier),
        LocalResult::None if hour < 23 => zone
            .with_ymd_and_hms(year, month, day, hour + 1, minute, 0)
            .earliest(),
        LocalResult::None => None,
    }
}

/// Parse one cron field into its set of matching values.
fn parse_field(field: &str, min: u32, max: u32) -> Result<HashSet<u32>> {
    let mut result = HashSet::new();

    for part in field.split(',') {
        let part = part.trim();
        if part.is_empty() {
            bail!("empty cron field part in '{field}'");
        }

        if let Some(step_str) = part.strip_prefix("*/") {
            let step: u32 = step_str
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid step '{part}'"))?;
            if step == 0 {
                bail!("step must be positive in '{part}'");
            }
            let mut v = min;
            while v <= max {
                result.insert(v);
                v += step;
            }
            continue;
        }

        if part == "*" {
            result.extend(min..=max);
            continue;
        }

        if part.contains('-') {
            let (range, step) = match part.split_once('/') {
                Some((r, s)) => {
                    let step: u32 = s
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid step in '{part}'"))?;
                    if step == 0 {
                        bail!("step must be positive in '{part}'");
                    }
                    (r, step)
                }
                None => (part, 1),
            };
            let (lo_str, hi_str) = range
                .split_once('-')
                .ok_or_else(|| anyhow::anyhow!("invalid range '{part}'"))?;
            let lo: u32 = lo_str
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid range bound in '{part}'"))?;
            let hi: u32 = hi_str
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid range bound in '{part}'"))?;
            if lo < min || hi > max || lo > hi {
                bail!("range '{part}' outside {min}-{max}");
            }
            let mut v = lo;
            while v <= hi {
                result.insert(v);
                v += step;
            }
            continue;
        }

        let val: u32 = part
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid cron value '{part}'"))?;
        if val < min || val > max {
            bail!("value {val} outside {min}-{max}");
        }
        result.insert(val);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn ms(s: &str) -> i64 {
        DateTime::parse_from_rfc3339(s).unwrap().timestamp_millis()
    }

    fn next_utc(expr: &str, now: &str) -> i64 {
        CronExpr::parse(expr).unwrap().next_after("UTC", ms(now))
    }

    #[test]
    fn parse_accepts_standard_tokens() {
        assert!(CronExpr::parse("* * * * *").is_ok());
        assert!(CronExpr::parse("0 9 * * 1-5").is_ok());
        assert!(CronExpr::parse("*/15 0-12/2 1,15 * *").is_ok());
    }

    #[test]
    fn parse_rejects_malformed_expressions() {
        assert!(CronExpr::parse("* * * *").is_err()); // 4 fields
        assert!(CronExpr::parse("60 * * * *").is_err()); // minute out of range
        assert!(CronExpr::parse("* 24 * * *").is_err()); // hour out of range
        assert!(CronExpr::parse("* * 0 * *").is_err()); // dom below range
        assert!(CronExpr::parse("* * * 13 *").is_err()); // month out of range
        assert!(CronExpr::parse("* * * * 7").is_err()); // dow out of range
        assert!(CronExpr::parse("*/0 * * * *").is_err()); // zero step
        assert!(CronExpr::parse("a * * * *").is_err());
        assert!(CronExpr::parse("5-1 * * * *").is_err()); // inverted range
    }

    #[test]
    fn next_run_starts_at_the_following_minute() {
        // Every minute: fires at the next whole minute, not now.
        let now = "2026-03-02T10:15:30+00:00";
        assert_eq!(next_utc("* * * * *", now), ms("2026-03-02T10:16:00+00:00"));
    }

    #[test]
    fn next_run_daily_at_nine() {
        let now = "2026-03-02T10:15:00+00:00"; // past 09:00 today
        assert_eq!(next_utc("0 9 * * *", now), ms("2026-03-03T09:00:00+00:00"));

        let now = "2026-03-02T08:15:00+00:00"; // before 09:00 today
        assert_eq!(next_utc("0 9 * * *", now), ms("2026-03-02T09:00:00+00:00"));
    }

    #[test]
    fn next_run_respects_day_of_week() {
        // 2026-03-02 is a Monday; next Friday 17:00 is 2026-03-06.
        let now = "2026-03-02T10:00:00+00:00";
        assert_eq!(next_utc("0 17 * * 5", now), ms("2026-03-06T17:00:00+00:00"));
    }

    #[test]
    fn next_run_jumps_months() {
        // Only in December: from March, next is Dec 1 00:05.
        let now = "2026-03-02T10:00:00+00:00";
        assert_eq!(next_utc("5 0 1 12 *", now), ms("2026-12-01T00:05:00+00:00"));
    }

    #[test]
    fn all_five_fields_must_match() {
        // dom=1 AND dow=Monday: 2026-06-01 is the next 1st that is a Monday.
        let now = "2026-03-02T00:00:00+00:00";
        assert_eq!(next_utc("0 0 1 * 1", now), ms("2026-06-01T00:00:00+00:00"));
    }

    #[test]
    fn impossible_dates_return_zero_within_horizon() {
        // February 30th never exists.
        assert_eq!(next_utc("0 0 30 2 *", "2026-03-02T00:00:00+00:00"), 0);
    }

    #[test]
    fn step_lists_expand_correctly() {
        let sets = parse_field("*/15", 0, 59).unwrap();
        assert_eq!(sets, HashSet::from([0, 15, 30, 45]));

        let sets = parse_field("1-5/2", 0, 59).unwrap();
        assert_eq!(sets, HashSet::from([1, 3, 5]));

        let sets = parse_field("1,15,30", 1, 31).unwrap();
        assert_eq!(sets, HashSet::from([1, 15, 30]));
    }

    #[test]
    fn timezone_shifts_the_fire_time() {
        // 09:00 in New York (EST, UTC-5) is 14:00 UTC.
        let now = "2026-01-15T00:00:00+00:00";
        let next = CronExpr::parse("0 9 * * *")
            .unwrap()
            .next_after("America/New_York", ms(now));
        assert_eq!(next, ms("2026-01-15T14:00:00+00:00"));
    }

    #[test]
    fn at_schedule_fires_once_in_the_future() {
        let now = Utc::now().timestamp_millis();
        let future = now + 60_000;
        assert_eq!(
            compute_next_run(&CronSchedule::at(future), now).unwrap(),
            future
        );
        assert_eq!(
            compute_next_run(&CronSchedule::at(now - 60_000), now).unwrap(),
            0
        );
    }

    #[test]
    fn every_schedule_anchors_from_now() {
        let now = 1_000_000;
        assert_eq!(
            compute_next_run(&CronSchedule::every(30_000), now).unwrap(),
            now + 30_000
        );
        assert!(compute_next_run(&CronSchedule::every(0), now).is_err());
        assert!(compute_next_run(&CronSchedule::every(-5), now).is_err());
    }

    #[test]
    fn cron_schedule_requires_expression() {
        let schedule = CronSchedule {
            kind: ScheduleKind::Cron,
            at_ms: None,
            every_ms: None,
            expr: None,
            tz: None,
        };
        assert!(compute_next_run(&schedule, 0).is_err());
        assert!(compute_next_run(&CronSchedule::cron("not a cron", None), 0).is_err());
    }
}
