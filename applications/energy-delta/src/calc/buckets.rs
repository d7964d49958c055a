//! Bucket boundary generation.
//!
//! Fixed intervals are plain arithmetic on UTC instants. `month`, `quarter`
//! and `year` are stepped on the local wall clock of the interval timezone so
//! that a month bucket in `Europe/Berlin` starts at local midnight of the 1st.

use crate::models::{IntervalLength, IntervalSpec};
use chrono::{
    DateTime, Datelike, Duration, LocalResult, Months, NaiveDateTime, NaiveTime, Offset,
    TimeZone, Utc,
};
use chrono_tz::Tz;

/// How far back to look for the offset in force before a DST gap.
const DST_GAP_PROBE_HOURS: i64 = 3;

/// Ordered bucket boundaries covering `[start, end]`.
///
/// The first boundary is `start`, the last one is the first boundary `>= end`.
/// Returns an empty vector for an empty or inverted range, or when fewer than
/// two boundaries would result.
pub fn buckets(start: DateTime<Utc>, end: DateTime<Utc>, spec: &IntervalSpec) -> Vec<DateTime<Utc>> {
    if start >= end {
        return Vec::new();
    }

    let boundaries = match spec.length.calendar_months() {
        Some(months) => calendar_buckets(start, end, months, spec.timezone),
        None => fixed_buckets(start, end, spec.length.fixed_seconds().unwrap_or(0)),
    };

    if boundaries.len() < 2 {
        return Vec::new();
    }
    boundaries
}

fn fixed_buckets(start: DateTime<Utc>, end: DateTime<Utc>, seconds: u64) -> Vec<DateTime<Utc>> {
    let Ok(seconds) = i64::try_from(seconds) else {
        return Vec::new();
    };
    if seconds == 0 {
        return Vec::new();
    }
    let step = Duration::seconds(seconds);

    let mut out = vec![start];
    let mut current = start;
    while current < end {
        match current.checked_add_signed(step) {
            Some(next) => current = next,
            None => break,
        }
        out.push(current);
    }
    out
}

fn calendar_buckets(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    months: u32,
    tz: Tz,
) -> Vec<DateTime<Utc>> {
    let local_start = start.with_timezone(&tz).naive_local();
    let local_end = end.with_timezone(&tz).naive_local();

    let mut out = Vec::new();
    let mut k: u32 = 0;
    loop {
        // always offset from the anchor, so 31 Jan -> 28 Feb -> 31 Mar
        let Some(step) = months.checked_mul(k) else {
            break;
        };
        let Some(local) = local_start.checked_add_months(Months::new(step)) else {
            break;
        };
        out.push(localize(local, tz));
        if local >= local_end {
            break;
        }
        k += 1;
    }
    out
}

/// Convert a wall-clock time in `tz` to an absolute instant.
///
/// Ambiguous times (DST fold) resolve to the earlier instant; times inside a
/// DST gap are read with the offset in force before the gap, which moves
/// them forward by the gap length.
pub fn localize(local: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => dt.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let before = local - Duration::hours(DST_GAP_PROBE_HOURS);
            let offset = tz
                .offset_from_local_datetime(&before)
                .earliest()
                .map(|o| o.fix().local_minus_utc())
                .unwrap_or(0);
            Utc.from_utc_datetime(&(local - Duration::seconds(i64::from(offset))))
        }
    }
}

/// Start of the calendar period containing `instant`, used as the default
/// refresh start: local year start for `year`, local Monday midnight for
/// `week`, local midnight for `day`. Every other interval keeps `instant`.
pub fn period_start(instant: DateTime<Utc>, spec: &IntervalSpec) -> DateTime<Utc> {
    let local = instant.with_timezone(&spec.timezone).date_naive();
    let date = match spec.length {
        IntervalLength::Year => local.with_day(1).and_then(|d| d.with_month(1)),
        IntervalLength::Week => {
            Some(local - Duration::days(i64::from(local.weekday().num_days_from_monday())))
        }
        IntervalLength::Day => Some(local),
        _ => None,
    };
    match date {
        Some(date) => localize(date.and_time(NaiveTime::MIN), spec.timezone),
        None => instant,
    }
}
