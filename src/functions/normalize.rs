use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound, TimeZone, Utc};

use crate::config::Config;
use crate::error::{Error, Result};

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Turn a user-supplied send time into an absolute instant.
///
/// Users routinely supply ambiguous or already-past times (timezone
/// drift, stale UI), so already-due same-day inputs are pushed forward to
/// `now + snap_lead` instead of rejected. The hard floor of
/// `now + min_lead` still applies to whatever comes out.
///
/// Accepted shapes, tried in order:
/// - bare date (`2025-01-01`): today means `now + snap_lead`, any other
///   date means `morning_hour` local time on that date;
/// - RFC 3339 with explicit offset, taken as-is;
/// - date-time without an offset, interpreted in the configured zone.
pub fn normalize(raw: &str, now: DateTime<Utc>, config: &Config) -> Result<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidScheduleTime(raw.to_string()));
    }

    let tz = config.timezone;
    let today = now.with_timezone(&tz).date_naive();

    let target = if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if date == today {
            (now + config.snap_lead()).trunc_subsecs(0)
        } else {
            let morning = date
                .and_hms_opt(config.morning_hour, 0, 0)
                .ok_or_else(|| Error::InvalidScheduleTime(raw.to_string()))?;
            local_to_utc(&tz, morning).ok_or_else(|| Error::InvalidScheduleTime(raw.to_string()))?
        }
    } else if let Ok(explicit) = DateTime::parse_from_rfc3339(trimmed) {
        explicit.with_timezone(&Utc)
    } else {
        let naive = parse_naive(trimmed)
            .ok_or_else(|| Error::InvalidScheduleTime(raw.to_string()))?;
        local_to_utc(&tz, naive).ok_or_else(|| Error::InvalidScheduleTime(raw.to_string()))?
    };

    // already due but still on today's calendar: snap forward
    let target = if target < now && target.with_timezone(&tz).date_naive() == today {
        (now + config.snap_lead()).trunc_subsecs(0)
    } else {
        target
    };

    if target < now + config.min_lead() {
        return Err(Error::InvalidScheduleTime(raw.to_string()));
    }
    Ok(target)
}

fn parse_naive(raw: &str) -> Option<NaiveDateTime> {
    NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
}

fn local_to_utc(tz: &chrono_tz::Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    // earliest() resolves DST-ambiguous wall times; a nonexistent wall
    // time (spring-forward gap) stays None and the input is rejected
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}
