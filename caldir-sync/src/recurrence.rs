//! RRULE expansion for recurring masters.
//!
//! Expands a master into the start times of its occurrences within a window.
//! Overrides are not applied here; that is the timeline's job.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use rrule::RRuleSet;

use crate::constants::SYNTHETIC_ID_DELIMITER;
use crate::error::RecurrenceError;
use crate::event::{EventRecord, EventTime};

/// Id of a generated occurrence: `<master>_<YYYYMMDD>` for all-day series,
/// `<master>_<YYYYMMDDTHHMMSSZ>` otherwise. Matches the ids the remote gives
/// its own exception records.
pub fn occurrence_id(master_id: &str, start: &EventTime) -> String {
    let suffix = match start {
        EventTime::Date(d) => d.format("%Y%m%d").to_string(),
        EventTime::DateTime(dt) => dt.format("%Y%m%dT%H%M%SZ").to_string(),
    };
    format!("{master_id}{SYNTHETIC_ID_DELIMITER}{suffix}")
}

fn format_date_utc(d: &NaiveDate) -> String {
    format!("{}T000000Z", d.format("%Y%m%d"))
}

/// DTSTART line. All-day series run at midnight UTC; timed series with a
/// known zone run in that zone so wall-clock time survives DST changes.
fn dtstart_line(master: &EventRecord) -> String {
    match (&master.start, &master.time_zone) {
        (EventTime::Date(d), _) => format!("DTSTART:{}", format_date_utc(d)),
        (EventTime::DateTime(dt), Some(tzid)) => match tzid.parse::<chrono_tz::Tz>() {
            Ok(tz) => format!(
                "DTSTART;TZID={}:{}",
                tzid,
                dt.with_timezone(&tz).format("%Y%m%dT%H%M%S")
            ),
            Err(_) => format!("DTSTART:{}", dt.format("%Y%m%dT%H%M%SZ")),
        },
        (EventTime::DateTime(dt), None) => format!("DTSTART:{}", dt.format("%Y%m%dT%H%M%SZ")),
    }
}

/// Rewrite UNTIL so the rrule parser accepts it: a bare date means the end
/// of that day in UTC, a floating date-time is read as UTC.
fn normalize_until(rule: &str) -> String {
    rule.split(';')
        .map(|part| match part.split_once('=') {
            Some((key, value)) if key.eq_ignore_ascii_case("UNTIL") => {
                if value.len() == 8 && value.bytes().all(|b| b.is_ascii_digit()) {
                    format!("UNTIL={value}T235959Z")
                } else if !value.ends_with('Z') {
                    format!("UNTIL={value}Z")
                } else {
                    part.to_string()
                }
            }
            _ => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}

/// `EXDATE;VALUE=DATE:20240101,20240102` becomes midnight UTC instants to
/// line up with an all-day DTSTART.
fn normalize_date_list(name: &str, params: &str, values: &str) -> Option<String> {
    if !params.eq_ignore_ascii_case("VALUE=DATE") {
        return None;
    }
    let dates: Vec<String> = values
        .split(',')
        .map(|v| format!("{}T000000Z", v.trim()))
        .collect();
    Some(format!("{name}:{}", dates.join(",")))
}

fn normalize_line(line: &str) -> String {
    let line = line.trim();
    let Some((head, value)) = line.split_once(':') else {
        return line.to_string();
    };
    let (name, params) = head.split_once(';').unwrap_or((head, ""));

    match name.to_ascii_uppercase().as_str() {
        "RRULE" | "EXRULE" => format!("{head}:{}", normalize_until(value)),
        "EXDATE" | "RDATE" => {
            normalize_date_list(name, params, value).unwrap_or_else(|| line.to_string())
        }
        _ => line.to_string(),
    }
}

/// Build an iCalendar-format rule set string for the rrule crate parser.
fn build_rrule_string(master: &EventRecord, lines: &[String]) -> String {
    let mut out = vec![dtstart_line(master)];
    out.extend(lines.iter().map(|l| normalize_line(l)));
    out.join("\n")
}

/// Parse the master's recurrence lines into a rule set.
pub fn rule_set(master: &EventRecord) -> Result<RRuleSet, RecurrenceError> {
    let lines = match &master.kind {
        crate::event::EventKind::RecurringMaster { rule } => rule.lines(),
        _ => {
            return Err(RecurrenceError {
                event_id: master.id.clone(),
                reason: "not a recurring master".into(),
            });
        }
    };

    build_rrule_string(master, lines)
        .parse::<RRuleSet>()
        .map_err(|e| RecurrenceError {
            event_id: master.id.clone(),
            reason: e.to_string(),
        })
}

/// Start times of the master's occurrences with start in `[from, to)`,
/// ascending, at most `limit` of them. All-day starts count from midnight
/// in `zone`.
pub fn expand_starts(
    master: &EventRecord,
    zone: Tz,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    limit: u16,
) -> Result<Vec<EventTime>, RecurrenceError> {
    if from >= to {
        return Ok(Vec::new());
    }
    let rrule_set = rule_set(master)?;

    // All-day series are generated at midnight UTC; a day either side
    // covers every zone's midnight.
    let slack = if master.start.is_all_day() {
        Duration::days(1)
    } else {
        Duration::zero()
    };

    // after/before are exclusive; pad by a second and filter exactly below.
    let tz: rrule::Tz = Utc.into();
    let pad = slack + Duration::seconds(1);
    let after = from
        .checked_sub_signed(pad)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
        .with_timezone(&tz);
    let before = to
        .checked_add_signed(pad)
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
        .with_timezone(&tz);

    let result = rrule_set.after(after).before(before).all(limit);
    if result.limited {
        tracing::debug!(event_id = %master.id, limit, "recurrence expansion hit limit");
    }

    Ok(result
        .dates
        .iter()
        .map(|dt| dt.with_timezone(&Utc))
        .map(|dt| match master.start {
            EventTime::Date(_) => EventTime::Date(dt.date_naive()),
            EventTime::DateTime(_) => EventTime::DateTime(dt),
        })
        .filter(|start| {
            let at = start.instant_in(zone);
            at >= from && at < to
        })
        .collect())
}
