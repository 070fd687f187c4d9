//! Cron expression handling for reschedule (§4.5 "Reschedule", §4.1/§6
//! cron semantics). Grounded in the source's `scheduler.rs`
//! (`cron::Schedule::from_str` + `.after(&now).next()`), but the source
//! only ever reads a `Schedule` back out for its own leader-elected poll
//! loop; here the computed next-fire time is the authoritative value
//! written back into the Redis time index, so invalid expressions must be
//! surfaced as an error the dispatcher can act on instead of silently
//! producing no next run.

use chrono::{DateTime, Utc};
use cron::Schedule;
use milvaion_core::{MilvaionError, MilvaionResult};
use std::str::FromStr;

/// Parses a 5- or 6-field UTC cron expression. The `cron` crate expects
/// 6 fields (seconds-first); a 5-field expression is widened by
/// prepending a `0` seconds field so minute-precision expressions still
/// parse, matching spec §6 ("6-field expressions take precedence when
/// present" implies 5-field ones are accepted too).
pub fn parse(expression: &str) -> MilvaionResult<Schedule> {
    let normalized = normalize(expression);
    Schedule::from_str(&normalized)
        .map_err(|e| MilvaionError::InvalidCron(expression.to_string(), e.to_string()))
}

fn normalize(expression: &str) -> String {
    let field_count = expression.split_whitespace().count();
    if field_count == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

/// Computes the next fire time strictly after `from`, in UTC. `None` means
/// the expression has no future occurrence (a cron expression describing
/// only times already past is not a case the `cron` crate can produce for
/// standard fields, but the caller treats `None` the same as an invalid
/// expression: remove from the index).
pub fn next_fire_after(schedule: &Schedule, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&from).next()
}

/// Validates and computes the next fire time in one call — the shape the
/// dispatcher's reschedule step actually wants.
pub fn next_fire_time(expression: &str, from: DateTime<Utc>) -> MilvaionResult<Option<DateTime<Utc>>> {
    let schedule = parse(expression)?;
    Ok(next_fire_after(&schedule, from))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_expression_parses_via_widening() {
        let result = parse("*/5 * * * *");
        assert!(result.is_ok());
    }

    #[test]
    fn six_field_expression_parses_directly() {
        let result = parse("0 */5 * * * *");
        assert!(result.is_ok());
    }

    #[test]
    fn invalid_expression_is_rejected() {
        let result = parse("not a cron expression");
        assert!(matches!(result, Err(MilvaionError::InvalidCron(_, _))));
    }

    #[test]
    fn next_fire_time_is_strictly_in_the_future() {
        let now = Utc::now();
        let next = next_fire_time("*/5 * * * *", now).unwrap().unwrap();
        assert!(next > now);
    }

    #[test]
    fn next_fire_time_advances_past_provided_instant() {
        let now = Utc::now();
        let first = next_fire_time("* * * * *", now).unwrap().unwrap();
        let second = next_fire_time("* * * * *", first).unwrap().unwrap();
        assert!(second > first);
    }
}
