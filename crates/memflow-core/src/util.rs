//! Name sanitation, GUID generation, base-52 symbolic key encoding, duration
//! and cron parsing, and the deterministic pseudo-random helper used to seed
//! replay-safe randomness from an execIndex.

use std::time::Duration;

use crate::error::MemFlowError;

const GUID_ALPHABET: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const SYM_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Sanitize a namespace/appId into the form persisted as a schema or key
/// segment: lowercase, non-alphanumeric collapsed to `_`, truncated to 63
/// characters, trailing `_` trimmed, empty input falls back to
/// `"connections"`.
pub fn sanitize_app_id(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push('_');
        }
    }
    out.truncate(63);
    while out.ends_with('_') {
        out.pop();
    }
    if out.is_empty() {
        "connections".to_string()
    } else {
        out
    }
}

/// A GUID in the external-interface form: `"H"` followed by 21 random
/// alphanumeric characters.
pub fn guid() -> String {
    let mut s = String::with_capacity(22);
    s.push('H');
    for _ in 0..21 {
        let idx = fastrand::usize(0..GUID_ALPHABET.len());
        s.push(GUID_ALPHABET[idx] as char);
    }
    s
}

/// Encode an index as a 3-character base-52 symbolic key (used to keep
/// attribute field names compact in the persisted store).
pub fn get_sym_key(mut n: u32) -> Result<String, MemFlowError> {
    const BASE: u32 = 52;
    const WIDTH: usize = 3;
    let max = BASE.pow(WIDTH as u32);
    if n >= max {
        return Err(MemFlowError::Backend(anyhow::anyhow!(
            "symbolic key index {n} exceeds base-52 width-{WIDTH} capacity"
        )));
    }
    let mut chars = [0u8; WIDTH];
    for slot in chars.iter_mut().rev() {
        *slot = SYM_ALPHABET[(n % BASE) as usize];
        n /= BASE;
    }
    Ok(String::from_utf8(chars.to_vec()).expect("ascii alphabet"))
}

/// Encode an index as a 2-character base-52 symbolic value key.
pub fn get_sym_val(mut n: u32) -> Result<String, MemFlowError> {
    const BASE: u32 = 52;
    const WIDTH: usize = 2;
    let max = BASE.pow(WIDTH as u32);
    if n >= max {
        return Err(MemFlowError::Backend(anyhow::anyhow!(
            "symbolic value index {n} exceeds base-52 width-{WIDTH} capacity"
        )));
    }
    let mut chars = [0u8; WIDTH];
    for slot in chars.iter_mut().rev() {
        *slot = SYM_ALPHABET[(n % BASE) as usize];
        n /= BASE;
    }
    Ok(String::from_utf8(chars.to_vec()).expect("ascii alphabet"))
}

/// Parse a human duration string ("5 seconds", "2 minutes", "1 hour",
/// "infinity") into a `Duration`. `infinity` returns `None`.
pub fn parse_duration(input: &str) -> Result<Option<Duration>, MemFlowError> {
    let trimmed = input.trim();
    if trimmed.eq_ignore_ascii_case("infinity") {
        return Ok(None);
    }
    let mut parts = trimmed.split_whitespace();
    let amount_str = parts
        .next()
        .ok_or_else(|| MemFlowError::Backend(anyhow::anyhow!("empty duration string")))?;
    let amount: f64 = amount_str
        .parse()
        .map_err(|_| MemFlowError::Backend(anyhow::anyhow!("invalid duration amount: {amount_str}")))?;
    let unit = parts.next().unwrap_or("seconds").to_ascii_lowercase();
    let seconds = match unit.trim_end_matches('s') {
        "second" | "sec" => amount,
        "minute" | "min" => amount * 60.0,
        "hour" | "hr" => amount * 3600.0,
        "day" => amount * 86400.0,
        "week" => amount * 604800.0,
        other => {
            return Err(MemFlowError::Backend(anyhow::anyhow!(
                "unknown duration unit: {other}"
            )))
        }
    };
    Ok(Some(Duration::from_secs_f64(seconds.max(0.0))))
}

/// A parsed 5-field cron expression (`minute hour day-of-month month
/// day-of-week`), each field either `*` or a set of explicit values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    minute: FieldMatch,
    hour: FieldMatch,
    day_of_month: FieldMatch,
    month: FieldMatch,
    day_of_week: FieldMatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FieldMatch {
    Any,
    Values(Vec<u32>),
}

impl FieldMatch {
    fn matches(&self, value: u32) -> bool {
        match self {
            FieldMatch::Any => true,
            FieldMatch::Values(values) => values.contains(&value),
        }
    }

    fn parse(field: &str) -> Result<Self, MemFlowError> {
        if field == "*" {
            return Ok(FieldMatch::Any);
        }
        let mut values = Vec::new();
        for part in field.split(',') {
            if let Some((start, end)) = part.split_once('-') {
                let start: u32 = start
                    .parse()
                    .map_err(|_| MemFlowError::Backend(anyhow::anyhow!("bad cron range: {part}")))?;
                let end: u32 = end
                    .parse()
                    .map_err(|_| MemFlowError::Backend(anyhow::anyhow!("bad cron range: {part}")))?;
                values.extend(start..=end);
            } else {
                let value: u32 = part
                    .parse()
                    .map_err(|_| MemFlowError::Backend(anyhow::anyhow!("bad cron field: {part}")))?;
                values.push(value);
            }
        }
        Ok(FieldMatch::Values(values))
    }
}

impl CronSchedule {
    pub fn parse(expr: &str) -> Result<Self, MemFlowError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(MemFlowError::Backend(anyhow::anyhow!(
                "cron expression must have exactly 5 fields, got {}",
                fields.len()
            )));
        }
        Ok(Self {
            minute: FieldMatch::parse(fields[0])?,
            hour: FieldMatch::parse(fields[1])?,
            day_of_month: FieldMatch::parse(fields[2])?,
            month: FieldMatch::parse(fields[3])?,
            day_of_week: FieldMatch::parse(fields[4])?,
        })
    }

    /// Seconds from `now` until the next matching minute, scanning forward
    /// minute-by-minute up to one year out.
    pub fn next_delay(&self, now: chrono::DateTime<chrono::Utc>) -> Result<Duration, MemFlowError> {
        use chrono::{Datelike, Timelike};

        let mut candidate = (now + chrono::Duration::minutes(1))
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .ok_or_else(|| MemFlowError::Backend(anyhow::anyhow!("invalid clock time")))?;

        for _ in 0..(60 * 24 * 366) {
            let weekday = candidate.weekday().num_days_from_sunday();
            if self.minute.matches(candidate.minute())
                && self.hour.matches(candidate.hour())
                && self.day_of_month.matches(candidate.day())
                && self.month.matches(candidate.month())
                && self.day_of_week.matches(weekday)
            {
                let delta = candidate - now;
                return Ok(Duration::from_secs(delta.num_seconds().max(0) as u64));
            }
            candidate += chrono::Duration::minutes(1);
        }
        Err(MemFlowError::Backend(anyhow::anyhow!(
            "no matching cron tick found within one year"
        )))
    }
}

/// Deterministic pseudo-random value in `[0, 1)`, identical across replays
/// for the same seed (typically `(execIndex, dimension hash)`).
pub fn random(seed: f64) -> f64 {
    let value = (seed.sin() * 10000.0).abs();
    value.fract()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_app_id() {
        assert_eq!(sanitize_app_id("My App!!"), "my_app");
        assert_eq!(sanitize_app_id(""), "connections");
        assert_eq!(sanitize_app_id("___"), "connections");
    }

    #[test]
    fn guid_has_expected_shape() {
        let id = guid();
        assert_eq!(id.len(), 22);
        assert!(id.starts_with('H'));
    }

    #[test]
    fn sym_key_round_trips_within_capacity() {
        assert_eq!(get_sym_key(0).unwrap().len(), 3);
        assert!(get_sym_key(52u32.pow(3)).is_err());
        assert_eq!(get_sym_val(0).unwrap().len(), 2);
        assert!(get_sym_val(52u32.pow(2)).is_err());
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(
            parse_duration("5 seconds").unwrap(),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            parse_duration("2 minutes").unwrap(),
            Some(Duration::from_secs(120))
        );
        assert_eq!(parse_duration("infinity").unwrap(), None);
        assert!(parse_duration("five seconds").is_err());
    }

    #[test]
    fn cron_finds_next_midnight() {
        let schedule = CronSchedule::parse("0 0 * * *").unwrap();
        let now = chrono::DateTime::parse_from_rfc3339("2026-07-28T10:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let delay = schedule.next_delay(now).unwrap();
        assert_eq!(delay, Duration::from_secs(14 * 3600));
    }

    #[test]
    fn random_is_deterministic_for_seed() {
        assert_eq!(random(42.0), random(42.0));
        assert!(random(42.0) >= 0.0 && random(42.0) < 1.0);
    }
}
