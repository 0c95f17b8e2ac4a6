//! Time-to-live handling for lab resources.
//!
//! Every resource carries a `delete_after` label computed once, at creation
//! time, as `now + ttl`. The instant is truncated to the minute and encoded in
//! UTC with a lexically sortable format so labels compare correctly as plain
//! strings. Deletion is refused before that instant unless forced.

use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Timelike, Utc};
use thiserror::Error;

/// `chrono` format used for the `delete_after` label (`2026-10-16-14-05`).
pub const DELETE_AFTER_FORMAT: &str = "%Y-%m-%d-%H-%M";

/// TTL applied when a lab does not specify one.
pub const DEFAULT_TTL: &str = "1h";

/// Errors raised while parsing a TTL string.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TtlError {
    /// Raised when the TTL is blank.
    #[error("ttl must not be empty")]
    Empty,
    /// Raised when the TTL cannot be parsed or is not positive.
    #[error("invalid ttl `{value}`: {reason}")]
    Invalid {
        /// TTL string as supplied by the caller.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// Raised when `now + ttl` falls outside the representable range.
    #[error("ttl `{value}` overflows the supported date range")]
    Overflow {
        /// TTL string as supplied by the caller.
        value: String,
    },
}

impl TtlError {
    fn invalid(value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            value: value.to_owned(),
            reason: reason.into(),
        }
    }
}

const NANOS_PER_SECOND: u128 = 1_000_000_000;

/// Length of one `unit` in nanoseconds.
const fn unit_nanos(unit: &str) -> Option<u128> {
    let nanos = match unit.as_bytes() {
        b"ns" => 1,
        // `µs` is U+00B5 and `μs` is U+03BC.
        b"us" | b"\xc2\xb5s" | b"\xce\xbcs" => 1_000,
        b"ms" => 1_000_000,
        b"s" => NANOS_PER_SECOND,
        b"m" => 60 * NANOS_PER_SECOND,
        b"h" => 3_600 * NANOS_PER_SECOND,
        b"d" => 86_400 * NANOS_PER_SECOND,
        _ => return None,
    };
    Some(nanos)
}

fn take_while(chars: &mut Peekable<Chars<'_>>, keep: impl Fn(char) -> bool) -> String {
    let mut taken = String::new();
    while let Some(ch) = chars.next_if(|next| keep(*next)) {
        taken.push(ch);
    }
    taken
}

/// Scales `whole.fraction` units of `scale` nanoseconds, truncating digits
/// finer than one nanosecond.
fn component_nanos(whole: &str, fraction: &str, scale: u128) -> Option<u128> {
    let mut nanos = if whole.is_empty() {
        0
    } else {
        whole.parse::<u128>().ok()?.checked_mul(scale)?
    };
    let mut place = scale;
    for digit in fraction.chars().filter_map(|ch| ch.to_digit(10)) {
        place = place.checked_div(10)?;
        nanos = nanos.checked_add(u128::from(digit).checked_mul(place)?)?;
    }
    Some(nanos)
}

/// Parses a TTL such as `2h`, `1h30m`, `1.5h` or `3d`.
///
/// Accepts the Go duration grammar without a sign: one or more decimal
/// amounts, each followed by a unit out of `ns`, `us` (or `µs`), `ms`, `s`,
/// `m` and `h`. `d` is also accepted and means 24 hours. Amounts may carry a
/// fraction (`.5h`, `2.25m`).
///
/// # Errors
///
/// Returns [`TtlError::Empty`] for blank input and [`TtlError::Invalid`] for
/// unknown units, dangling numbers, or a non-positive total.
pub fn parse_ttl(value: &str) -> Result<TimeDelta, TtlError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(TtlError::Empty);
    }

    let out_of_range = || TtlError::invalid(trimmed, "amount out of range");
    let mut total: u128 = 0;
    let mut chars = trimmed.chars().peekable();
    while chars.peek().is_some() {
        let whole = take_while(&mut chars, |ch| ch.is_ascii_digit());
        let fraction = if chars.next_if_eq(&'.').is_some() {
            take_while(&mut chars, |ch| ch.is_ascii_digit())
        } else {
            String::new()
        };
        let unit = take_while(&mut chars, |ch| !ch.is_ascii_digit() && ch != '.');
        if whole.is_empty() && fraction.is_empty() {
            return Err(TtlError::invalid(trimmed, format!("unit `{unit}` has no amount")));
        }
        if unit.is_empty() {
            return Err(TtlError::invalid(trimmed, "missing unit after amount"));
        }
        let scale = unit_nanos(&unit)
            .ok_or_else(|| TtlError::invalid(trimmed, format!("unknown unit `{unit}`")))?;
        let component = component_nanos(&whole, &fraction, scale).ok_or_else(out_of_range)?;
        total = total.checked_add(component).ok_or_else(out_of_range)?;
    }

    if total == 0 {
        return Err(TtlError::invalid(trimmed, "ttl must be positive"));
    }
    let nanos = i64::try_from(total).map_err(|_| out_of_range())?;
    Ok(TimeDelta::nanoseconds(nanos))
}

/// Computes the `delete_after` instant for a resource created at `now`.
///
/// # Errors
///
/// Returns [`TtlError`] when the TTL is invalid or the sum overflows.
pub fn delete_after_from(now: DateTime<Utc>, ttl: &str) -> Result<DateTime<Utc>, TtlError> {
    let delta = parse_ttl(ttl)?;
    let expiry = now
        .checked_add_signed(delta)
        .ok_or_else(|| TtlError::Overflow {
            value: ttl.trim().to_owned(),
        })?;
    Ok(truncate_to_minute(expiry))
}

/// Drops seconds and sub-second precision.
#[must_use]
pub fn truncate_to_minute(instant: DateTime<Utc>) -> DateTime<Utc> {
    instant
        .with_second(0)
        .and_then(|value| value.with_nanosecond(0))
        .unwrap_or(instant)
}

/// Encodes a `delete_after` instant for use as a label value.
#[must_use]
pub fn format_delete_after(instant: DateTime<Utc>) -> String {
    instant.format(DELETE_AFTER_FORMAT).to_string()
}

/// Decodes a `delete_after` label value, returning `None` when malformed.
#[must_use]
pub fn parse_delete_after(value: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value.trim(), DELETE_AFTER_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Returns the instant deletion becomes allowed when it must be refused now.
///
/// Deletion is allowed when `force` is set, when no `delete_after` is known,
/// or when `now >= delete_after`.
#[must_use]
pub fn refused_until(
    delete_after: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    force: bool,
) -> Option<DateTime<Utc>> {
    if force {
        return None;
    }
    delete_after.filter(|eligible| now < *eligible)
}

/// Renders the age of a resource as `37s`, `3m12s`, `14h` or `2d4h`.
#[must_use]
pub fn format_age(since: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let age = now.signed_duration_since(since).max(TimeDelta::zero());
    let days = age.num_days();
    let hours = age.num_hours();
    let minutes = age.num_minutes();
    let seconds = age.num_seconds();

    if days > 0 {
        let remaining_hours = hours - days * 24;
        if remaining_hours > 0 {
            return format!("{days}d{remaining_hours}h");
        }
        return format!("{days}d");
    }
    if hours > 0 {
        return format!("{hours}h");
    }
    if minutes > 0 {
        let remaining_seconds = seconds - minutes * 60;
        if remaining_seconds > 0 {
            return format!("{minutes}m{remaining_seconds}s");
        }
        return format!("{minutes}m");
    }
    format!("{seconds}s")
}

/// Source of the current time, injectable for tests.
pub trait Clock: fmt::Debug + Send + Sync {
    /// Returns the current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
