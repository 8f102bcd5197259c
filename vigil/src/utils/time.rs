use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serializer};

/// Wall clock format the viewer expects in the `date` field of a verdict.
pub const VERDICT_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Serde adapter for `NaiveDateTime` written as `2024-05-01 13:37:00`.
pub mod verdict_date {
    use super::*;

    pub fn serialize<S>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(&value.format(VERDICT_DATE_FORMAT))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, VERDICT_DATE_FORMAT).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for `DateTime<Utc>` written as fractional seconds since the
/// unix epoch, e.g. `1714570620.125`.
pub mod epoch_seconds {
    use super::*;

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(to_epoch_seconds(value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let seconds = f64::deserialize(deserializer)?;
        from_epoch_seconds(seconds)
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp {seconds} out of range")))
    }
}

/// Local wall clock time truncated to whole seconds, which is all the
/// verdict date format can carry.
pub fn local_now_seconds() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Fractional seconds since the unix epoch.
pub fn to_epoch_seconds(value: &DateTime<Utc>) -> f64 {
    value.timestamp() as f64 + f64::from(value.timestamp_subsec_micros()) / 1_000_000.0
}

/// Inverse of [`to_epoch_seconds`], microsecond resolution.
pub fn from_epoch_seconds(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    #[allow(clippy::cast_possible_truncation)]
    let micros = (seconds * 1_000_000.0).round() as i64;
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    Utc.timestamp_opt(micros.div_euclid(1_000_000), nanos).single()
}
