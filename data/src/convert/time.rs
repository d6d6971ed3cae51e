//! Serde adapters for date and time types.
//!
//! Use these with `#[serde(with = "...")]` on entity fields:
//!
//! ```
//! use chrono::{DateTime, NaiveDate, Utc};
//! use serde::{Deserialize, Serialize};
//! use tarantool_data::convert::time;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Event {
//!     #[serde(with = "time::epoch_millis")]
//!     at: DateTime<Utc>,
//!     #[serde(with = "time::date_millis")]
//!     day: NaiveDate,
//! }
//! ```

/// [`DateTime<Utc>`](chrono::DateTime) as milliseconds since the Unix epoch.
pub mod epoch_millis {
    use chrono::{DateTime, TimeZone, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(t.timestamp_millis())
    }

    pub fn deserialize<'a, D: Deserializer<'a>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let millis = i64::deserialize(d)?;
        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| D::Error::custom(format!("timestamp {millis} is out of range")))
    }
}

/// [`NaiveDate`](chrono::NaiveDate) as milliseconds since the Unix epoch, at midnight UTC.
pub mod date_millis {
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(date: &NaiveDate, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(date.and_time(NaiveTime::MIN).timestamp_millis())
    }

    pub fn deserialize<'a, D: Deserializer<'a>>(d: D) -> Result<NaiveDate, D::Error> {
        let millis = i64::deserialize(d)?;
        NaiveDateTime::from_timestamp_millis(millis)
            .map(|t| t.date())
            .ok_or_else(|| D::Error::custom(format!("timestamp {millis} is out of range")))
    }
}

/// [`NaiveTime`](chrono::NaiveTime) as nanoseconds since midnight.
pub mod time_nanos {
    use chrono::{NaiveTime, Timelike};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    const NANOS_PER_SEC: u64 = 1_000_000_000;

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        let secs = t.num_seconds_from_midnight() as u64;
        s.serialize_u64(secs * NANOS_PER_SEC + t.nanosecond() as u64)
    }

    pub fn deserialize<'a, D: Deserializer<'a>>(d: D) -> Result<NaiveTime, D::Error> {
        let nanos = u64::deserialize(d)?;
        u32::try_from(nanos / NANOS_PER_SEC)
            .ok()
            .and_then(|secs| {
                NaiveTime::from_num_seconds_from_midnight_opt(secs, (nanos % NANOS_PER_SEC) as u32)
            })
            .ok_or_else(|| D::Error::custom(format!("{nanos}ns is not a time of day")))
    }
}

/// [`Duration`](std::time::Duration) as an ISO-8601 duration string, such as `PT1H30M` or
/// `PT0.25S`.
pub mod duration_string {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format(*d))
    }

    pub fn deserialize<'a, D: Deserializer<'a>>(d: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(d)?;
        parse(&s).ok_or_else(|| D::Error::custom(format!("invalid duration {s}")))
    }

    pub(crate) fn format(d: Duration) -> String {
        let secs = d.as_secs();
        let (hours, minutes, seconds) = (secs / 3600, secs / 60 % 60, secs % 60);
        let mut s = "PT".to_string();
        if hours > 0 {
            s += &format!("{hours}H");
        }
        if minutes > 0 {
            s += &format!("{minutes}M");
        }
        if d.subsec_nanos() > 0 {
            let frac = format!("{:09}", d.subsec_nanos());
            s += &format!("{seconds}.{}S", frac.trim_end_matches('0'));
        } else if seconds > 0 || s.len() == 2 {
            s += &format!("{seconds}S");
        }
        s
    }

    pub(crate) fn parse(s: &str) -> Option<Duration> {
        let mut rest = s.strip_prefix("PT")?;
        if rest.is_empty() {
            return None;
        }
        let mut total = Duration::ZERO;
        while !rest.is_empty() {
            let end = rest.find(|c: char| c.is_ascii_alphabetic())?;
            let (num, unit) = (&rest[..end], &rest[end..end + 1]);
            total += match unit {
                "H" => Duration::from_secs(num.parse::<u64>().ok()? * 3600),
                "M" => Duration::from_secs(num.parse::<u64>().ok()? * 60),
                "S" => Duration::try_from_secs_f64(num.parse::<f64>().ok()?).ok()?,
                _ => return None,
            };
            rest = &rest[end + 1..];
        }
        Some(total)
    }
}
