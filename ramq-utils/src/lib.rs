//! Small shared utilities for the ramq workspace.
//!
//! - [`IdGenerator`] and [`SequenceGenerator`] hand out the identifiers used for
//!   connections, sessions, consumers, producers and temporary destinations
//! - [`Counter`] is a current/max gauge used by connection statistics
//! - [`to_duration`] and [`to_bytesize`] parse the human readable values found in
//!   configuration files, with serde helpers for both
//!
//! ```
//! use ramq_utils::{to_bytesize, to_duration, Bytesize};
//!
//! assert_eq!(to_duration("1m30s").as_secs(), 90);
//! assert_eq!(to_bytesize("64K"), 65536);
//! assert_eq!(Bytesize::from("1M512K").string(), "1M512K");
//! ```

#![deny(unsafe_code)]

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use serde::{
    de::{self, Deserializer},
    ser::Serializer,
    Deserialize, Serialize,
};

mod counter;
mod id;

pub use counter::Counter;
pub use id::{IdGenerator, SequenceGenerator};

/// Timestamp representation in milliseconds since Unix epoch
pub type TimestampMillis = i64;

const BYTESIZE_K: usize = 1024;
const BYTESIZE_M: usize = 1048576;
const BYTESIZE_G: usize = 1073741824;

/// Byte size read from configuration, e.g. `"512K"` or `"1M512K"`.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Bytesize(pub usize);

impl Bytesize {
    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Format as the same compact form accepted by [`to_bytesize`].
    ///
    /// ```
    /// assert_eq!(ramq_utils::Bytesize(3145728).string(), "3M");
    /// assert_eq!(ramq_utils::Bytesize(0).string(), "0B");
    /// ```
    pub fn string(&self) -> String {
        let mut v = self.0;
        if v == 0 {
            return "0B".into();
        }
        let mut res = String::new();
        for (unit, size) in [('G', BYTESIZE_G), ('M', BYTESIZE_M), ('K', BYTESIZE_K)] {
            let n = v / size;
            if n > 0 {
                res.push_str(&format!("{}{}", n, unit));
                v %= size;
            }
        }
        if v > 0 {
            res.push_str(&format!("{}B", v));
        }
        res
    }
}

impl Deref for Bytesize {
    type Target = usize;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Bytesize {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<usize> for Bytesize {
    fn from(v: usize) -> Self {
        Bytesize(v)
    }
}

impl From<&str> for Bytesize {
    fn from(v: &str) -> Self {
        Bytesize(to_bytesize(v))
    }
}

impl fmt::Debug for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.string())
    }
}

impl fmt::Display for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.string())
    }
}

impl Serialize for Bytesize {
    #[inline]
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.string())
    }
}

impl<'de> Deserialize<'de> for Bytesize {
    #[inline]
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(usize),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Bytesize(n)),
            Raw::Text(s) => Ok(Bytesize(to_bytesize(&s))),
        }
    }
}

/// Parse a byte size such as `"2G512K"`. Unknown segments count as zero.
#[inline]
pub fn to_bytesize(text: &str) -> usize {
    let text = text.to_uppercase().replace("GB", "G").replace("MB", "M").replace("KB", "K");
    text.split_inclusive(['G', 'M', 'K', 'B'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            let v = match chars.as_str().parse::<usize>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'B' => v,
                'K' => v * BYTESIZE_K,
                'M' => v * BYTESIZE_M,
                'G' => v * BYTESIZE_G,
                _ => 0,
            }
        })
        .sum()
}

/// Deserialize a [`Duration`] from `"15s"`, `"1m30s"`, `"250ms"` or a plain
/// number of milliseconds.
#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
        Raw::Text(s) => Ok(to_duration(&s)),
    }
}

/// Like [`deserialize_duration`], an empty string or a negative value maps to `None`.
#[inline]
pub fn deserialize_duration_option<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(i64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Millis(ms) if ms < 0 => Ok(None),
        Raw::Millis(ms) => Ok(Some(Duration::from_millis(ms as u64))),
        Raw::Text(s) if s.trim().is_empty() => Ok(None),
        Raw::Text(s) => Ok(Some(to_duration(&s))),
    }
}

/// Serialize a [`Duration`] as whole milliseconds.
#[inline]
pub fn serialize_duration<S>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_u64(d.as_millis() as u64)
}

/// Convert a human readable duration string to [`Duration`].
///
/// Units: `ms`, `s`, `m`, `h`, `d`, `w`.
///
/// ```
/// assert_eq!(ramq_utils::to_duration("1h30m15s").as_secs(), 5415);
/// assert_eq!(ramq_utils::to_duration("250ms").as_millis(), 250);
/// ```
#[inline]
pub fn to_duration(text: &str) -> Duration {
    let text = text.trim().to_lowercase().replace("ms", "Y");
    let ms: u64 = text
        .split_inclusive(['s', 'm', 'h', 'd', 'w', 'Y'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            let v = match chars.as_str().trim().parse::<u64>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'Y' => v,
                's' => v * 1000,
                'm' => v * 60000,
                'h' => v * 3600000,
                'd' => v * 86400000,
                'w' => v * 604800000,
                _ => 0,
            }
        })
        .sum();
    Duration::from_millis(ms)
}

/// Current timestamp in milliseconds
#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_millis() as i64)
        .unwrap_or_else(|_| chrono::Local::now().timestamp_millis())
}

/// Reject empty strings during deserialization.
#[inline]
pub fn deserialize_non_empty<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let v = Option::<String>::deserialize(deserializer)?;
    match v {
        Some(s) if s.trim().is_empty() => Err(de::Error::invalid_value(de::Unexpected::Str(&s), &"a non-empty string")),
        other => Ok(other),
    }
}
