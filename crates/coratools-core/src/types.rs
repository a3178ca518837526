//! Core types for the coratools components
//!
//! Newtypes for protocol identifiers, the logger time base and the negotiated
//! interface version.

use core::fmt;
use core::ops::{Add, Sub};
use core::str::FromStr;
use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::CoraError;

// ----------------------------------------------------------------------------
// Protocol Identifiers
// ----------------------------------------------------------------------------

/// Server transaction identifier, echoed in every response
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionNo(u32);

impl TransactionNo {
    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for TransactionNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Router session identifier carried in every message header
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionNo(u32);

impl SessionNo {
    /// Session used for connection-level messages (handshake, close)
    pub const CONNECTION: Self = Self(0);

    pub fn new(value: u32) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for SessionNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies an event target registered with a dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComponentId(u64);

impl ComponentId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Interface Version
// ----------------------------------------------------------------------------

/// Negotiated server interface version (`major.minor.release.build`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InterfaceVersion {
    pub major: u16,
    pub minor: u16,
    pub release: u16,
    pub build: u16,
}

impl InterfaceVersion {
    pub const fn new(major: u16, minor: u16, release: u16, build: u16) -> Self {
        Self {
            major,
            minor,
            release,
            build,
        }
    }
}

impl fmt::Display for InterfaceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.release, self.build
        )
    }
}

impl FromStr for InterfaceVersion {
    type Err = CoraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = [0u16; 4];
        let mut count = 0;
        for piece in s.trim().split('.') {
            if count == parts.len() {
                return Err(CoraError::invalid_argument(format!(
                    "interface version has too many components: {s}"
                )));
            }
            parts[count] = piece.parse().map_err(|_| {
                CoraError::invalid_argument(format!("invalid interface version: {s}"))
            })?;
            count += 1;
        }
        if count == 0 {
            return Err(CoraError::invalid_argument("empty interface version"));
        }
        Ok(Self::new(parts[0], parts[1], parts[2], parts[3]))
    }
}

// ----------------------------------------------------------------------------
// Logger Time
// ----------------------------------------------------------------------------

/// Seconds between the Unix epoch and 1990-01-01T00:00:00
const LGR_EPOCH_UNIX_SECS: i64 = 631_152_000;

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Nanoseconds since 1990-01-01T00:00:00, the logger time base
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LgrDate(i64);

impl LgrDate {
    /// Open-ended upper bound for date ranges
    pub const MAX: Self = Self(i64::MAX);
    pub const EPOCH: Self = Self(0);

    pub fn new(nanos: i64) -> Self {
        Self(nanos)
    }

    pub fn nanos(&self) -> i64 {
        self.0
    }

    /// Convert a Unix timestamp in seconds
    pub fn from_unix_secs(secs: i64) -> Self {
        Self(
            secs.saturating_sub(LGR_EPOCH_UNIX_SECS)
                .saturating_mul(NANOS_PER_SEC),
        )
    }

    /// Whole seconds since the Unix epoch
    pub fn unix_secs(&self) -> i64 {
        self.0.div_euclid(NANOS_PER_SEC) + LGR_EPOCH_UNIX_SECS
    }

    pub fn system_now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let since_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let nanos = i64::try_from(since_unix.as_nanos()).unwrap_or(i64::MAX);
        Self(nanos.saturating_sub(LGR_EPOCH_UNIX_SECS * NANOS_PER_SEC))
    }
}

impl Add<Duration> for LgrDate {
    type Output = LgrDate;

    fn add(self, other: Duration) -> LgrDate {
        let nanos = i64::try_from(other.as_nanos()).unwrap_or(i64::MAX);
        LgrDate(self.0.saturating_add(nanos))
    }
}

impl Sub<Duration> for LgrDate {
    type Output = LgrDate;

    fn sub(self, other: Duration) -> LgrDate {
        let nanos = i64::try_from(other.as_nanos()).unwrap_or(i64::MAX);
        LgrDate(self.0.saturating_sub(nanos))
    }
}

impl fmt::Display for LgrDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ns", self.0)
    }
}

// ----------------------------------------------------------------------------
// Time Source Trait
// ----------------------------------------------------------------------------

/// Source of "now" for components that compute time-relative requests
pub trait TimeSource {
    fn now(&self) -> LgrDate;
}

/// Wall clock implementation of TimeSource
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> LgrDate {
        LgrDate::system_now()
    }
}

/// Time source pinned to one instant
#[derive(Debug, Clone, Copy)]
pub struct FixedTimeSource(pub LgrDate);

impl TimeSource for FixedTimeSource {
    fn now(&self) -> LgrDate {
        self.0
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interface_version_ordering() {
        let old = InterfaceVersion::new(1, 3, 1, 27);
        let min = InterfaceVersion::new(1, 3, 1, 28);
        let newer = InterfaceVersion::new(1, 4, 0, 0);
        assert!(old < min);
        assert!(min < newer);
        assert_eq!(min.to_string(), "1.3.1.28");
    }

    #[test]
    fn test_interface_version_parse() {
        let parsed: InterfaceVersion = "1.3.6".parse().unwrap();
        assert_eq!(parsed, InterfaceVersion::new(1, 3, 6, 0));
        assert!("1.x".parse::<InterfaceVersion>().is_err());
        assert!("1.2.3.4.5".parse::<InterfaceVersion>().is_err());
    }

    #[test]
    fn test_lgr_date_unix_conversion() {
        let date = LgrDate::from_unix_secs(LGR_EPOCH_UNIX_SECS + 60);
        assert_eq!(date.nanos(), 60 * NANOS_PER_SEC);
        assert_eq!(date.unix_secs(), LGR_EPOCH_UNIX_SECS + 60);
    }

    #[test]
    fn test_lgr_date_arithmetic_saturates() {
        let late = LgrDate::MAX + Duration::from_secs(1);
        assert_eq!(late, LgrDate::MAX);
        let earlier = LgrDate::new(10 * NANOS_PER_SEC) - Duration::from_secs(4);
        assert_eq!(earlier.nanos(), 6 * NANOS_PER_SEC);
    }
}
