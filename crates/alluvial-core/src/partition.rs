//! Deterministic partition-path derivation from event time.
//!
//! [`PartitionPath`] is a stateless value: it only encodes a storage
//! location, never performs I/O. Derivation normalizes every timestamp to
//! UTC before formatting so that the same event time always yields the
//! same path, regardless of the machine's local timezone.

use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A date/hour storage partition, formatted as fixed-width strings.
///
/// Lexicographic ordering of the rendered path equals chronological
/// ordering, so directory listings sort naturally.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionPath {
    /// Date component, `YYYY-MM-DD`.
    pub date: String,
    /// Hour component, zero-padded `HH` (00–23).
    pub hour: String,
}

impl PartitionPath {
    /// Derive the partition path for an event time.
    ///
    /// Pure and total for any valid timestamp: the input is converted to
    /// UTC and formatted with fixed-width patterns.
    #[must_use]
    pub fn derive<Tz: TimeZone>(event_time: DateTime<Tz>) -> Self {
        let utc = event_time.with_timezone(&Utc);
        Self {
            date: utc.format("%Y-%m-%d").to_string(),
            hour: utc.format("%H").to_string(),
        }
    }

    /// Relative directory path, `YYYY-MM-DD/HH`.
    #[must_use]
    pub fn rel_path(&self) -> String {
        format!("{}/{}", self.date, self.hour)
    }
}

impl fmt::Display for PartitionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.date, self.hour)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Timelike};

    #[test]
    fn test_derive_utc() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap();
        let path = PartitionPath::derive(ts);
        assert_eq!(path.date, "2024-03-01");
        assert_eq!(path.hour, "10");
        assert_eq!(path.rel_path(), "2024-03-01/10");
    }

    #[test]
    fn test_derive_is_deterministic() {
        let ts = Utc.with_ymd_and_hms(2023, 12, 31, 23, 59, 59).unwrap();
        assert_eq!(PartitionPath::derive(ts), PartitionPath::derive(ts));
    }

    #[test]
    fn test_derive_normalizes_offset_to_utc() {
        // 2024-03-01T10:15:00Z expressed in UTC+7 must land in the same bucket.
        let utc = Utc.with_ymd_and_hms(2024, 3, 1, 10, 15, 0).unwrap();
        let jakarta = FixedOffset::east_opt(7 * 3600).unwrap();
        let local = utc.with_timezone(&jakarta);
        assert_eq!(local.hour(), 17, "sanity: local wall clock differs");
        assert_eq!(PartitionPath::derive(local), PartitionPath::derive(utc));
    }

    #[test]
    fn test_derive_crosses_date_boundary_in_utc() {
        // 00:30 UTC+2 is 22:30 the previous day in UTC.
        let zone = FixedOffset::east_opt(2 * 3600).unwrap();
        let local = zone.with_ymd_and_hms(2024, 6, 2, 0, 30, 0).unwrap();
        let path = PartitionPath::derive(local);
        assert_eq!(path.date, "2024-06-01");
        assert_eq!(path.hour, "22");
    }

    #[test]
    fn test_hour_is_zero_padded() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 5, 3, 0, 0).unwrap();
        assert_eq!(PartitionPath::derive(ts).hour, "03");
    }

    #[test]
    fn test_ordering_is_chronological() {
        let a = PartitionPath::derive(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap());
        let b = PartitionPath::derive(Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap());
        let c = PartitionPath::derive(Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap());
        assert!(a < b);
        assert!(b < c);
    }
}
