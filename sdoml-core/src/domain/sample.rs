//! The canonical sample clock, sample keys and aligned samples.

use super::channel::{Channel, Instrument};
use super::range::{DateRange, InvalidRangeError};
use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

pub const DEFAULT_CADENCE_MINUTES: u32 = 15;

const MINUTES_PER_DAY: u32 = 24 * 60;

/// Canonical sample timestamp. One per cadence slot of a day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SampleKey(pub NaiveDateTime);

impl SampleKey {
    pub fn time(&self) -> NaiveDateTime {
        self.0
    }

    pub fn day(&self) -> NaiveDate {
        self.0.date()
    }

    /// Grouping prefix used by shard readers: `YYYY/MM/DD/HHMM`.
    pub fn prefix(&self) -> String {
        self.0.format("%Y/%m/%d/%H%M").to_string()
    }
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%dT%H:%M"))
    }
}

/// Maps the canonical clock onto each instrument's native grid.
///
/// Slots are multiples of the cadence counted from midnight. The slow
/// instrument is sampled at the slot itself. The fast instrument only
/// produces frames on even minutes, so slots at :15 and :45 pair with the
/// fast frame one minute earlier (:14 and :44).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleClock {
    cadence_minutes: u32,
}

impl SampleClock {
    pub fn new(cadence_minutes: u32) -> Result<Self, InvalidRangeError> {
        if cadence_minutes == 0 || cadence_minutes % 15 != 0 {
            return Err(InvalidRangeError::new(format!(
                "cadence must be a positive multiple of 15 minutes, got {cadence_minutes}"
            )));
        }
        if MINUTES_PER_DAY % cadence_minutes != 0 {
            return Err(InvalidRangeError::new(format!(
                "cadence of {cadence_minutes} minutes does not divide a day"
            )));
        }
        Ok(Self { cadence_minutes })
    }

    pub fn cadence_minutes(&self) -> u32 {
        self.cadence_minutes
    }

    pub fn slots_per_day(&self) -> usize {
        (MINUTES_PER_DAY / self.cadence_minutes) as usize
    }

    /// Every sample key inside the range, ascending.
    pub fn keys(&self, range: &DateRange) -> Vec<SampleKey> {
        let step = i64::from(self.cadence_minutes);
        let start = range.start();
        let minute_of_day = i64::from(start.hour() * 60 + start.minute());
        let rem = minute_of_day % step;
        let mut t = if rem == 0 {
            start
        } else {
            start + Duration::minutes(step - rem)
        };

        let mut keys = Vec::new();
        while range.contains(t) {
            keys.push(SampleKey(t));
            t += Duration::minutes(step);
        }
        keys
    }

    /// Native instrument timestamp that feeds `key`.
    pub fn native_time(&self, instrument: Instrument, key: SampleKey) -> NaiveDateTime {
        match instrument {
            Instrument::Slow => key.0,
            Instrument::Fast => {
                if key.0.minute() % 30 == 15 {
                    key.0 - Duration::minutes(1)
                } else {
                    key.0
                }
            }
        }
    }
}

impl Default for SampleClock {
    fn default() -> Self {
        Self {
            cadence_minutes: DEFAULT_CADENCE_MINUTES,
        }
    }
}

/// One channel of an aligned sample: the native time the pairing rule selected
/// and the raw file found there, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSlot {
    pub source_time: NaiveDateTime,
    pub file: Option<PathBuf>,
}

/// All channels of one sample key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignedSample {
    pub key: SampleKey,
    pub slots: BTreeMap<Channel, ChannelSlot>,
}

impl AlignedSample {
    pub fn slow(&self) -> Option<&ChannelSlot> {
        self.slots.get(&Channel::HmiMagnetogram)
    }

    pub fn fast(&self) -> impl Iterator<Item = (Channel, &ChannelSlot)> {
        self.slots
            .iter()
            .filter(|(c, _)| c.is_fast())
            .map(|(c, s)| (*c, s))
    }

    /// Complete only if every configured channel resolved to a file.
    pub fn is_complete(&self) -> bool {
        self.slots.values().all(|s| s.file.is_some())
    }

    pub fn present(&self) -> impl Iterator<Item = (Channel, &PathBuf)> {
        self.slots
            .iter()
            .filter_map(|(c, s)| s.file.as_ref().map(|f| (*c, f)))
    }

    pub fn missing(&self) -> Vec<Channel> {
        self.slots
            .iter()
            .filter(|(_, s)| s.file.is_none())
            .map(|(c, _)| *c)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M").unwrap()
    }

    #[test]
    fn one_day_has_96_quarter_hour_keys() {
        let clock = SampleClock::default();
        let range = DateRange::parse("2024-01-01", "2024-01-02").unwrap();
        let keys = clock.keys(&range);
        assert_eq!(keys.len(), 96);
        assert_eq!(keys.len(), clock.slots_per_day());
        assert_eq!(keys[1].prefix(), "2024/01/01/0015");
    }

    #[test]
    fn keys_snap_up_to_the_grid() {
        let clock = SampleClock::default();
        let range = DateRange::parse("2024-01-01T00:01", "2024-01-01T01:00").unwrap();
        let keys = clock.keys(&range);
        assert_eq!(keys.first().unwrap().time(), t("2024-01-01T00:15"));
        assert_eq!(keys.len(), 3);
    }

    #[test]
    fn fast_pairing_rule() {
        let clock = SampleClock::default();
        let cases = [("14:00", "14:00"), ("14:15", "14:14"), ("14:30", "14:30"), ("14:45", "14:44")];
        for (slot, fast) in cases {
            let key = SampleKey(t(&format!("2024-01-01T{slot}")));
            assert_eq!(
                clock.native_time(Instrument::Fast, key),
                t(&format!("2024-01-01T{fast}"))
            );
            assert_eq!(clock.native_time(Instrument::Slow, key), key.time());
        }
    }

    #[test]
    fn cadence_validation() {
        assert!(SampleClock::new(0).is_err());
        assert!(SampleClock::new(10).is_err());
        assert!(SampleClock::new(45).is_ok());
        assert!(SampleClock::new(60).is_ok());
        assert!(SampleClock::new(105).is_err());
    }
}
