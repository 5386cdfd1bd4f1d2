//! Temporal alignment of the two instrument feeds onto the sample clock.
//!
//! Each sample key looks up exactly one native timestamp per channel (see
//! [`SampleClock::native_time`]). When that file is absent the channel is
//! left empty for the sample: there is no nearest-neighbour substitution.

use crate::data::ScannedFile;
use crate::domain::{
    AlignedSample, Channel, ChannelSet, ChannelSlot, DateRange, FileStatus, RawFileRecord,
    SampleClock, SampleKey,
};
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Raw files known to exist, keyed by (channel, native timestamp).
#[derive(Debug, Clone, Default)]
pub struct RawIndex {
    files: HashMap<(Channel, NaiveDateTime), PathBuf>,
}

impl RawIndex {
    /// Records the fetcher marked downloaded.
    pub fn from_records(records: &[RawFileRecord]) -> Self {
        let mut index = Self::default();
        for r in records.iter().filter(|r| r.status() == FileStatus::Downloaded) {
            index.insert(r.channel, r.timestamp, r.local_path.clone());
        }
        index
    }

    /// Planned records whose file is on disk, whatever their recorded status.
    pub fn from_present(records: &[RawFileRecord]) -> Self {
        let mut index = Self::default();
        for r in records.iter().filter(|r| r.local_path().is_file()) {
            index.insert(r.channel, r.timestamp, r.local_path.clone());
        }
        index
    }

    pub fn from_scan(files: &[ScannedFile]) -> Self {
        let mut index = Self::default();
        for f in files {
            index.insert(f.channel, f.timestamp, f.path.clone());
        }
        index
    }

    pub fn insert(&mut self, channel: Channel, t: NaiveDateTime, path: PathBuf) {
        self.files.insert((channel, t), path);
    }

    pub fn get(&self, channel: Channel, t: NaiveDateTime) -> Option<&PathBuf> {
        self.files.get(&(channel, t))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Aligner {
    clock: SampleClock,
    channels: ChannelSet,
}

impl Aligner {
    pub fn new(clock: SampleClock, channels: ChannelSet) -> Self {
        Self { clock, channels }
    }

    pub fn align_key(&self, key: SampleKey, index: &RawIndex) -> AlignedSample {
        let slots = self
            .channels
            .all()
            .into_iter()
            .map(|channel| {
                let source_time = self.clock.native_time(channel.instrument(), key);
                let file = index.get(channel, source_time).cloned();
                (channel, ChannelSlot { source_time, file })
            })
            .collect();
        AlignedSample { key, slots }
    }

    /// One sample per key in the range, ascending.
    pub fn align(&self, range: &DateRange, index: &RawIndex) -> Alignment {
        Alignment {
            samples: self
                .clock
                .keys(range)
                .into_iter()
                .map(|k| self.align_key(k, index))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Alignment {
    samples: Vec<AlignedSample>,
}

impl Alignment {
    pub fn samples(&self) -> &[AlignedSample] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn complete(&self) -> usize {
        self.samples.iter().filter(|s| s.is_complete()).count()
    }

    pub fn incomplete(&self) -> usize {
        self.len() - self.complete()
    }

    /// Missing-file count per channel.
    pub fn missing_by_channel(&self) -> BTreeMap<Channel, usize> {
        let mut out = BTreeMap::new();
        for s in &self.samples {
            for c in s.missing() {
                *out.entry(c).or_insert(0) += 1;
            }
        }
        out
    }

    /// Samples grouped by the calendar day of their key.
    pub fn by_day(&self) -> BTreeMap<NaiveDate, Vec<&AlignedSample>> {
        let mut days: BTreeMap<NaiveDate, Vec<&AlignedSample>> = BTreeMap::new();
        for s in &self.samples {
            days.entry(s.key.day()).or_default().push(s);
        }
        days
    }
}
