//! Instrument channels and the active channel set of a build.
//!
//! The slow-cadence instrument (HMI) contributes a single line-of-sight
//! magnetogram channel. The fast-cadence instrument (AIA) contributes one
//! channel per EUV/UV wavelength.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Every AIA wavelength served by the synoptic archive, in Ångström.
pub const AIA_WAVELENGTHS: [u16; 9] = [94, 131, 171, 193, 211, 304, 335, 1600, 1700];

/// Wavelengths packaged unless configured otherwise.
pub const DEFAULT_AIA_WAVELENGTHS: [u16; 5] = [131, 171, 193, 211, 1600];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Instrument {
    /// HMI: 15-minute magnetograms, already scaled to [0,1] at the source.
    Slow,
    /// AIA: multi-wavelength imagery on a 2-minute native grid.
    Fast,
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instrument::Slow => write!(f, "slow"),
            Instrument::Fast => write!(f, "fast"),
        }
    }
}

/// Errors from parsing channel tags or building a channel set.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Neither `HMI_M` nor `AIA_<wavelength>`.
    #[error("unknown channel tag '{0}'")]
    UnknownTag(String),

    /// Not one of [`AIA_WAVELENGTHS`].
    #[error("unsupported AIA wavelength {0}")]
    UnsupportedWavelength(u16),

    /// A build needs at least one AIA channel.
    #[error("at least one fast-cadence wavelength is required")]
    NoFastChannels,
}

/// One packaged channel. Orders HMI first, then AIA by wavelength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Channel {
    /// HMI line-of-sight magnetogram.
    HmiMagnetogram,
    /// AIA image at the given wavelength in Ångström.
    Aia(u16),
}

impl Channel {
    /// Checked constructor for an AIA channel.
    pub fn aia(wavelength: u16) -> Result<Self, ChannelError> {
        if AIA_WAVELENGTHS.contains(&wavelength) {
            Ok(Channel::Aia(wavelength))
        } else {
            Err(ChannelError::UnsupportedWavelength(wavelength))
        }
    }

    /// Which instrument feeds this channel.
    pub fn instrument(&self) -> Instrument {
        match self {
            Channel::HmiMagnetogram => Instrument::Slow,
            Channel::Aia(_) => Instrument::Fast,
        }
    }

    /// Whether this channel needs frozen statistics to normalize.
    pub fn is_fast(&self) -> bool {
        self.instrument() == Instrument::Fast
    }

    /// Tag used inside shard entry names: `HMI_M`, `AIA_0131`, ...
    pub fn tag(&self) -> String {
        match self {
            Channel::HmiMagnetogram => "HMI_M".to_string(),
            Channel::Aia(w) => format!("AIA_{w:04}"),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

impl FromStr for Channel {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        if upper == "HMI_M" {
            return Ok(Channel::HmiMagnetogram);
        }
        let wavelength = upper
            .strip_prefix("AIA_")
            .and_then(|w| w.parse::<u16>().ok())
            .ok_or_else(|| ChannelError::UnknownTag(s.to_string()))?;
        Channel::aia(wavelength)
    }
}

impl TryFrom<String> for Channel {
    type Error = ChannelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Channel> for String {
    fn from(c: Channel) -> Self {
        c.tag()
    }
}

/// The channels of one build. Fixed for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSet {
    fast: BTreeSet<Channel>,
}

impl ChannelSet {
    pub fn new(wavelengths: &[u16]) -> Result<Self, ChannelError> {
        let fast = wavelengths
            .iter()
            .map(|w| Channel::aia(*w))
            .collect::<Result<BTreeSet<_>, _>>()?;
        if fast.is_empty() {
            return Err(ChannelError::NoFastChannels);
        }
        Ok(Self { fast })
    }

    /// The single slow-cadence channel.
    pub fn slow(&self) -> Channel {
        Channel::HmiMagnetogram
    }

    /// Fast-cadence channels by ascending wavelength.
    pub fn fast(&self) -> impl Iterator<Item = Channel> + '_ {
        self.fast.iter().copied()
    }

    /// Channels fed by one instrument.
    pub fn for_instrument(&self, instrument: Instrument) -> Vec<Channel> {
        match instrument {
            Instrument::Slow => vec![self.slow()],
            Instrument::Fast => self.fast().collect(),
        }
    }

    /// Slow channel first, then fast channels by wavelength.
    pub fn all(&self) -> Vec<Channel> {
        std::iter::once(self.slow()).chain(self.fast()).collect()
    }

    /// Whether a sample of this set carries `channel`.
    pub fn contains(&self, channel: Channel) -> bool {
        match channel {
            Channel::HmiMagnetogram => true,
            Channel::Aia(_) => self.fast.contains(&channel),
        }
    }

    /// Channel count, including the slow one.
    pub fn len(&self) -> usize {
        self.fast.len() + 1
    }

    /// Never empty: the slow channel is always present.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Default for ChannelSet {
    fn default() -> Self {
        Self {
            fast: DEFAULT_AIA_WAVELENGTHS
                .iter()
                .map(|w| Channel::Aia(*w))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip_through_parse() {
        for c in [Channel::HmiMagnetogram, Channel::Aia(94), Channel::Aia(1600)] {
            assert_eq!(c.tag().parse::<Channel>().unwrap(), c);
        }
        assert_eq!(Channel::Aia(94).tag(), "AIA_0094");
        assert!("AIA_0095".parse::<Channel>().is_err());
        assert!("EIT_195".parse::<Channel>().is_err());
    }

    #[test]
    fn default_set_excludes_long_wavelengths_and_94() {
        let set = ChannelSet::default();
        assert!(!set.contains(Channel::Aia(94)));
        assert!(!set.contains(Channel::Aia(1700)));
        assert!(set.contains(Channel::Aia(1600)));
        assert_eq!(set.len(), 6);
        assert_eq!(set.all()[0], Channel::HmiMagnetogram);
    }

    #[test]
    fn rejects_unknown_or_empty_wavelengths() {
        assert_eq!(
            ChannelSet::new(&[171, 500]),
            Err(ChannelError::UnsupportedWavelength(500))
        );
        assert_eq!(ChannelSet::new(&[]), Err(ChannelError::NoFastChannels));
    }

    #[test]
    fn channel_serializes_as_tag() {
        let json = serde_json::to_string(&Channel::Aia(171)).unwrap();
        assert_eq!(json, "\"AIA_0171\"");
        let back: Channel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Channel::Aia(171));
    }
}
