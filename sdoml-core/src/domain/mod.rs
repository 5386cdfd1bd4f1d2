//! Domain types for the dataset builder

pub mod channel;
pub mod frame;
pub mod range;
pub mod record;
pub mod sample;

pub use channel::{Channel, ChannelError, ChannelSet, Instrument, AIA_WAVELENGTHS, DEFAULT_AIA_WAVELENGTHS};
pub use frame::{Frame, FrameShapeError};
pub use range::{parse_timestamp, DateRange, InvalidRangeError};
pub use record::{DownloadChunk, FileStatus, RawFileRecord};
pub use sample::{AlignedSample, ChannelSlot, SampleClock, SampleKey, DEFAULT_CADENCE_MINUTES};
