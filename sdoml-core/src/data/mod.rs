//! Raw data plumbing: layout, transports, fetching, decoding, ledger.

pub mod circuit_breaker;
pub mod decode;
pub mod fetch;
pub mod jsoc;
pub mod layout;
pub mod ledger;
pub mod npy;
pub mod transport;

pub use circuit_breaker::CircuitBreaker;
pub use decode::{DecodeError, NpyDecoder, RawDecoder};
pub use fetch::{ChunkSummary, FetchOutcome, FetchProgress, FetchState, Fetcher, LogProgress, RetryPolicy};
pub use jsoc::HttpTransport;
pub use layout::{RawLayout, ScannedFile};
pub use ledger::{FetchLedger, LedgerEntry, LedgerError, LedgerSummary, StatusCounts};
pub use transport::{ArchiveRoots, FetchError, MirrorTransport, Transport};
