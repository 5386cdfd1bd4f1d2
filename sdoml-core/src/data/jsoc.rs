//! HTTP transport for the JSOC image archives.
//!
//! Makes exactly one request per call; retry and backoff belong to the
//! fetcher. Status handling:
//! - 403: the archive is blocking us, trip the breaker
//! - 404 / other 4xx: terminal for this record
//! - 429 / 5xx: transient, counted against the breaker
//! - connect / timeout / body errors: transient

use super::circuit_breaker::CircuitBreaker;
use super::transport::{ArchiveRoots, FetchError, Transport};
use crate::domain::RawFileRecord;
use reqwest::StatusCode;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpTransport {
    client: reqwest::blocking::Client,
    roots: ArchiveRoots,
    circuit_breaker: Arc<CircuitBreaker>,
}

impl HttpTransport {
    pub fn new(
        roots: ArchiveRoots,
        circuit_breaker: Arc<CircuitBreaker>,
        timeout: Duration,
    ) -> reqwest::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sdoml/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            roots,
            circuit_breaker,
        })
    }

    pub fn url(&self, record: &RawFileRecord) -> String {
        self.roots.resolve(record)
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "jsoc_http"
    }

    fn fetch(&self, record: &RawFileRecord, dest: &Path) -> Result<u64, FetchError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(FetchError::CircuitBreakerTripped);
        }

        let url = self.url(record);
        let transient = |reason: String| FetchError::Transient {
            locator: record.locator.clone(),
            reason,
        };

        let mut resp = self
            .client
            .get(&url)
            .send()
            .map_err(|e| transient(e.to_string()))?;

        let status = resp.status();
        if status == StatusCode::FORBIDDEN {
            self.circuit_breaker.trip();
            return Err(FetchError::CircuitBreakerTripped);
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            self.circuit_breaker.record_failure();
            return Err(transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(FetchError::Terminal {
                locator: record.locator.clone(),
                reason: format!("HTTP {status}"),
            });
        }

        let mut file = File::create(dest).map_err(|e| FetchError::io(dest, e))?;
        let bytes = resp
            .copy_to(&mut file)
            .map_err(|e| transient(format!("body: {e}")))?;
        file.sync_all().map_err(|e| FetchError::io(dest, e))?;
        self.circuit_breaker.record_success();
        Ok(bytes)
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}
