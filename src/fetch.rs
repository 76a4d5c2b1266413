//! Network access: per-link downloads and the one-off module fetch.

use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    Status(u16),
    #[error("failed to read body: {0}")]
    Body(#[source] io::Error),
    #[error("download cancelled")]
    Cancelled,
}

impl FetchError {
    /// Map a body read failure, keeping cancellation distinct.
    pub fn from_read(err: io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<RunCancelled>()) {
            Self::Cancelled
        } else {
            Self::Body(err)
        }
    }
}

// Not `ErrorKind::Interrupted`: `read_exact` and `read_to_end` retry on that.
#[derive(Debug, Error)]
#[error("run cancelled")]
struct RunCancelled;

/// Opens a streaming body for a link.
pub trait LinkFetcher: Send + Sync {
    fn open(&self, link: &str) -> Result<Box<dyn Read + Send>, FetchError>;
}

pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl LinkFetcher for HttpFetcher {
    fn open(&self, link: &str) -> Result<Box<dyn Read + Send>, FetchError> {
        let response = self.client.get(link).send()?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(Box::new(response))
    }
}

/// Read wrapper that fails every read once the run is cancelled.
pub struct CancellableReader<R> {
    inner: R,
    cancel: Option<Arc<AtomicBool>>,
}

impl<R: Read> CancellableReader<R> {
    pub fn new(inner: R, cancel: Option<Arc<AtomicBool>>) -> Self {
        Self { inner, cancel }
    }
}

impl<R: Read> Read for CancellableReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
        {
            return Err(io::Error::other(RunCancelled));
        }
        self.inner.read(buf)
    }
}

/// Download the recovery module. Any failure here is fatal for the run.
pub fn fetch_module_bytes(fetcher: &dyn LinkFetcher, url: &str) -> Result<Vec<u8>, FetchError> {
    let mut body = fetcher.open(url)?;
    let mut bytes = Vec::new();
    body.read_to_end(&mut bytes).map_err(FetchError::Body)?;
    Ok(bytes)
}
