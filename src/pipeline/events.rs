//! # Pipeline Events
//!
//! Failures that flow from the extractor and the recovery workers to the
//! error log thread.

use std::io;

use thiserror::Error;

use crate::extract::ExtractionError;
use crate::fetch::FetchError;
use crate::png::FormatError;
use crate::sandbox::SandboxError;

/// Why a single link was abandoned.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("{0}")]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Format(#[from] FormatError),
    #[error("{0}")]
    Sandbox(#[from] SandboxError),
    #[error("failed to write output: {0}")]
    Persist(#[source] io::Error),
}

/// Events sent to the error log thread
#[derive(Debug, Error)]
pub enum FailureEvent {
    /// A row or entry of the export could not be read
    #[error("{0}")]
    Extraction(#[from] ExtractionError),
    /// Processing of a link was abandoned
    #[error("{link}: {error}")]
    Link { link: String, error: LinkError },
}

impl FailureEvent {
    pub fn link_failure(link: impl Into<String>, error: impl Into<LinkError>) -> Self {
        Self::Link {
            link: link.into(),
            error: error.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Extraction(_) => "extraction",
            Self::Link { error, .. } => match error {
                LinkError::Fetch(_) => "network",
                LinkError::Format(_) => "format",
                LinkError::Sandbox(_) => "sandbox",
                LinkError::Persist(_) => "persist",
            },
        }
    }

    pub fn link(&self) -> Option<&str> {
        match self {
            Self::Link { link, .. } => Some(link),
            Self::Extraction(_) => None,
        }
    }

    pub fn entry(&self) -> Option<&str> {
        match self {
            Self::Extraction(err) => Some(err.entry()),
            Self::Link { .. } => None,
        }
    }
}
