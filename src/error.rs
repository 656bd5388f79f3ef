//! Error taxonomy shared across the poll/notify engine.
//!
//! Source and delivery failures are logged and swallowed by the jobs that hit
//! them; parse and filter failures are surfaced synchronously to whoever is
//! compiling a filter.

use thiserror::Error;

use crate::rules::ParseError;

/// Network or decode failure from a listing source plugin.
#[derive(Debug, Error)]
pub enum SourceFetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("source returned HTTP {status}")]
    Status { status: u16 },

    #[error("could not decode listings: {0}")]
    Decode(String),

    #[error("plugin error: {0}")]
    Plugin(String),
}

/// A delivery sink rejected a listing.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("webhook returned HTTP {status}")]
    Status { status: u16 },

    #[error("SMTP delivery failed: {0}")]
    Smtp(String),

    #[error("sink configuration error: {0}")]
    Config(String),
}

/// Persistence failure in a listing or config store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("store (de)serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Filter could not be compiled for its target field.
#[derive(Debug, Error)]
pub enum FilterError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("invalid numeric rule: {0:?}")]
    InvalidNumericRule(String),

    #[error("no source declares a listing field named {0:?}")]
    UnknownField(String),
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("no source plugin registered at {0:?}")]
    MissingPlugin(String),
}

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),

    #[error("no search named {0:?}")]
    UnknownSearch(String),

    #[error("a search named {0:?} already exists")]
    DuplicateSearch(String),

    #[error("search {0:?} already watches the same parameters")]
    AlreadyWatched(String),

    #[error("no filter with id {0}")]
    UnknownFilter(String),

    #[error("search spec {0} is not in the catalog")]
    UnknownSearchSpec(String),

    #[error("notification frequency must be at least one second")]
    InvalidFrequency,

    #[error("notifier is closed")]
    Closed,
}
