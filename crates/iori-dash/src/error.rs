use std::time::Duration;

use thiserror::Error;

use crate::StreamType;

#[derive(Error, Debug)]
pub enum DashError {
    #[error("HTTP error: {0}")]
    HttpError(reqwest::StatusCode),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error("Request timed out")]
    Timeout,

    /// The operation was aborted by stop, seek or teardown.
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Download of {segment} failed after {attempts} attempt(s): {source}")]
    DownloadFailed {
        segment: String,
        attempts: u32,
        #[source]
        source: Box<DashError>,
    },

    #[error("Manifest unavailable: {0}")]
    ManifestUnavailable(String),

    #[error(transparent)]
    MpdParseError(#[from] dash_mpd::DashMpdError),

    #[error("Invalid mpd: {0}")]
    MpdParsing(String),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Invalid timing schema: {0:?}")]
    InvalidTimingSchema(String),

    #[error("Invalid date time: {0}")]
    DateTimeParsing(String),

    #[error(transparent)]
    ChronoParseError(#[from] chrono::ParseError),

    #[error(transparent)]
    TimeOutOfRange(#[from] chrono::OutOfRangeError),

    #[error("No {0} media in current period")]
    NoMediaInPeriod(StreamType),

    #[error("Representation is not set")]
    RepresentationNotSet,

    #[error("Stream index {0} is out of range")]
    InvalidStreamIndex(usize),

    #[error("No segment found for seek position {0:?}")]
    SeekUnresolved(Duration),

    #[error("Seek did not settle within {0:?}")]
    SeekTimeout(Duration),

    #[error("Seeking is not supported for live content")]
    SeekNotSupported,

    #[error("The {0} stream is deactivated")]
    StreamDeactivated(StreamType),
}

impl DashError {
    /// Whether another attempt of the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            DashError::HttpError(status) => {
                status.is_server_error()
                    || *status == reqwest::StatusCode::REQUEST_TIMEOUT
                    || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
            }
            DashError::RequestError(e) => !e.is_builder() && !e.is_redirect(),
            DashError::Timeout => true,
            _ => false,
        }
    }

    pub fn status(&self) -> Option<reqwest::StatusCode> {
        match self {
            DashError::HttpError(status) => Some(*status),
            DashError::RequestError(e) => e.status(),
            DashError::DownloadFailed { source, .. } => source.status(),
            _ => None,
        }
    }
}

pub type DashResult<T> = Result<T, DashError>;
