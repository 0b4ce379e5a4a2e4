use chrono::{DateTime, TimeDelta, Utc};
use dash_mpd::UTCTiming;

use crate::{
    error::{DashError, DashResult},
    util::http::HttpClient,
};

const SCHEME_HTTP_XSDATE: &str = "urn:mpeg:dash:utc:http-xsdate:2014";
const SCHEME_HTTP_ISO: &str = "urn:mpeg:dash:utc:http-iso:2014";
const SCHEME_HTTP_HEAD: &str = "urn:mpeg:dash:utc:http-head:2014";
const SCHEME_DIRECT: &str = "urn:mpeg:dash:utc:direct:2014";

/// Wall clock aligned with the origin server of a live presentation.
#[derive(Debug, Clone, Copy, Default)]
pub struct Clock {
    /// How much time the local clock is behind the remote clock
    offset: TimeDelta,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> TimeDelta {
        self.offset
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.offset
    }

    fn set_time(
        &mut self,
        remote_now: DateTime<Utc>,
        before_request: DateTime<Utc>,
        after_request: DateTime<Utc>,
    ) {
        // The remote timestamp was taken roughly halfway through the request.
        let half_rtt = (after_request - before_request) / 2;
        self.offset = remote_now + half_rtt - after_request;
        tracing::info!(
            offset_milliseconds = self.offset.num_milliseconds(),
            "Clock synchronized to {remote_now}"
        );
    }

    /// Tries each `UTCTiming` source in order until one succeeds. Without any
    /// source the local clock is kept.
    pub async fn sync(&mut self, timing: &[UTCTiming], client: &HttpClient) -> DashResult<()> {
        if timing.is_empty() {
            tracing::debug!("No UTCTiming elements found in MPD, using local time.");
            return Ok(());
        }

        let mut last_error = None;
        for source in timing {
            let scheme = source.schemeIdUri.as_str();
            tracing::debug!(scheme, value = source.value.as_deref().unwrap_or(""), "Syncing clock");

            let before_request = Utc::now();
            match remote_time(scheme, source.value.as_deref(), client).await {
                Ok((remote_now, after_request)) => {
                    self.set_time(remote_now, before_request, after_request);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(scheme, error = %e, "Clock synchronization failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            DashError::InvalidTimingSchema("All time sync methods failed".to_string())
        }))
    }
}

/// Returns the remote time and the local time at which it was received.
async fn remote_time(
    scheme: &str,
    value: Option<&str>,
    client: &HttpClient,
) -> DashResult<(DateTime<Utc>, DateTime<Utc>)> {
    let value =
        value.ok_or_else(|| DashError::InvalidTimingSchema(format!("Missing value for {scheme}")))?;

    match scheme {
        SCHEME_HTTP_XSDATE | SCHEME_HTTP_ISO => {
            let response = client.get(value).send().await?;
            let after_request = Utc::now();
            if !response.status().is_success() {
                return Err(DashError::HttpError(response.status()));
            }
            let text = response.text().await?;
            Ok((parse_xs_datetime(text.trim())?, after_request))
        }
        SCHEME_HTTP_HEAD => {
            let response = client.head(value).send().await?;
            let after_request = Utc::now();
            if !response.status().is_success() {
                return Err(DashError::HttpError(response.status()));
            }
            let date = response
                .headers()
                .get(reqwest::header::DATE)
                .ok_or_else(|| DashError::DateTimeParsing("Missing Date header".to_string()))?
                .to_str()
                .map_err(|_| DashError::DateTimeParsing("Invalid Date header".to_string()))?;
            let remote = DateTime::parse_from_rfc2822(date)?.with_timezone(&Utc);
            Ok((remote, after_request))
        }
        SCHEME_DIRECT => Ok((parse_xs_datetime(value)?, Utc::now())),
        others => Err(DashError::InvalidTimingSchema(format!(
            "Unsupported scheme: {others}"
        ))),
    }
}

fn parse_xs_datetime(text: &str) -> DashResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // xs:dateTime without an explicit offset is UTC
            chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|dt| dt.and_utc())
        })?)
}
