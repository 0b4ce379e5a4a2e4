use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::{
    config::DashConfig,
    error::{DashError, DashResult},
    manifest::SegmentDescriptor,
    throughput::ThroughputHistory,
    util::http::HttpClient,
    StreamType,
};

/// Largest buffer reserved up front from `Content-Length`.
const MAX_PREALLOCATION: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub segment: SegmentDescriptor,
    pub stream_type: StreamType,
    /// Retry transient failures instead of failing on the first one.
    pub ignore_error: bool,
    /// Bound for the whole download, retries included.
    pub deadline: Option<Duration>,
}

impl DownloadRequest {
    pub fn new(segment: SegmentDescriptor, stream_type: StreamType) -> Self {
        Self {
            segment,
            stream_type,
            ignore_error: false,
            deadline: None,
        }
    }

    pub fn ignore_error(mut self, ignore_error: bool) -> Self {
        self.ignore_error = ignore_error;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn segment_id(&self) -> Option<u64> {
        self.segment.id
    }
}

#[derive(Debug, Clone)]
pub struct DownloadResponse {
    pub segment: SegmentDescriptor,
    pub stream_type: StreamType,
    pub data: Bytes,
}

impl DownloadResponse {
    pub fn segment_id(&self) -> Option<u64> {
        self.segment.id
    }
}

/// Fetches single segments with retries, feeding the shared throughput
/// history.
#[derive(Clone)]
pub struct SegmentDownloader {
    client: HttpClient,
    throughput: Arc<ThroughputHistory>,

    attempts: u32,
    backoff_unit: Duration,
    timeout: Duration,
}

impl SegmentDownloader {
    pub fn new(client: HttpClient, throughput: Arc<ThroughputHistory>) -> Self {
        Self::from_config(client, throughput, &DashConfig::default())
    }

    pub fn from_config(
        client: HttpClient,
        throughput: Arc<ThroughputHistory>,
        config: &DashConfig,
    ) -> Self {
        Self {
            client,
            throughput,
            attempts: config.segment_attempts.max(1),
            backoff_unit: config.backoff_unit,
            timeout: config.segment_timeout,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    pub fn throughput(&self) -> &Arc<ThroughputHistory> {
        &self.throughput
    }

    /// Downloads one segment.
    ///
    /// Returns [`DashError::Cancelled`] as soon as `token` fires, and
    /// [`DashError::DownloadFailed`] once the attempts are used up.
    pub async fn download(
        &self,
        request: DownloadRequest,
        token: &CancellationToken,
    ) -> DashResult<DownloadResponse> {
        let data = match request.deadline {
            Some(deadline) => {
                match tokio::time::timeout(deadline, self.download_with_retries(&request, token))
                    .await
                {
                    Ok(result) => result?,
                    Err(_) => {
                        tracing::warn!(segment = %request.segment, ?deadline, "Download deadline exceeded");
                        return Err(DashError::DownloadFailed {
                            segment: request.segment.to_string(),
                            attempts: 0,
                            source: Box::new(DashError::Timeout),
                        });
                    }
                }
            }
            None => self.download_with_retries(&request, token).await?,
        };

        Ok(DownloadResponse {
            segment: request.segment,
            stream_type: request.stream_type,
            data,
        })
    }

    async fn download_with_retries(
        &self,
        request: &DownloadRequest,
        token: &CancellationToken,
    ) -> DashResult<Bytes> {
        let mut failures = 0;
        loop {
            let error = match self.fetch(request, token).await {
                Ok(data) => return Ok(data),
                Err(DashError::Cancelled) => return Err(DashError::Cancelled),
                Err(e) => e,
            };

            failures += 1;
            let retry = request.ignore_error && error.is_transient() && failures < self.attempts;
            tracing::warn!(
                stream = %request.stream_type,
                segment = %request.segment,
                attempt = failures,
                retry,
                error = %error,
                "Segment download failed"
            );
            if !retry {
                return Err(DashError::DownloadFailed {
                    segment: request.segment.to_string(),
                    attempts: failures,
                    source: Box::new(error),
                });
            }

            let delay = backoff_delay(failures, self.backoff_unit);
            tokio::select! {
                _ = token.cancelled() => return Err(DashError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn fetch(&self, request: &DownloadRequest, token: &CancellationToken) -> DashResult<Bytes> {
        let segment = &request.segment;
        let mut builder = self.client.get(segment.url.clone()).timeout(self.timeout);
        if let Some(range) = &segment.byte_range {
            builder = builder.header(reqwest::header::RANGE, range.to_http_range());
        }

        let started = Instant::now();
        let transfer = async {
            let response = builder.send().await?;
            if !response.status().is_success() {
                return Err(DashError::HttpError(response.status()));
            }
            let mut body = BytesMut::with_capacity(preallocation(response.content_length()));
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.try_next().await? {
                body.extend_from_slice(&chunk);
            }
            Ok::<_, DashError>(body.freeze())
        };
        let data = tokio::select! {
            _ = token.cancelled() => return Err(DashError::Cancelled),
            data = transfer => data?,
        };

        self.throughput.push(data.len(), started.elapsed());
        tracing::debug!(%segment, bytes = data.len(), elapsed = ?started.elapsed(), "Segment downloaded");
        Ok(data)
    }
}

/// Randomized delay after `failures` failed attempts, drawn from
/// `[(n-1), n²-(n-1))` backoff units.
fn backoff_delay(failures: u32, unit: Duration) -> Duration {
    let n = u64::from(failures.max(1));
    let unit = unit.as_nanos() as u64;
    let low = (n - 1) * unit;
    let high = (n * n - (n - 1)) * unit;
    if high <= low {
        return Duration::from_nanos(low);
    }
    Duration::from_nanos(rand::thread_rng().gen_range(low..high))
}

fn preallocation(content_length: Option<u64>) -> usize {
    content_length.unwrap_or(0).min(MAX_PREALLOCATION) as usize
}
