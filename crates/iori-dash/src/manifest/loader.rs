use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{clock::Clock, Document};
use crate::{
    config::DashConfig,
    error::{DashError, DashResult},
    util::http::HttpClient,
};

/// Downloads and parses the MPD, and tracks whether a reload brought new
/// content.
pub struct ManifestLoader {
    client: HttpClient,
    url: Url,
    config: Arc<DashConfig>,

    clock: Clock,
    clock_synced: bool,

    document: Option<Arc<Document>>,
    publish_time: Option<DateTime<Utc>>,
    has_changed: bool,
}

impl ManifestLoader {
    pub fn new(client: HttpClient, url: Url, config: Arc<DashConfig>) -> Self {
        Self {
            client,
            url,
            config,
            clock: Clock::new(),
            clock_synced: false,
            document: None,
            publish_time: None,
            has_changed: false,
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn document(&self) -> Option<Arc<Document>> {
        self.document.clone()
    }

    /// Whether the last successful reload carried a newer publish time.
    pub fn has_changed(&self) -> bool {
        self.has_changed
    }

    /// Makes the next successful reload count as changed.
    pub fn force_changed_on_next_reload(&mut self) {
        self.publish_time = None;
    }

    /// Delay before the next reload of a dynamic manifest.
    pub fn reload_due_time(&self) -> Duration {
        self.document
            .as_ref()
            .and_then(|document| document.parameters.minimum_update_period)
            .filter(|period| !period.is_zero())
            .unwrap_or(self.config.manifest_reload_delay)
    }

    pub async fn reload(&mut self, token: &CancellationToken) -> DashResult<Arc<Document>> {
        let Some(text) = self.download(token).await else {
            if token.is_cancelled() {
                return Err(DashError::Cancelled);
            }
            return Err(DashError::ManifestUnavailable(self.url.to_string()));
        };

        let mpd = dash_mpd::parse(&text)?;
        if mpd.mpdtype.as_deref() == Some("dynamic") && !self.clock_synced {
            if let Err(e) = self.clock.sync(&mpd.UTCTiming, &self.client).await {
                tracing::warn!(error = %e, "Falling back to local clock");
            }
            self.clock_synced = true;
        }

        let document = Arc::new(Document::from_mpd(&mpd, &self.url, self.clock.offset())?);
        self.has_changed = match (self.publish_time, document.publish_time()) {
            (Some(previous), Some(current)) => current > previous,
            _ => true,
        };
        self.publish_time = document.publish_time();
        tracing::debug!(
            dynamic = document.is_dynamic(),
            periods = document.periods.len(),
            changed = self.has_changed,
            "Manifest loaded"
        );

        self.document = Some(document.clone());
        Ok(document)
    }

    /// Fetches the manifest text. Failures are logged and turn into `None`.
    async fn download(&mut self, token: &CancellationToken) -> Option<String> {
        let attempts = self.config.manifest_retries.max(1);
        for attempt in 1..=attempts {
            let result = tokio::select! {
                _ = token.cancelled() => return None,
                result = self.fetch() => result,
            };

            match result {
                Ok((text, final_url)) => {
                    if final_url != self.url {
                        tracing::debug!(from = %self.url, to = %final_url, "Manifest redirected");
                        self.url = final_url;
                    }
                    return Some(text);
                }
                Err(e) => {
                    tracing::warn!(url = %self.url, attempt, error = %e, "Manifest download failed");
                }
            }

            if attempt < attempts {
                tokio::select! {
                    _ = token.cancelled() => return None,
                    _ = tokio::time::sleep(self.config.manifest_retry_delay) => {}
                }
            }
        }
        None
    }

    async fn fetch(&self) -> DashResult<(String, Url)> {
        let response = self
            .client
            .get(self.url.clone())
            .header(
                reqwest::header::ACCEPT,
                "application/dash+xml,video/vnd.mpeg.dash.mpd",
            )
            .timeout(self.config.manifest_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DashError::HttpError(response.status()));
        }

        let final_url = response.url().clone();
        Ok((response.text().await?, final_url))
    }
}
