use std::{sync::Arc, time::Duration};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    config::DashConfig,
    error::DashError,
    event::{EventSender, PlayerEvent},
    manifest::{Document, ManifestLoader},
    pipeline::MediaPipeline,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Loading,
    Applying,
    Sleeping,
    Terminal,
}

/// Keeps the pipelines fed with the periods of the manifest.
///
/// A static manifest is applied once. A dynamic one is reloaded every
/// `minimumUpdatePeriod` and applied whenever its publish time moves.
pub struct ManifestRefresher {
    loader: ManifestLoader,
    pipelines: Vec<Arc<MediaPipeline>>,
    events: EventSender,
    config: Arc<DashConfig>,

    playback_time: watch::Receiver<Duration>,
    document: watch::Sender<Option<Arc<Document>>>,

    state: RefreshState,
    applied: bool,
    misses: u32,
    clip_duration: Option<Duration>,
}

impl ManifestRefresher {
    pub fn new(
        loader: ManifestLoader,
        pipelines: Vec<Arc<MediaPipeline>>,
        events: EventSender,
        config: Arc<DashConfig>,
        playback_time: watch::Receiver<Duration>,
    ) -> Self {
        Self {
            loader,
            pipelines,
            events,
            config,
            playback_time,
            document: watch::Sender::new(None),
            state: RefreshState::Idle,
            applied: false,
            misses: 0,
            clip_duration: None,
        }
    }

    /// The last applied document.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Document>>> {
        self.document.subscribe()
    }

    pub fn state(&self) -> RefreshState {
        self.state
    }

    /// Runs the loop on a new task.
    pub fn spawn(self, token: CancellationToken) -> tokio::task::JoinHandle<RefreshState> {
        let span = tracing::info_span!("manifest_refresh", url = %self.loader.url());
        tokio::spawn(self.run(token).instrument(span))
    }

    pub async fn run(mut self, token: CancellationToken) -> RefreshState {
        while self.state != RefreshState::Terminal {
            self.state = RefreshState::Loading;
            match self.loader.reload(&token).await {
                Ok(document) => {
                    self.state = RefreshState::Applying;
                    self.process(document);
                }
                Err(DashError::Cancelled) => break,
                Err(e) => self.on_load_error(e),
            }

            if self.state == RefreshState::Terminal || token.is_cancelled() {
                break;
            }

            self.state = RefreshState::Sleeping;
            let delay = self.loader.reload_due_time();
            tracing::trace!(?delay, "Waiting for next manifest reload");
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::debug!(state = ?self.state, "Manifest refresh finished");
        self.state
    }

    fn on_load_error(&mut self, error: DashError) {
        self.loader.force_changed_on_next_reload();

        // Any earlier successful load counts, applied or not.
        let live = self
            .loader
            .document()
            .is_some_and(|document| document.is_dynamic());
        if live {
            tracing::warn!(error = %error, "Manifest reload failed, keeping previous document");
            return;
        }

        tracing::error!(error = %error, "Manifest unavailable");
        self.events.send(PlayerEvent::StreamError(error.to_string()));
        self.state = RefreshState::Terminal;
    }

    fn process(&mut self, document: Arc<Document>) {
        let time = document.presentation_time(*self.playback_time.borrow());
        let Some(period) = document.find_period(time) else {
            self.loader.force_changed_on_next_reload();
            self.misses += 1;
            if document.is_dynamic() {
                tracing::warn!(?time, misses = self.misses, "No period covers the live edge");
            } else if self.misses >= self.config.max_period_misses {
                tracing::error!(?time, misses = self.misses, "No period covers the start position");
                self.events.send(PlayerEvent::StreamError(format!(
                    "no period found at {time:?} after {} attempts",
                    self.misses
                )));
                self.state = RefreshState::Terminal;
            } else {
                tracing::warn!(?time, misses = self.misses, "No period covers the start position");
            }
            return;
        };
        self.misses = 0;

        if self.applied && !self.loader.has_changed() {
            tracing::debug!("Manifest unchanged");
            return;
        }

        let mut active = 0;
        let mut candidates = 0;
        for pipeline in &self.pipelines {
            if pipeline.is_deactivated() {
                continue;
            }
            candidates += 1;
            match pipeline.update_media(period) {
                Ok(()) => active += 1,
                Err(e) => {
                    tracing::debug!(stream = %pipeline.stream_type(), error = %e, "Stream not present in period")
                }
            }
        }
        if candidates > 0 && active == 0 {
            tracing::error!(period = ?period.id, "Period has no playable media");
            self.events.send(PlayerEvent::StreamError(
                "period has no playable media".to_string(),
            ));
            self.state = RefreshState::Terminal;
            return;
        }

        self.document.send_replace(Some(document.clone()));
        if let Some(duration) = document.parameters.presentation_duration {
            if self.clip_duration != Some(duration) {
                self.clip_duration = Some(duration);
                self.events.send(PlayerEvent::ClipDurationChanged(duration));
            }
        }

        if !self.applied {
            let pipelines: Vec<&MediaPipeline> = self.pipelines.iter().map(Arc::as_ref).collect();
            MediaPipeline::align_start(&pipelines);

            self.applied = true;
            self.events.send(PlayerEvent::PlayReady);
            for pipeline in &self.pipelines {
                if let Err(e) = pipeline.switch_stream_if_needed() {
                    tracing::warn!(stream = %pipeline.stream_type(), error = %e, "Failed to start stream");
                }
            }
        }
        tracing::info!(period = ?period.id, dynamic = document.is_dynamic(), "Manifest applied");

        if !document.is_dynamic() {
            self.state = RefreshState::Terminal;
        }
    }
}
