use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    client::DashClient,
    config::DashConfig,
    download::SegmentDownloader,
    error::{DashError, DashResult},
    event::{EventReceiver, EventSender, PlayerEvent},
    manifest::{Document, ManifestLoader},
    pipeline::MediaPipeline,
    refresh::{ManifestRefresher, RefreshState},
    selector::{RepresentationSelector, StreamDescription, StreamGroup, StreamSelection},
    sink::MediaSink,
    throughput::ThroughputHistory,
    util::http::HttpClient,
    StreamType,
};

pub struct DashPlayerBuilder {
    url: Url,
    config: DashConfig,
    client: Option<HttpClient>,
    throughput: Option<Arc<ThroughputHistory>>,
}

impl DashPlayerBuilder {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            config: DashConfig::default(),
            client: None,
            throughput: None,
        }
    }

    pub fn config(mut self, config: DashConfig) -> Self {
        self.config = config;
        self
    }

    pub fn http_client(mut self, client: HttpClient) -> Self {
        self.client = Some(client);
        self
    }

    /// Shares a throughput history with other players.
    pub fn throughput(mut self, throughput: Arc<ThroughputHistory>) -> Self {
        self.throughput = Some(throughput);
        self
    }

    pub fn build(
        self,
        audio_sink: Arc<dyn MediaSink>,
        video_sink: Arc<dyn MediaSink>,
    ) -> (DashPlayer, EventReceiver) {
        let config = Arc::new(self.config);
        let client = self.client.unwrap_or_default();
        let throughput = self.throughput.unwrap_or_default();
        let downloader = SegmentDownloader::from_config(client.clone(), throughput.clone(), &config);
        let (events, receiver) = EventSender::channel();

        let pipeline = |stream_type: StreamType, sink: Arc<dyn MediaSink>, adaptive: bool| {
            let selection = if adaptive {
                StreamSelection::adaptive(stream_type, throughput.clone())
            } else {
                StreamSelection::new(stream_type, throughput.clone(), None)
            };
            let client = DashClient::new(
                stream_type,
                downloader.clone(),
                sink,
                events.clone(),
                config.clone(),
            );
            Arc::new(MediaPipeline::new(client, Arc::new(selection)))
        };
        let audio = pipeline(StreamType::Audio, audio_sink, config.adaptive_audio);
        let video = pipeline(StreamType::Video, video_sink, true);

        let (playback_time, playback_receiver) = watch::channel(Duration::ZERO);
        let refresher = ManifestRefresher::new(
            ManifestLoader::new(client, self.url, config.clone()),
            vec![video.clone(), audio.clone()],
            events.clone(),
            config.clone(),
            playback_receiver,
        );

        let player = DashPlayer {
            audio,
            video,
            events,
            config,
            document: refresher.subscribe(),
            playback_time,
            refresher: Mutex::new(Some(refresher)),
            refresh_task: Mutex::new(None),
            token: CancellationToken::new(),
            subtitles: Mutex::new(SubtitleState::default()),
        };
        (player, receiver)
    }
}

/// Subtitle streams are listed and selected but not downloaded.
#[derive(Debug, Default)]
struct SubtitleState {
    selected: Option<String>,
    deactivated: bool,
}

/// Application facing control surface of one presentation.
pub struct DashPlayer {
    audio: Arc<MediaPipeline>,
    video: Arc<MediaPipeline>,
    events: EventSender,
    config: Arc<DashConfig>,

    document: watch::Receiver<Option<Arc<Document>>>,
    playback_time: watch::Sender<Duration>,

    refresher: Mutex<Option<ManifestRefresher>>,
    refresh_task: Mutex<Option<JoinHandle<RefreshState>>>,
    token: CancellationToken,
    subtitles: Mutex<SubtitleState>,
}

impl DashPlayer {
    pub fn builder(url: Url) -> DashPlayerBuilder {
        DashPlayerBuilder::new(url)
    }

    fn pipelines(&self) -> [&Arc<MediaPipeline>; 2] {
        [&self.video, &self.audio]
    }

    fn pipeline(&self, stream_type: StreamType) -> Option<&Arc<MediaPipeline>> {
        match stream_type {
            StreamType::Audio => Some(&self.audio),
            StreamType::Video => Some(&self.video),
            StreamType::Subtitle => None,
        }
    }

    fn subtitles(&self) -> std::sync::MutexGuard<'_, SubtitleState> {
        self.subtitles.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts loading the manifest. Downloads begin once it is applied, which
    /// is announced with [`PlayerEvent::PlayReady`].
    pub fn start(&self) {
        let Some(refresher) = self
            .refresher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            tracing::debug!("Player already started");
            return;
        };

        let handle = refresher.spawn(self.token.child_token());
        *self
            .refresh_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub async fn stop(&self) {
        self.token.cancel();
        let task = self
            .refresh_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            match task.await {
                Ok(state) => tracing::debug!(?state, "Manifest refresh stopped"),
                Err(e) => tracing::error!(error = %e, "Manifest refresh panicked"),
            }
        }

        for pipeline in self.pipelines() {
            pipeline.stop().await;
        }
        tracing::info!("Player stopped");
    }

    pub fn on_time_updated(&self, playback_time: Duration) {
        self.playback_time.send_replace(playback_time);
        for pipeline in self.pipelines() {
            if pipeline.is_active() {
                pipeline.on_time_updated(playback_time);
            }
        }
    }

    /// The document currently applied, if any.
    pub fn document(&self) -> Option<Arc<Document>> {
        self.document.borrow().clone()
    }

    pub fn is_seeking_supported(&self) -> bool {
        self.document().is_some_and(|document| !document.is_dynamic())
    }

    pub fn get_stream_groups(&self) -> Vec<StreamGroup> {
        let mut groups: Vec<_> = self
            .pipelines()
            .into_iter()
            .filter(|pipeline| pipeline.is_active())
            .map(|pipeline| pipeline.stream_group())
            .collect();
        groups.extend(self.subtitle_group());
        groups
    }

    /// Text streams of the current period, in manifest order.
    fn subtitle_group(&self) -> Option<StreamGroup> {
        let subtitles = self.subtitles();
        if subtitles.deactivated {
            return None;
        }

        let document = self.document()?;
        let period = document.find_period(document.presentation_time(*self.playback_time.borrow()))?;
        let streams: Vec<_> = period
            .adaptation_sets(StreamType::Subtitle)
            .flat_map(|set| set.representations.iter())
            .enumerate()
            .map(|(index, representation)| StreamDescription::new(index, representation))
            .collect();
        if streams.is_empty() {
            return None;
        }

        Some(StreamGroup {
            stream_type: StreamType::Subtitle,
            selected: subtitles
                .selected
                .as_deref()
                .and_then(|id| streams.iter().position(|stream| stream.id == id)),
            streams,
        })
    }

    /// Stops one stream for the rest of the presentation. Its sink receives
    /// end of stream if it already got data.
    pub async fn deactivate_stream(&self, stream_type: StreamType) {
        match self.pipeline(stream_type) {
            Some(pipeline) => pipeline.deactivate().await,
            None => {
                let mut subtitles = self.subtitles();
                subtitles.deactivated = true;
                subtitles.selected = None;
                tracing::info!(stream = %stream_type, "Stream deactivated");
            }
        }
    }

    /// Installs a selector per group. A non-adaptive selector switches its
    /// stream right away and pins it.
    pub async fn set_stream_groups(
        &self,
        groups: &[StreamGroup],
        selectors: Vec<Arc<dyn RepresentationSelector>>,
    ) -> DashResult<()> {
        for (group, selector) in groups.iter().zip(selectors) {
            let Some(pipeline) = self.pipeline(group.stream_type) else {
                self.select_subtitle(selector.as_ref())?;
                continue;
            };
            if pipeline.is_deactivated() {
                return Err(DashError::StreamDeactivated(group.stream_type));
            }
            pipeline.set_selector(Some(selector.clone()));
            if selector.is_adaptive() {
                continue;
            }

            let current = pipeline.stream_group();
            let index = selector
                .select(&current)
                .ok_or(DashError::InvalidStreamIndex(current.streams.len()))?;
            if current.selected != Some(index) {
                pipeline.change_stream(index).await?;
            }
        }
        Ok(())
    }

    fn select_subtitle(&self, selector: &dyn RepresentationSelector) -> DashResult<()> {
        let current = self
            .subtitle_group()
            .ok_or(DashError::NoMediaInPeriod(StreamType::Subtitle))?;
        let stream = selector
            .select(&current)
            .and_then(|index| current.streams.get(index))
            .ok_or(DashError::InvalidStreamIndex(current.streams.len()))?;
        tracing::info!(id = %stream.id, "Subtitle selected");
        self.subtitles().selected = Some(stream.id.clone());
        Ok(())
    }

    /// Moves playback of all active streams to `position`.
    ///
    /// Returns the position playback resumes from: the start of the video
    /// segment covering `position`. Audio follows that resolved time.
    pub async fn seek(&self, position: Duration) -> DashResult<Duration> {
        if !self.is_seeking_supported() {
            return Err(DashError::SeekNotSupported);
        }

        let timeout = self.config.seek_timeout;
        match tokio::time::timeout(timeout, self.seek_pipelines(position)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(?position, ?timeout, "Seek timed out");
                for pipeline in self.pipelines() {
                    pipeline.stop().await;
                }
                self.events
                    .send(PlayerEvent::StreamError(format!("seek to {position:?} timed out")));
                Err(DashError::SeekTimeout(timeout))
            }
        }
    }

    async fn seek_pipelines(&self, position: Duration) -> DashResult<Duration> {
        let active: Vec<_> = self
            .pipelines()
            .into_iter()
            .filter(|pipeline| pipeline.is_active())
            .collect();
        for pipeline in &active {
            pipeline.pause().await;
        }

        let mut target = position;
        let mut exact = true;
        for pipeline in &active {
            let resolution = pipeline.seek(target);
            // Video leads; audio follows the resolved time.
            if pipeline.stream_type() == StreamType::Video || active.len() == 1 {
                target = resolution.position;
                exact = resolution.exact;
            }
        }

        self.playback_time.send_replace(target);
        for pipeline in &active {
            pipeline.resume()?;
        }

        if !exact {
            tracing::warn!(?position, "Seek position not covered by any segment");
            return Err(DashError::SeekUnresolved(position));
        }
        tracing::info!(?position, resolved = ?target, "Seek completed");
        Ok(target)
    }
}
